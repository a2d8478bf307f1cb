// Admission middleware
// Decision: Every /v1 route is its own admission endpoint, keyed by the matched route path
// Decision: X-Priority selects the queue priority; a missing header means medium

use axum::{
    extract::{MatchedPath, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use bulwark_resilience::admission::RateLimitHeaders;
use bulwark_resilience::{Priority, ResilienceError};

use crate::error::ApiError;
use crate::AppState;

/// Request header carrying the caller's priority
pub const X_PRIORITY: &str = "x-priority";

/// Admit the request or answer 429
pub async fn admission_layer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let priority = match priority_from_headers(request.headers()) {
        Ok(priority) => priority,
        Err(err) => return ApiError(err).into_response(),
    };

    let cost = state
        .limiter
        .estimate_cost(&endpoint, content_length(request.headers()));
    let max_retries = state.limiter.config().default_max_retries;

    if let Err(err) = state
        .limiter
        .request_permission(&endpoint, cost, priority, max_retries)
        .await
    {
        let headers = RateLimitHeaders::rejected(&err).merge(state.limiter.rate_limit_headers(&endpoint));
        let mut response = ApiError(err).into_response();
        apply_headers(&mut response, &headers);
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(&mut response, &state.limiter.rate_limit_headers(&endpoint));
    response
}

fn priority_from_headers(headers: &HeaderMap) -> Result<Priority, ResilienceError> {
    let Some(value) = headers.get(X_PRIORITY) else {
        return Ok(Priority::default());
    };
    value
        .to_str()
        .map_err(|_| ResilienceError::validation("X-Priority header is not valid text"))?
        .parse()
}

fn content_length(headers: &HeaderMap) -> usize {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn apply_headers(response: &mut Response, headers: &RateLimitHeaders) {
    for (name, value) in headers.to_pairs() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(name), value);
        }
    }
}
