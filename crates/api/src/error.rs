// HTTP rendering of core errors
// Decision: Status comes from the error's own status when set, otherwise from its kind

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bulwark_resilience::{ErrorKind, ResilienceError};

/// Error returned by handlers and the admission middleware
#[derive(Debug)]
pub struct ApiError(pub ResilienceError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        if let Some(status) = self.0.status.and_then(|s| StatusCode::from_u16(s).ok()) {
            return status;
        }
        match self.0.kind {
            ErrorKind::Validation | ErrorKind::Client => StatusCode::BAD_REQUEST,
            ErrorKind::RateLimit | ErrorKind::Rejected => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::CircuitOpen | ErrorKind::BudgetExhausted | ErrorKind::Aborted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::Network | ErrorKind::Server => StatusCode::BAD_GATEWAY,
            ErrorKind::Configuration | ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ResilienceError> for ApiError {
    fn from(err: ResilienceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(code = %self.0.code, error = %self.0, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_json() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err = ApiError(ResilienceError::validation("bad"));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err = ApiError(ResilienceError::rejected("full").with_status(503));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        let err = ApiError(ResilienceError::timeout("slow"));
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
