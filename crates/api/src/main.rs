// Bulwark API server
// Decision: One engine, one limiter and one pool per process, built here and shared through AppState
// Decision: All /v1 routes pass the admission middleware; /health does not

mod admission;
mod error;
mod status;
mod tasks;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, middleware, routing::get, Json, Router};
use bulwark_resilience::worker::WorkerPoolState;
use bulwark_resilience::{AdmissionController, CoreConfig, ResilienceError, RetryEngine, WorkerPool};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default listen address
const DEFAULT_ADDR: &str = "0.0.0.0:9100";

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub engine: RetryEngine,
    pub limiter: AdmissionController,
    pub pool: Arc<WorkerPool>,
}

impl AppState {
    /// Build every component from startup configuration
    pub fn from_config(config: &CoreConfig) -> Result<Self, ResilienceError> {
        let pool = WorkerPool::new(config.worker_pool.clone())?;
        tasks::register_builtin_handlers(&pool);

        Ok(Self {
            engine: RetryEngine::with_policies(config.policy_registry()),
            limiter: AdmissionController::new(config.admission_config()),
            pool: Arc::new(pool),
        })
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    workers: WorkerPoolState,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        workers: state.pool.status().state,
    })
}

/// Build the router (extracted for testing)
fn build_app(state: AppState) -> Router {
    let api_routes = Router::new()
        .merge(status::routes())
        .merge(tasks::routes())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admission::admission_layer,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(api_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "bulwark_api=debug,bulwark_resilience=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("bulwark-api starting...");

    let config = CoreConfig::from_env().context("Invalid configuration")?;
    tracing::info!(
        min_workers = config.worker_pool.min_workers,
        max_workers = config.worker_pool.max_workers,
        rate_limited_endpoints = config.rate_limits.len(),
        retry_overrides = config.retry_overrides.len(),
        "Configuration loaded"
    );

    let state = AppState::from_config(&config).context("Failed to build core components")?;
    state.pool.start().context("Failed to start worker pool")?;

    let app = build_app(state.clone());

    let addr = std::env::var("BULWARK_API_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Err(e) = state.pool.shutdown().await {
        tracing::warn!(error = %e, "Worker pool did not drain cleanly");
    }

    Ok(())
}
