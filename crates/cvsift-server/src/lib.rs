// HTTP control surface for the batch engine.
//
// The server binds the controller operations to routes, runs the watchdog
// alongside the listener, and respawns worker loops for batches a previous
// process left running. Observers poll the persisted state through the
// snapshot routes; the engine streams nothing.

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cvsift_config::RuntimeConfig;
use cvsift_engine::{Engine, EngineError};
use serde_json::json;
use tokio::signal;
use tracing::{error, info};

mod handlers;
mod init;

use handlers::{
    control_batch, create_batch, get_batch, health_check, list_items, ready_check, teardown_batch,
};
use init::{init_analyzer, init_object_store, init_tracing};

/// Application state shared across all requests
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

/// Error type that implements IntoResponse
pub struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("Request error: {:?}", self.error);
        (
            self.status,
            Json(json!({
                "error": self.error.to_string(),
            })),
        )
            .into_response()
    }
}

impl AppError {
    pub fn with_status(status: StatusCode, error: anyhow::Error) -> Self {
        Self { status, error }
    }

    pub fn bad_request(error: anyhow::Error) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, error)
    }

    pub fn internal(error: anyhow::Error) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, error)
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::Forbidden(_) => StatusCode::FORBIDDEN,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::IllegalState { .. } => StatusCode::CONFLICT,
            EngineError::Store(_) => StatusCode::BAD_GATEWAY,
        };
        Self::with_status(status, err.into())
    }
}

/// Build the router for an engine (shared by the binary and tests).
pub fn router(engine: Engine, max_payload_bytes: usize) -> Router {
    let state = AppState { engine };
    Router::new()
        .route("/v1/batches", post(create_batch))
        .route("/v1/batches/:batch_id", get(get_batch).delete(teardown_batch))
        .route("/v1/batches/:batch_id/control", post(control_batch))
        .route("/v1/batches/:batch_id/items", get(list_items))
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .layer(DefaultBodyLimit::max(max_payload_bytes))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

/// Entry point for the server
pub async fn run_with_config(config: RuntimeConfig) -> Result<()> {
    init_tracing(&config);

    let server = config
        .server
        .clone()
        .context("server configuration required")?;

    let objects = init_object_store(&config)?;
    let analyzer = init_analyzer(&config)?;
    let state_store = std::sync::Arc::new(cvsift_store::MemoryStateStore::new());
    let engine = Engine::new(state_store, objects, analyzer, config.engine.clone());

    // Crash recovery: batches left running get their worker loops back, and
    // the watchdog patrols leases for the life of the process.
    engine.respawn_workers().await?;
    tokio::spawn(engine.clone().run_watchdog());

    let app = router(engine, server.max_payload_bytes);

    let listener = tokio::net::TcpListener::bind(&server.listen_addr)
        .await
        .context(format!("Failed to bind to {}", server.listen_addr))?;

    info!("cvsift control surface listening on http://{}", server.listen_addr);
    info!("Routes:");
    info!("  POST   /v1/batches              - create a batch");
    info!("  POST   /v1/batches/:id/control  - pause | resume | cancel");
    info!("  GET    /v1/batches/:id          - batch snapshot");
    info!("  GET    /v1/batches/:id/items    - item snapshots");
    info!("  DELETE /v1/batches/:id          - teardown");
    info!("Press Ctrl+C or send SIGTERM to stop");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");

    Ok(())
}
