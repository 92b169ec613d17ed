//! Status and control HTTP API
//!
//! Read-only status snapshots plus a restart trigger, served with axum.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::reconcile::WorkerManager;
use crate::status::StatusRecord;

/// Errors that can occur when running the API server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// Handler for GET /api/status
async fn get_all_statuses(
    State(manager): State<Arc<WorkerManager>>,
) -> Json<BTreeMap<String, StatusRecord>> {
    Json(manager.get_all_statuses())
}

/// Handler for GET /api/status/:name, `UNKNOWN` for unmanaged names
async fn get_status(
    State(manager): State<Arc<WorkerManager>>,
    Path(name): Path<String>,
) -> Json<StatusRecord> {
    Json(manager.get_status(&name))
}

/// Handler for POST /api/restart/:name
async fn restart(
    State(manager): State<Arc<WorkerManager>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if manager.restart_worker(&name).await {
        (
            StatusCode::OK,
            Json(json!({ "message": format!("Camera '{}' is restarting.", name) })),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!("Camera '{}' not found or could not be restarted.", name)
            })),
        )
    }
}

/// Creates the axum Router with the status and restart endpoints
pub fn create_api_router(manager: Arc<WorkerManager>) -> Router {
    Router::new()
        .route("/api/status", get(get_all_statuses))
        .route("/api/status/:name", get(get_status))
        .route("/api/restart/:name", post(restart))
        .with_state(manager)
}

/// Serve the API on `bind` until `shutdown` is cancelled
pub async fn run_api_server(
    manager: Arc<WorkerManager>,
    bind: &str,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let app = create_api_router(manager);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    info!(addr = %bind, "Status API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(ServerError::Serve)
}
