//! The `/health` HTTP endpoint: a liveness probe that also reports queue
//! depth and dispatcher backlog, so an operator's monitoring can distinguish
//! "up" from "up but backed up."

use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing::get, Json, Router};
use log::{error, info};
use serde::Serialize;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::queue::FileQueue;
use crate::webhook::Dispatcher;

/// Handles the queue/dispatcher lookups the health handler needs, shared
/// across requests via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<FileQueue>,
    pub dispatcher: Arc<Dispatcher>,
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    #[serde(rename = "queueDepth")]
    queue_depth: usize,
    #[serde(rename = "dispatcherPending")]
    dispatcher_pending: usize,
}

async fn health_check_handler(State(state): State<AppState>) -> impl IntoResponse {
    let queue_depth = state.queue.list_ids().map(|ids| ids.len()).unwrap_or(0);
    let report = HealthReport {
        status: "ok",
        queue_depth,
        dispatcher_pending: state.dispatcher.pending_count(),
    };
    (StatusCode::OK, Json(report))
}

/// Binds the configured address/port and serves `/health` until the process
/// stops.
pub async fn run_health_server(config: Arc<Config>, state: AppState) -> Result<()> {
    let app = Router::new().route("/health", get(health_check_handler)).with_state(state);

    let addr_str = format!("{}:{}", config.health_check_bind_address, config.health_check_port);
    let listener = TcpListener::bind(&addr_str).await.map_err(|e| {
        error!("failed to bind health check server to {addr_str}: {e}");
        anyhow::anyhow!("failed to bind health check server: {e}")
    })?;

    info!("health check server listening on {addr_str}");

    axum::serve(listener, app).await.map_err(|e| {
        error!("health check server error: {e}");
        anyhow::anyhow!("health check server failed: {e}")
    })?;

    Ok(())
}
