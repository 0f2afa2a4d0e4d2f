//! Reload Route

use axum::{extract::State, Json};
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::{ApiError, AppState};

/// Summary of the synchronization pass a reload ran
#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub entities: usize,
    pub skipped: usize,
    pub connections: usize,
    pub connections_opened: usize,
    pub connections_closed: usize,
    pub connections_failed: usize,
    pub subscribed: usize,
    pub unsubscribed: usize,
}

/// Resynchronize subscriptions with the configuration store now
pub async fn post_reload(State(state): State<Arc<AppState>>) -> Result<Json<ReloadResponse>, ApiError> {
    counter!("api_reload_requests_total").increment(1);
    let report = state.bridge.reload().await?;
    info!(entities = report.entities, "Reload complete");

    Ok(Json(ReloadResponse {
        entities: report.entities,
        skipped: report.skipped,
        connections: state.bridge.status().connections,
        connections_opened: report.connections.opened,
        connections_closed: report.connections.closed,
        connections_failed: report.connections.failed,
        subscribed: report.subscribed,
        unsubscribed: report.unsubscribed,
    }))
}
