//! Alert Routes

use alerting::AlertLevel;
use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{ApiError, AppState};

/// Query parameters for alerts endpoint
#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    /// Filter by state (`normal`, `low`, `high`)
    pub state: Option<String>,
    /// Only entities currently in alert
    #[serde(default)]
    pub active: bool,
    /// Maximum number of records
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// Alert state of one entity
#[derive(Debug, Serialize)]
pub struct AlertRecord {
    pub entity_id: String,
    pub state: AlertLevel,
    pub last_transition: Option<DateTime<Utc>>,
}

/// Response for alerts endpoint
#[derive(Debug, Serialize)]
pub struct AlertResponse {
    pub data: Vec<AlertRecord>,
    pub count: usize,
    pub active_count: usize,
}

/// In-memory alert state of every evaluated entity
pub async fn get_alerts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AlertQuery>,
) -> Result<Json<AlertResponse>, ApiError> {
    let level = params
        .state
        .as_deref()
        .map(str::parse::<AlertLevel>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let states = state.bridge.alert_states();
    let active_count = states.iter().filter(|(_, s)| s.level.is_alert()).count();

    let data: Vec<AlertRecord> = states
        .into_iter()
        .filter(|(_, s)| level.map_or(true, |level| s.level == level))
        .filter(|(_, s)| !params.active || s.level.is_alert())
        .take(params.limit)
        .map(|(entity_id, s)| AlertRecord {
            entity_id,
            state: s.level,
            last_transition: s.last_transition,
        })
        .collect();

    Ok(Json(AlertResponse {
        count: data.len(),
        data,
        active_count,
    }))
}
