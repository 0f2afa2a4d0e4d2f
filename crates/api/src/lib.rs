//! Telemetry Bridge Server
//!
//! Process wiring for the bridge plus a small operator HTTP surface.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bridge::{Bridge, BridgeDeps, BridgeError, BridgeStatus, MqttSettings, MqttTransport};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use storage::SqliteStore;
use thiserror::Error;
use tower_governor::GovernorLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

pub mod rate_limit;
pub mod routes;
pub mod settings;

use rate_limit::{create_governor_config, RateLimitConfig};
pub use settings::{LoggingSettings, Settings};

/// Application state shared across handlers
pub struct AppState {
    pub bridge: Arc<Bridge>,
    /// Prometheus render handle
    pub metrics: PrometheusHandle,
    /// Version string
    pub version: String,
    /// Start time
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(bridge: Arc<Bridge>, metrics: PrometheusHandle) -> Self {
        Self {
            bridge,
            metrics,
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: std::time::Instant::now(),
        }
    }
}

/// Handler errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Bridge(BridgeError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Bridge(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub bridge: BridgeStatus,
}

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Result<Router> {
    let governor = create_governor_config(&RateLimitConfig::reload()).context("Invalid reload rate limit")?;

    let reload = Router::new()
        .route("/api/v1/reload", post(routes::reload::post_reload))
        .layer(GovernorLayer { config: governor });

    Ok(Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/alerts", get(routes::alerts::get_alerts))
        .route("/metrics", get(routes::metrics::get_metrics))
        .merge(reload)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let bridge = state.bridge.status();
    let status = if bridge.running { "healthy" } else { "stopped" };

    Json(HealthResponse {
        status: status.to_string(),
        timestamp,
        version: state.version.clone(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        bridge,
    })
}

/// Initialize logging
pub fn init_logging(settings: &LoggingSettings) -> Result<()> {
    let level: Level = settings.level.parse().unwrap_or(Level::INFO);
    let builder = FmtSubscriber::builder().with_max_level(level).with_target(true);

    let result = if settings.json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    result.context("Failed to set tracing subscriber")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Wire the bridge to its stores and transports and serve until shutdown
pub async fn run(settings: Settings) -> Result<()> {
    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    let store = Arc::new(
        SqliteStore::connect(&settings.database.url)
            .await
            .with_context(|| format!("Failed to open database {}", settings.database.url))?,
    );
    let push = settings.push.transport(settings.bridge.push_timeout())?;
    let transport = Arc::new(MqttTransport::new(MqttSettings::from(&settings.bridge)));

    let bridge = Arc::new(Bridge::new(
        settings.bridge.clone(),
        BridgeDeps {
            config_store: store.clone(),
            readings: store.clone(),
            targets: store,
            transport,
            push,
        },
    ));
    bridge.start();

    let app = create_router(Arc::new(AppState::new(bridge.clone(), metrics)))?;
    let listener = tokio::net::TcpListener::bind(&settings.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.server.listen_addr))?;
    info!("Starting API server on {}", settings.server.listen_addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    bridge.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alerting::{AlertLevel, AlertState};
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::Request;
    use storage::{EntitySubscription, MemoryStore};
    use tower::ServiceExt;

    fn app() -> (Arc<MemoryStore>, Router) {
        let store = Arc::new(MemoryStore::new());
        let bridge = Arc::new(Bridge::new(
            bridge::BridgeConfig::default(),
            BridgeDeps {
                config_store: store.clone(),
                readings: store.clone(),
                targets: store.clone(),
                transport: Arc::new(MqttTransport::new(MqttSettings::default())),
                push: None,
            },
        ));
        let metrics = PrometheusBuilder::new().build_recorder().handle();
        let router = create_router(Arc::new(AppState::new(bridge, metrics))).unwrap();
        (store, router)
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
            .body(Body::empty())
            .unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_, app) = app();
        let response = app.oneshot(request("GET", "/api/v1/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body["status"], "stopped");
        assert_eq!(body["bridge"]["connections"], 0);
    }

    #[tokio::test]
    async fn test_reload_empty_configuration() {
        let (_, app) = app();
        let response = app.oneshot(request("POST", "/api/v1/reload")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["entities"], 0);
    }

    #[tokio::test]
    async fn test_reload_rate_limited() {
        let (_, app) = app();
        let mut statuses = Vec::new();
        for _ in 0..3 {
            let response = app.clone().oneshot(request("POST", "/api/v1/reload")).await.unwrap();
            statuses.push(response.status());
        }
        assert_eq!(statuses[..2], [StatusCode::OK, StatusCode::OK]);
        assert_eq!(statuses[2], StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_alerts_show_seeded_states() {
        let (store, app) = app();
        let mut entity = EntitySubscription::new("tank-1", "site/tank-1", "mqtt://127.0.0.1:1");
        entity.alerts.enabled = true;
        entity.last_alert = Some(AlertState {
            level: AlertLevel::High,
            last_transition: None,
        });
        store.upsert_entity(entity).unwrap();
        store
            .upsert_entity(EntitySubscription::new("tank-2", "site/tank-2", "mqtt://127.0.0.1:1"))
            .unwrap();

        // Broker is unreachable; the connection keeps retrying and seeding does not depend on it
        let response = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            app.clone().oneshot(request("POST", "/api/v1/reload")),
        )
        .await
        .unwrap()
        .unwrap();
        let body = json(response).await;
        assert_eq!(body["connections_opened"], 1);
        assert_eq!(body["connections_failed"], 0);

        let response = app.clone().oneshot(request("GET", "/api/v1/health")).await.unwrap();
        let body = json(response).await;
        assert_eq!(body["bridge"]["connections"], 1);
        assert_eq!(body["bridge"]["connected"], 0);

        let response = app.clone().oneshot(request("GET", "/api/v1/alerts?active=true")).await.unwrap();
        let body = json(response).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["active_count"], 1);
        assert_eq!(body["data"][0]["entity_id"], "tank-1");
        assert_eq!(body["data"][0]["state"], "high");

        let response = app.oneshot(request("GET", "/api/v1/alerts?state=sideways")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (_, app) = app();
        let response = app.oneshot(request("GET", "/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[axum::http::header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }
}
