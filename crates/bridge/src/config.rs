//! Bridge configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Refresh intervals below this are raised to it
pub const MIN_REFRESH_INTERVAL_SECS: u64 = 10;

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Interval between synchronization passes (seconds, floor 10)
    pub refresh_interval_secs: u64,
    /// Deadband for entities without an override
    pub default_deadband: f64,
    /// Store a reading at least this often even when flat (0 = off)
    pub store_heartbeat_secs: u64,
    /// Bound on every configuration and history store call (ms)
    pub store_timeout_ms: u64,
    /// Bound on every push dispatch (ms)
    pub push_timeout_ms: u64,
    /// Readings queued per entity before new ones are dropped
    pub entity_queue_depth: usize,
    /// Broker reconnect backoff start (seconds)
    pub reconnect_min_secs: u64,
    /// Broker reconnect backoff cap (seconds)
    pub reconnect_max_secs: u64,
    /// MQTT keep-alive (seconds)
    pub keep_alive_secs: u64,
    /// Prefix of generated MQTT client IDs
    pub client_id_prefix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
            default_deadband: 0.003,
            store_heartbeat_secs: 0,
            store_timeout_ms: 5_000,
            push_timeout_ms: 10_000,
            entity_queue_depth: 64,
            reconnect_min_secs: 1,
            reconnect_max_secs: 60,
            keep_alive_secs: 30,
            client_id_prefix: "telemetry-bridge".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Refresh interval with the floor applied
    pub fn refresh_interval(&self) -> Duration {
        if self.refresh_interval_secs < MIN_REFRESH_INTERVAL_SECS {
            warn!(
                "Refresh interval {}s below minimum, using {}s",
                self.refresh_interval_secs, MIN_REFRESH_INTERVAL_SECS
            );
            return Duration::from_secs(MIN_REFRESH_INTERVAL_SECS);
        }
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms.max(1))
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms.max(1))
    }

    pub fn heartbeat(&self) -> Option<chrono::Duration> {
        (self.store_heartbeat_secs > 0)
            .then(|| chrono::Duration::seconds(self.store_heartbeat_secs.min(i64::MAX as u64 / 1000) as i64))
    }

    pub fn queue_depth(&self) -> usize {
        self.entity_queue_depth.max(1)
    }
}
