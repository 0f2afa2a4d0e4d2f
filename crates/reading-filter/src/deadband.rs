//! Deadband Filter for Storage Suppression

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::trace;

/// Last value actually persisted for an entity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredReading {
    pub value: f64,
    pub stored_at: DateTime<Utc>,
}

/// Per-entity deadband filter.
///
/// Only the last persisted value is remembered; the decision itself is
/// advisory and callers record what they actually stored.
pub struct DeadbandFilter {
    /// Deadband used when an entity has no override
    default_deadband: f64,
    /// Store at least this often even when the value is flat
    heartbeat: Option<Duration>,
    /// Last stored reading by entity
    last: HashMap<String, StoredReading>,
}

impl DeadbandFilter {
    /// Create a new filter with a process-wide default deadband
    pub fn new(default_deadband: f64) -> Self {
        Self {
            default_deadband: default_deadband.max(0.0),
            heartbeat: None,
            last: HashMap::new(),
        }
    }

    /// Force a store when the last one is older than `heartbeat`
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = (heartbeat > Duration::zero()).then_some(heartbeat);
        self
    }

    /// Decide whether a reading should be persisted
    pub fn should_store(
        &self,
        entity_id: &str,
        value: f64,
        deadband: Option<f64>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last) = self.last.get(entity_id) else {
            return true;
        };

        if let Some(heartbeat) = self.heartbeat {
            if now - last.stored_at >= heartbeat {
                return true;
            }
        }

        let band = deadband.filter(|d| *d >= 0.0).unwrap_or(self.default_deadband);
        let delta = (value - last.value).abs();
        if delta < band {
            trace!(entity = entity_id, delta, band, "Reading inside deadband");
            return false;
        }
        true
    }

    /// Record that a reading was persisted; it becomes the new baseline
    pub fn record_stored(&mut self, entity_id: &str, value: f64, stored_at: DateTime<Utc>) {
        self.last
            .insert(entity_id.to_string(), StoredReading { value, stored_at });
    }

    /// Last persisted reading for an entity
    pub fn last_stored(&self, entity_id: &str) -> Option<StoredReading> {
        self.last.get(entity_id).copied()
    }

    /// Default deadband in effect
    pub fn default_deadband(&self) -> f64 {
        self.default_deadband
    }
}
