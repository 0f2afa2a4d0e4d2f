//! Stored records

use alerting::{AlertConfig, AlertState};
use chrono::{DateTime, Utc};
use reading_filter::Transform;
use serde::{Deserialize, Serialize};

/// One monitored entity as configured by operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySubscription {
    pub entity_id: String,
    pub display_name: String,
    /// Exact topic the entity's readings arrive on
    pub topic: String,
    /// Broker endpoint, e.g. `mqtt://broker.local:1883`
    pub broker_url: String,
    pub broker_username: Option<String>,
    pub broker_password: Option<String>,
    pub transform: Transform,
    /// Persist accepted readings
    pub store_history: bool,
    /// Per-entity deadband override
    pub deadband: Option<f64>,
    pub alerts: AlertConfig,
    /// Last mirrored alert state, for operators and restart seeding
    pub last_alert: Option<AlertState>,
}

impl EntitySubscription {
    /// Create a subscription with default transform and alerting disabled
    pub fn new(
        entity_id: impl Into<String>,
        topic: impl Into<String>,
        broker_url: impl Into<String>,
    ) -> Self {
        let entity_id = entity_id.into();
        Self {
            display_name: entity_id.clone(),
            entity_id,
            topic: topic.into(),
            broker_url: broker_url.into(),
            broker_username: None,
            broker_password: None,
            transform: Transform::default(),
            store_history: true,
            deadband: None,
            alerts: AlertConfig::default(),
            last_alert: None,
        }
    }

    /// Whether the bridge has anything to do for this entity
    pub fn is_relevant(&self) -> bool {
        self.store_history || self.alerts.enabled
    }
}

/// A persisted reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub entity_id: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
    /// Stored because of an alert transition rather than the deadband
    pub forced: bool,
}

/// Push notification target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub token: String,
    /// `None` receives notifications for every entity
    pub entity_id: Option<String>,
}

impl DeliveryTarget {
    pub fn global(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            entity_id: None,
        }
    }

    pub fn scoped(token: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            entity_id: Some(entity_id.into()),
        }
    }

    /// Whether this target receives notifications for `entity_id`
    pub fn matches(&self, entity_id: &str) -> bool {
        self.entity_id.as_deref().map_or(true, |scope| scope == entity_id)
    }
}
