//! Notification payloads

use alerting::{AlertConfig, AlertLevel, TransitionKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Payload handed to the push transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    /// Data fields delivered alongside the visible notification
    pub data: BTreeMap<String, String>,
}

impl PushPayload {
    /// Build the payload for a gated alert transition
    pub fn for_transition(
        entity_id: &str,
        display_name: &str,
        value: f64,
        level: AlertLevel,
        kind: TransitionKind,
        config: &AlertConfig,
    ) -> Self {
        let name = if display_name.is_empty() { entity_id } else { display_name };

        let (title, body) = match (kind, level) {
            (TransitionKind::Alert, AlertLevel::Low) => (
                format!("{}: low level", name),
                match config.low {
                    Some(low) => format!("Reading {:.2} is below the low threshold of {:.2}", value, low),
                    None => format!("Reading {:.2} is below the low threshold", value),
                },
            ),
            (TransitionKind::Alert, AlertLevel::High) => (
                format!("{}: high level", name),
                match config.high {
                    Some(high) => format!("Reading {:.2} is above the high threshold of {:.2}", value, high),
                    None => format!("Reading {:.2} is above the high threshold", value),
                },
            ),
            _ => (
                format!("{}: back to normal", name),
                format!("Reading {:.2} is back within limits", value),
            ),
        };

        let mut data = BTreeMap::new();
        data.insert("entity_id".to_string(), entity_id.to_string());
        data.insert("value".to_string(), value.to_string());
        data.insert("state".to_string(), level.as_str().to_string());
        data.insert(
            "kind".to_string(),
            match kind {
                TransitionKind::Alert => "alert",
                TransitionKind::Recovery => "recovery",
            }
            .to_string(),
        );
        data.insert("notification_id".to_string(), Uuid::new_v4().to_string());

        Self { title, body, data }
    }

    /// De-duplication identifier, if present
    pub fn notification_id(&self) -> Option<&str> {
        self.data.get("notification_id").map(String::as_str)
    }
}
