//! Alert levels, configuration, and per-entity state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Alert level of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Normal,
    Low,
    High,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Normal => "normal",
            AlertLevel::Low => "low",
            AlertLevel::High => "high",
        }
    }

    pub fn is_alert(&self) -> bool {
        !matches!(self, AlertLevel::Normal)
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown alert level string
#[derive(Debug, Clone, Error)]
#[error("Unknown alert level: {0}")]
pub struct ParseLevelError(pub String);

impl FromStr for AlertLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(AlertLevel::Normal),
            "low" => Ok(AlertLevel::Low),
            "high" => Ok(AlertLevel::High),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

/// Kind of notification-eligible transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    /// Crossed into `low` or `high`
    Alert,
    /// Returned to `normal`
    Recovery,
}

/// Alert configuration of one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Whether alerting is evaluated at all
    pub enabled: bool,
    /// Low threshold, disabled when absent
    pub low: Option<f64>,
    /// High threshold, disabled when absent
    pub high: Option<f64>,
    /// Band around a crossed threshold that keeps the alert latched
    pub hysteresis: f64,
    /// Minimum time between notification-eligible transitions (seconds)
    pub cooldown_seconds: u64,
    /// Notify when the value returns to normal
    pub notify_on_recovery: bool,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            low: None,
            high: None,
            hysteresis: 0.0,
            cooldown_seconds: 1800, // 30 minutes
            notify_on_recovery: false,
        }
    }
}

/// State of an entity's alarm
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AlertState {
    /// Current level
    pub level: AlertLevel,
    /// Last transition that passed its cooldown gate
    pub last_transition: Option<DateTime<Utc>>,
}
