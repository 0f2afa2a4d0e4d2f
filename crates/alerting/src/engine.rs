//! Alert Engine Implementation

use crate::state::{AlertConfig, AlertLevel, AlertState, TransitionKind};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, info};

/// Result of evaluating one reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// Level before this reading
    pub previous: AlertLevel,
    /// Level after this reading
    pub current: AlertLevel,
    /// Set when the transition passed its gate and should be notified
    pub notify: Option<TransitionKind>,
}

impl Evaluation {
    fn unchanged(level: AlertLevel) -> Self {
        Self {
            previous: level,
            current: level,
            notify: None,
        }
    }

    /// Whether the level changed
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }

    /// Whether a gated (notification-eligible) transition was recorded
    pub fn is_gated(&self) -> bool {
        self.notify.is_some()
    }
}

/// Level for a value given the previous level.
///
/// A latched `low`/`high` holds while the value stays inside the
/// hysteresis band of the crossed threshold.
pub fn classify(previous: AlertLevel, value: f64, config: &AlertConfig) -> AlertLevel {
    let h = config.hysteresis.max(0.0);
    match (previous, config.low, config.high) {
        (AlertLevel::Low, Some(low), _) if value < low || (h > 0.0 && value < low + h) => {
            return AlertLevel::Low;
        }
        (AlertLevel::High, _, Some(high)) if value > high || (h > 0.0 && value > high - h) => {
            return AlertLevel::High;
        }
        _ => {}
    }

    match (config.low, config.high) {
        (Some(low), _) if value < low => AlertLevel::Low,
        (_, Some(high)) if value > high => AlertLevel::High,
        _ => AlertLevel::Normal,
    }
}

fn cooldown_elapsed(last: Option<DateTime<Utc>>, cooldown_seconds: u64, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(last) => {
            // chrono durations are bounded to i64 milliseconds
            let secs = cooldown_seconds.min(i64::MAX as u64 / 1000) as i64;
            now - last >= Duration::seconds(secs)
        }
    }
}

/// Alert engine holding the authoritative in-memory state of every entity
#[derive(Debug, Default)]
pub struct AlertEngine {
    /// Alert states by entity ID
    states: HashMap<String, AlertState>,
}

impl AlertEngine {
    /// Create a new alert engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate a reading for an entity and record any gated transition
    pub fn evaluate(
        &mut self,
        entity_id: &str,
        value: f64,
        config: &AlertConfig,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let state = self.states.entry(entity_id.to_string()).or_default();
        let previous = state.level;
        let next = classify(previous, value, config);

        if next == previous {
            return Evaluation::unchanged(previous);
        }

        let cooled = cooldown_elapsed(state.last_transition, config.cooldown_seconds, now);

        if next.is_alert() {
            if !cooled {
                debug!(entity = entity_id, %previous, %next, "Alert transition suppressed: in cooldown period");
                return Evaluation::unchanged(previous);
            }
            state.level = next;
            state.last_transition = Some(now);
            info!(entity = entity_id, %previous, %next, value, "Alert raised");
            return Evaluation {
                previous,
                current: next,
                notify: Some(TransitionKind::Alert),
            };
        }

        if !config.notify_on_recovery {
            state.level = AlertLevel::Normal;
            debug!(entity = entity_id, %previous, value, "Recovered without notification");
            return Evaluation {
                previous,
                current: AlertLevel::Normal,
                notify: None,
            };
        }

        if !cooled {
            debug!(entity = entity_id, %previous, "Recovery deferred: in cooldown period");
            return Evaluation::unchanged(previous);
        }

        state.level = AlertLevel::Normal;
        state.last_transition = Some(now);
        info!(entity = entity_id, %previous, value, "Alert recovered");
        Evaluation {
            previous,
            current: AlertLevel::Normal,
            notify: Some(TransitionKind::Recovery),
        }
    }

    /// Seed an entity's state from a persisted snapshot.
    ///
    /// Does nothing once the entity is known; returns whether it seeded.
    pub fn seed(&mut self, entity_id: &str, state: AlertState) -> bool {
        if self.states.contains_key(entity_id) {
            return false;
        }
        self.states.insert(entity_id.to_string(), state);
        true
    }

    /// Current state of an entity
    pub fn state(&self, entity_id: &str) -> Option<&AlertState> {
        self.states.get(entity_id)
    }

    /// Copy of all states, sorted by entity ID
    pub fn snapshot(&self) -> Vec<(String, AlertState)> {
        let mut states: Vec<_> = self
            .states
            .iter()
            .map(|(id, state)| (id.clone(), *state))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Number of entities tracked
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
