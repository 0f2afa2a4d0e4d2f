//! Alerting System
//!
//! Threshold alarms per entity: hysteresis against flapping near a
//! threshold, cooldown between notification-eligible transitions.

mod engine;
mod state;

pub use engine::{classify, AlertEngine, Evaluation};
pub use state::{AlertConfig, AlertLevel, AlertState, ParseLevelError, TransitionKind};
