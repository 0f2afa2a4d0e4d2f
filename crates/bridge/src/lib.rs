//! Telemetry Bridge
//!
//! Keeps broker subscriptions in step with the configuration store and
//! runs every inbound reading through filtering, alerting, persistence,
//! and notification.

mod bridge;
mod config;
mod directory;
mod index;
mod key;
mod mqtt;
mod pipeline;
mod pool;
mod router;
mod sync;
mod transport;

#[cfg(test)]
mod testing;

pub use bridge::{Bridge, BridgeDeps, BridgeStatus};
pub use config::BridgeConfig;
pub use directory::EntityDirectory;
pub use index::TopicIndex;
pub use key::{BrokerEndpoint, ConnectionKey, Credentials};
pub use mqtt::{MqttSettings, MqttTransport};
pub use pipeline::{ReadingOutcome, ReadingPipeline};
pub use pool::{Connection, ConnectionPool, ConvergeReport, MessageSink};
pub use router::EntityRouter;
pub use sync::{SyncReport, Synchronizer};
pub use transport::{BrokerSession, BrokerTransport, InboundMessage, MessageHandler};

use storage::StorageError;
use thiserror::Error;

/// Bridge error types
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid broker endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Configuration store error: {0}")]
    Store(#[from] StorageError),

    #[error("Configuration query timed out after {0}ms")]
    Timeout(u64),
}
