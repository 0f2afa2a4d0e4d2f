//! Broker transport boundary

use crate::{BridgeError, ConnectionKey, Credentials};
use async_trait::async_trait;
use std::sync::Arc;

/// Message received from a broker
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Callback invoked for every message a session receives.
///
/// Runs on the session's I/O task, so it must return quickly.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Creates broker sessions
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Start a session that keeps reconnecting on its own until disconnected.
    ///
    /// Must not wait for the broker handshake; an unreachable broker is
    /// retried by the session itself.
    async fn connect(
        &self,
        key: &ConnectionKey,
        credentials: &Credentials,
        on_message: MessageHandler,
    ) -> Result<Arc<dyn BrokerSession>, BridgeError>;
}

/// One broker session
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Track and queue a subscription; tracked topics are restored after every reconnect
    async fn subscribe(&self, topic: &str) -> Result<(), BridgeError>;

    /// Stop tracking and queue an unsubscription
    async fn unsubscribe(&self, topic: &str) -> Result<(), BridgeError>;

    /// Whether the broker has acknowledged the current connection
    fn is_connected(&self) -> bool;

    /// Stop the session; no messages are delivered afterwards
    async fn disconnect(&self);
}
