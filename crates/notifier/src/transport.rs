//! Push transport boundary

use crate::{PushError, PushPayload};
use async_trait::async_trait;

/// Per-token result of a multicast
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    Delivered,
    /// Permanently invalid; the target should be removed
    Unregistered,
    /// Transient or unknown failure
    Failed(String),
}

/// Push delivery service
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Send one payload to many tokens.
    ///
    /// Returns one outcome per token, in the order given.
    async fn multicast(&self, tokens: &[String], payload: &PushPayload) -> Result<Vec<TokenOutcome>, PushError>;
}
