//! Notification Dispatch
//!
//! Push notifications for alert transitions:
//! - Payload building with a de-duplication identifier
//! - Target resolution and de-duplication
//! - Multicast delivery through a push transport
//! - Pruning of targets the push service reports as unregistered

mod dispatcher;
mod fcm;
mod payload;
mod transport;

pub use dispatcher::{DispatchReport, Dispatcher};
pub use fcm::{FcmConfig, FcmTransport};
pub use payload::PushPayload;
pub use transport::{PushTransport, TokenOutcome};

use thiserror::Error;

/// Push error types
#[derive(Error, Debug)]
pub enum PushError {
    #[error("Push delivery is disabled")]
    Disabled,

    #[error("Push request timed out after {0}ms")]
    Timeout(u64),

    #[error("Push request failed: {0}")]
    Request(String),

    #[error("Push service rejected request: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Unexpected push response: {0}")]
    InvalidResponse(String),

    #[error("Target lookup failed: {0}")]
    Targets(#[from] storage::StorageError),
}
