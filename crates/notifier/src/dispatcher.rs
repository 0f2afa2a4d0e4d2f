//! Notification Dispatcher Implementation

use crate::{PushError, PushPayload, PushTransport, TokenOutcome};
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use storage::{DeliveryTarget, TargetStore};
use tracing::{debug, info, warn};

/// Result of one dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Distinct tokens the payload was sent to
    pub attempted: usize,
    /// Tokens the push service accepted
    pub delivered: usize,
    /// Tokens reported as permanently invalid
    pub invalid_targets: Vec<String>,
    /// Targets actually removed from the store
    pub pruned: u64,
}

/// Sends multicast pushes and prunes targets the push service rejects
pub struct Dispatcher {
    /// Push service, `None` when push is not configured
    transport: Option<Arc<dyn PushTransport>>,
    /// Delivery target store
    targets: Arc<dyn TargetStore>,
    /// Bound on every push and store call
    timeout: Duration,
}

/// Unique tokens in first-seen order
fn dedup_tokens(targets: &[DeliveryTarget]) -> Vec<String> {
    let mut seen = HashSet::new();
    targets
        .iter()
        .filter(|t| !t.token.is_empty() && seen.insert(t.token.as_str()))
        .map(|t| t.token.clone())
        .collect()
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(
        transport: Option<Arc<dyn PushTransport>>,
        targets: Arc<dyn TargetStore>,
        timeout: Duration,
    ) -> Self {
        if transport.is_none() {
            warn!("Push transport not configured, notifications disabled");
        }
        Self {
            transport,
            targets,
            timeout,
        }
    }

    /// Whether a push transport is configured
    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    /// Resolve the targets of an entity and send them `payload`
    pub async fn notify_entity(&self, entity_id: &str, payload: &PushPayload) -> Result<DispatchReport, PushError> {
        if self.transport.is_none() {
            return Err(PushError::Disabled);
        }

        let targets = tokio::time::timeout(self.timeout, self.targets.targets_for_entity(entity_id))
            .await
            .map_err(|_| PushError::Timeout(self.timeout.as_millis() as u64))??;

        self.send(&targets, payload).await
    }

    /// Send `payload` once to every distinct target token
    pub async fn send(&self, targets: &[DeliveryTarget], payload: &PushPayload) -> Result<DispatchReport, PushError> {
        let transport = self.transport.as_ref().ok_or(PushError::Disabled)?;

        let tokens = dedup_tokens(targets);
        if tokens.is_empty() {
            debug!("No delivery targets, skipping push");
            return Ok(DispatchReport::default());
        }

        let outcomes = tokio::time::timeout(self.timeout, transport.multicast(&tokens, payload))
            .await
            .map_err(|_| PushError::Timeout(self.timeout.as_millis() as u64))??;

        let mut report = DispatchReport {
            attempted: tokens.len(),
            ..Default::default()
        };

        for (token, outcome) in tokens.iter().zip(outcomes) {
            match outcome {
                TokenOutcome::Delivered => report.delivered += 1,
                TokenOutcome::Unregistered => report.invalid_targets.push(token.clone()),
                TokenOutcome::Failed(reason) => debug!("Push to token failed: {}", reason),
            }
        }

        counter!("bridge_notifications_delivered_total").increment(report.delivered as u64);

        if !report.invalid_targets.is_empty() {
            report.pruned = self.prune(&report.invalid_targets).await;
        }

        info!(
            attempted = report.attempted,
            delivered = report.delivered,
            pruned = report.pruned,
            "Push dispatched"
        );
        Ok(report)
    }

    /// Best-effort removal of invalid targets; failures are only logged
    async fn prune(&self, tokens: &[String]) -> u64 {
        match tokio::time::timeout(self.timeout, self.targets.delete_targets(tokens)).await {
            Ok(Ok(removed)) => {
                counter!("bridge_push_targets_pruned_total").increment(removed);
                removed
            }
            Ok(Err(e)) => {
                warn!("Failed to prune {} invalid targets: {}", tokens.len(), e);
                0
            }
            Err(_) => {
                warn!("Timed out pruning {} invalid targets", tokens.len());
                0
            }
        }
    }
}
