//! Per-reading processing: filter, alert, persist, notify

use crate::{BridgeConfig, EntityDirectory};
use alerting::{AlertEngine, AlertLevel, AlertState, Evaluation, TransitionKind};
use chrono::{DateTime, Utc};
use metrics::counter;
use notifier::{Dispatcher, PushError, PushPayload};
use reading_filter::{extract, DeadbandFilter};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use storage::{ConfigStore, EntitySubscription, Reading, ReadingStore};
use tracing::{debug, warn};

/// What happened to one reading
#[derive(Debug, Clone, PartialEq)]
pub enum ReadingOutcome {
    /// Entity is not part of the current configuration
    UnknownEntity,
    /// Payload had no numeric value
    Malformed,
    Processed {
        value: f64,
        /// Persisted successfully
        stored: bool,
        /// Persisted only because of an alert transition
        forced: bool,
        evaluation: Option<Evaluation>,
    },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared reading pipeline.
///
/// Callers must serialize readings per entity; different entities may be
/// processed concurrently.
pub struct ReadingPipeline {
    directory: Arc<EntityDirectory>,
    deadband: Mutex<DeadbandFilter>,
    alerts: Mutex<AlertEngine>,
    readings: Arc<dyn ReadingStore>,
    config_store: Arc<dyn ConfigStore>,
    dispatcher: Arc<Dispatcher>,
    store_timeout: Duration,
}

impl ReadingPipeline {
    pub fn new(
        config: &BridgeConfig,
        directory: Arc<EntityDirectory>,
        readings: Arc<dyn ReadingStore>,
        config_store: Arc<dyn ConfigStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let mut deadband = DeadbandFilter::new(config.default_deadband);
        if let Some(heartbeat) = config.heartbeat() {
            deadband = deadband.with_heartbeat(heartbeat);
        }
        Self {
            directory,
            deadband: Mutex::new(deadband),
            alerts: Mutex::new(AlertEngine::new()),
            readings,
            config_store,
            dispatcher,
            store_timeout: config.store_timeout(),
        }
    }

    /// Seed alert states of entities not evaluated yet from their mirrored snapshots
    pub fn seed_alert_states<'a>(&self, entities: impl IntoIterator<Item = &'a EntitySubscription>) {
        let mut engine = lock(&self.alerts);
        for entity in entities {
            if let Some(state) = entity.last_alert {
                if engine.seed(&entity.entity_id, state) {
                    debug!(entity = %entity.entity_id, level = %state.level, "Seeded alert state");
                }
            }
        }
    }

    /// Copy of every tracked alert state
    pub fn alert_states(&self) -> Vec<(String, AlertState)> {
        lock(&self.alerts).snapshot()
    }

    /// Process one payload for one entity
    pub async fn process(&self, entity_id: &str, payload: &[u8]) -> ReadingOutcome {
        self.process_at(entity_id, payload, Utc::now()).await
    }

    pub async fn process_at(&self, entity_id: &str, payload: &[u8], now: DateTime<Utc>) -> ReadingOutcome {
        let Some(entity) = self.directory.get(entity_id) else {
            debug!(entity = entity_id, "Dropping reading for unknown entity");
            return ReadingOutcome::UnknownEntity;
        };

        let Some(value) = extract(payload, &entity.transform) else {
            counter!("bridge_payloads_malformed_total").increment(1);
            debug!(entity = entity_id, "Dropping payload without a numeric value");
            return ReadingOutcome::Malformed;
        };

        let wants_store =
            entity.store_history && lock(&self.deadband).should_store(entity_id, value, entity.deadband, now);

        let evaluation = entity
            .alerts
            .enabled
            .then(|| lock(&self.alerts).evaluate(entity_id, value, &entity.alerts, now));
        let gated = evaluation.map_or(false, |e| e.is_gated());

        // Forced storage never applies to alert-only entities
        let forced = !wants_store && gated && entity.store_history;

        let mut stored = false;
        if wants_store || forced {
            let reading = Reading {
                entity_id: entity_id.to_string(),
                value,
                recorded_at: now,
                forced,
            };
            stored = self.persist(&reading).await;
            if stored {
                lock(&self.deadband).record_stored(entity_id, value, now);
            }
        } else {
            counter!("bridge_readings_suppressed_total").increment(1);
        }

        if let Some(evaluation) = evaluation {
            if evaluation.changed() {
                self.mirror_alert_state(entity_id).await;
            }
            if let Some(kind) = evaluation.notify {
                self.spawn_notification(&entity, value, evaluation.current, kind);
            }
        }

        ReadingOutcome::Processed {
            value,
            stored,
            forced,
            evaluation,
        }
    }

    async fn persist(&self, reading: &Reading) -> bool {
        match tokio::time::timeout(self.store_timeout, self.readings.store_reading(reading)).await {
            Ok(Ok(())) => {
                counter!("bridge_readings_stored_total").increment(1);
                true
            }
            Ok(Err(e)) => {
                counter!("bridge_store_failures_total").increment(1);
                warn!(entity = %reading.entity_id, "Failed to store reading: {}", e);
                false
            }
            Err(_) => {
                counter!("bridge_store_failures_total").increment(1);
                warn!(entity = %reading.entity_id, "Storing reading timed out");
                false
            }
        }
    }

    async fn mirror_alert_state(&self, entity_id: &str) {
        let state = lock(&self.alerts).state(entity_id).copied();
        let Some(state) = state else {
            return;
        };
        match tokio::time::timeout(self.store_timeout, self.config_store.write_alert_state(entity_id, &state)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(entity = entity_id, "Failed to mirror alert state: {}", e),
            Err(_) => warn!(entity = entity_id, "Mirroring alert state timed out"),
        }
    }

    fn spawn_notification(&self, entity: &EntitySubscription, value: f64, level: AlertLevel, kind: TransitionKind) {
        let payload = PushPayload::for_transition(
            &entity.entity_id,
            &entity.display_name,
            value,
            level,
            kind,
            &entity.alerts,
        );
        let dispatcher = self.dispatcher.clone();
        let entity_id = entity.entity_id.clone();

        tokio::spawn(async move {
            match dispatcher.notify_entity(&entity_id, &payload).await {
                Ok(report) => debug!(entity = %entity_id, delivered = report.delivered, "Notification sent"),
                Err(PushError::Disabled) => debug!(entity = %entity_id, "Push disabled, notification skipped"),
                Err(e) => {
                    counter!("bridge_notification_failures_total").increment(1);
                    warn!(entity = %entity_id, "Notification failed: {}", e);
                }
            }
        });
    }
}
