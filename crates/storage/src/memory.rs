//! In-memory store

use crate::{ConfigStore, DeliveryTarget, EntitySubscription, Reading, ReadingStore, StorageError, TargetStore};
use alerting::AlertState;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Store keeping everything in process memory.
///
/// Used by tests and by single-process setups without a database.
pub struct MemoryStore {
    /// Entity configuration by ID
    entities: Mutex<BTreeMap<String, EntitySubscription>>,
    /// Reading history, oldest first
    readings: Mutex<VecDeque<Reading>>,
    /// Delivery targets
    targets: Mutex<Vec<DeliveryTarget>>,
    /// Max readings kept
    max_readings: usize,
    /// Reject writes with a database error
    fail_writes: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StorageError> {
    mutex
        .lock()
        .map_err(|e| StorageError::DatabaseError(format!("Lock error: {}", e)))
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        info!("Creating in-memory store");
        Self {
            entities: Mutex::new(BTreeMap::new()),
            readings: Mutex::new(VecDeque::with_capacity(1024)),
            targets: Mutex::new(Vec::new()),
            max_readings: 100_000,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Insert or replace an entity
    pub fn upsert_entity(&self, entity: EntitySubscription) -> Result<(), StorageError> {
        lock(&self.entities)?.insert(entity.entity_id.clone(), entity);
        Ok(())
    }

    /// Remove an entity
    pub fn delete_entity(&self, entity_id: &str) -> Result<bool, StorageError> {
        Ok(lock(&self.entities)?.remove(entity_id).is_some())
    }

    /// Look up an entity regardless of relevance
    pub fn entity(&self, entity_id: &str) -> Option<EntitySubscription> {
        self.entities.lock().ok()?.get(entity_id).cloned()
    }

    /// Register a delivery target (duplicates ignored)
    pub fn register_target(&self, target: DeliveryTarget) -> Result<(), StorageError> {
        let mut targets = lock(&self.targets)?;
        if !targets.contains(&target) {
            targets.push(target);
        }
        Ok(())
    }

    /// All delivery targets
    pub fn targets(&self) -> Vec<DeliveryTarget> {
        self.targets.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Stored readings of an entity, oldest first
    pub fn readings_for(&self, entity_id: &str) -> Vec<Reading> {
        self.readings
            .lock()
            .map(|r| r.iter().filter(|r| r.entity_id == entity_id).cloned().collect())
            .unwrap_or_default()
    }

    /// Total reading count
    pub fn reading_count(&self) -> usize {
        self.readings.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Make every subsequent write fail (for testing)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StorageError::DatabaseError("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn relevant_subscriptions(&self) -> Result<Vec<EntitySubscription>, StorageError> {
        let entities = lock(&self.entities)?;
        Ok(entities.values().filter(|e| e.is_relevant()).cloned().collect())
    }

    async fn write_alert_state(&self, entity_id: &str, state: &AlertState) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut entities = lock(&self.entities)?;
        let entity = entities.get_mut(entity_id).ok_or(StorageError::NotFound)?;
        entity.last_alert = Some(*state);
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn store_reading(&self, reading: &Reading) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut readings = lock(&self.readings)?;

        // Enforce retention
        while readings.len() >= self.max_readings {
            readings.pop_front();
        }

        readings.push_back(reading.clone());
        Ok(())
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn targets_for_entity(&self, entity_id: &str) -> Result<Vec<DeliveryTarget>, StorageError> {
        let targets = lock(&self.targets)?;
        Ok(targets.iter().filter(|t| t.matches(entity_id)).cloned().collect())
    }

    async fn delete_targets(&self, tokens: &[String]) -> Result<u64, StorageError> {
        self.check_writable()?;
        let doomed: HashSet<&str> = tokens.iter().map(String::as_str).collect();
        let mut targets = lock(&self.targets)?;
        let before = targets.len();
        targets.retain(|t| !doomed.contains(t.token.as_str()));
        let removed = (before - targets.len()) as u64;
        debug!("Deleted {} delivery targets", removed);
        Ok(removed)
    }
}
