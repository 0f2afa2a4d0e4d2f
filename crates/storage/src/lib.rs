//! Storage Layer
//!
//! Boundaries to the configuration, history, and delivery-target stores,
//! with SQLite and in-memory implementations.

mod memory;
mod models;
mod sqlite;

pub use memory::MemoryStore;
pub use models::{DeliveryTarget, EntitySubscription, Reading};
pub use sqlite::SqliteStore;

use alerting::AlertState;
use async_trait::async_trait;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Record not found")]
    NotFound,
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StorageError::NotFound,
            other => StorageError::DatabaseError(other.to_string()),
        }
    }
}

/// Entity configuration owned by the request-handling layer
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// All entities with history or alerting enabled
    async fn relevant_subscriptions(&self) -> Result<Vec<EntitySubscription>, StorageError>;

    /// Mirror an entity's alert state for operator visibility
    async fn write_alert_state(&self, entity_id: &str, state: &AlertState) -> Result<(), StorageError>;
}

/// Reading history
#[async_trait]
pub trait ReadingStore: Send + Sync {
    async fn store_reading(&self, reading: &Reading) -> Result<(), StorageError>;
}

/// Push delivery targets
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Targets scoped to `entity_id` or globally scoped
    async fn targets_for_entity(&self, entity_id: &str) -> Result<Vec<DeliveryTarget>, StorageError>;

    /// Delete every target with one of `tokens`; returns the number removed
    async fn delete_targets(&self, tokens: &[String]) -> Result<u64, StorageError>;
}
