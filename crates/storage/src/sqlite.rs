//! SQLite store

use crate::{ConfigStore, DeliveryTarget, EntitySubscription, Reading, ReadingStore, StorageError, TargetStore};
use alerting::{AlertConfig, AlertLevel, AlertState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reading_filter::Transform;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, warn};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS entities (
        id                  TEXT PRIMARY KEY,
        display_name        TEXT NOT NULL,
        topic               TEXT NOT NULL,
        broker_url          TEXT NOT NULL,
        broker_username     TEXT,
        broker_password     TEXT,
        multiplier          REAL NOT NULL DEFAULT 1.0,
        value_offset        REAL NOT NULL DEFAULT 0.0,
        store_history       INTEGER NOT NULL DEFAULT 0,
        deadband            REAL,
        alerts_enabled      INTEGER NOT NULL DEFAULT 0,
        alert_low           REAL,
        alert_high          REAL,
        alert_hysteresis    REAL NOT NULL DEFAULT 0.0,
        alert_cooldown_secs INTEGER NOT NULL DEFAULT 1800,
        notify_on_recovery  INTEGER NOT NULL DEFAULT 0,
        last_alert_state    TEXT,
        last_alert_at_ms    INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS readings (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_id      TEXT NOT NULL,
        value          REAL NOT NULL,
        recorded_at_ms INTEGER NOT NULL,
        forced         INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_readings_entity_time ON readings (entity_id, recorded_at_ms)",
    "CREATE TABLE IF NOT EXISTS delivery_targets (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        token     TEXT NOT NULL,
        entity_id TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_targets_token ON delivery_targets (token)",
];

const ENTITY_COLUMNS: &str = "id, display_name, topic, broker_url, broker_username, broker_password, \
    multiplier, value_offset, store_history, deadband, alerts_enabled, alert_low, alert_high, \
    alert_hysteresis, alert_cooldown_secs, notify_on_recovery, last_alert_state, last_alert_at_ms";

/// Store backed by a SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and apply the schema
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        info!("Opening SQLite store at {}", url);
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database (single connection, never recycled)
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("SQLite schema ready");
        Ok(())
    }

    /// Insert or update an entity's configuration, keeping its alert mirror
    pub async fn upsert_entity(&self, entity: &EntitySubscription) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO entities (id, display_name, topic, broker_url, broker_username, broker_password,
                multiplier, value_offset, store_history, deadband, alerts_enabled, alert_low, alert_high,
                alert_hysteresis, alert_cooldown_secs, notify_on_recovery)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                topic = excluded.topic,
                broker_url = excluded.broker_url,
                broker_username = excluded.broker_username,
                broker_password = excluded.broker_password,
                multiplier = excluded.multiplier,
                value_offset = excluded.value_offset,
                store_history = excluded.store_history,
                deadband = excluded.deadband,
                alerts_enabled = excluded.alerts_enabled,
                alert_low = excluded.alert_low,
                alert_high = excluded.alert_high,
                alert_hysteresis = excluded.alert_hysteresis,
                alert_cooldown_secs = excluded.alert_cooldown_secs,
                notify_on_recovery = excluded.notify_on_recovery",
        )
        .bind(&entity.entity_id)
        .bind(&entity.display_name)
        .bind(&entity.topic)
        .bind(&entity.broker_url)
        .bind(&entity.broker_username)
        .bind(&entity.broker_password)
        .bind(entity.transform.multiplier)
        .bind(entity.transform.offset)
        .bind(entity.store_history)
        .bind(entity.deadband)
        .bind(entity.alerts.enabled)
        .bind(entity.alerts.low)
        .bind(entity.alerts.high)
        .bind(entity.alerts.hysteresis)
        .bind(i64::try_from(entity.alerts.cooldown_seconds).unwrap_or(i64::MAX))
        .bind(entity.alerts.notify_on_recovery)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete an entity; returns whether it existed
    pub async fn delete_entity(&self, entity_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM entities WHERE id = ?")
            .bind(entity_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Look up one entity regardless of relevance
    pub async fn entity(&self, entity_id: &str) -> Result<EntitySubscription, StorageError> {
        let row = sqlx::query(&format!("SELECT {} FROM entities WHERE id = ?", ENTITY_COLUMNS))
            .bind(entity_id)
            .fetch_one(&self.pool)
            .await?;
        entity_from_row(&row)
    }

    /// Register a delivery target; an identical registration is a no-op
    pub async fn register_target(&self, target: &DeliveryTarget) -> Result<(), StorageError> {
        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM delivery_targets WHERE token = ? AND entity_id IS ?",
        )
        .bind(&target.token)
        .bind(&target.entity_id)
        .fetch_one(&self.pool)
        .await?;

        if existing == 0 {
            sqlx::query("INSERT INTO delivery_targets (token, entity_id) VALUES (?, ?)")
                .bind(&target.token)
                .bind(&target.entity_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Most recent readings of an entity, newest first
    pub async fn recent_readings(&self, entity_id: &str, limit: u32) -> Result<Vec<Reading>, StorageError> {
        let rows = sqlx::query(
            "SELECT entity_id, value, recorded_at_ms, forced FROM readings
             WHERE entity_id = ? ORDER BY recorded_at_ms DESC, id DESC LIMIT ?",
        )
        .bind(entity_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Reading, StorageError> {
                Ok(Reading {
                    entity_id: row.try_get("entity_id")?,
                    value: row.try_get("value")?,
                    recorded_at: from_millis(row.try_get("recorded_at_ms")?)?,
                    forced: row.try_get("forced")?,
                })
            })
            .collect()
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::InvalidRecord(format!("timestamp out of range: {}", ms)))
}

fn entity_from_row(row: &SqliteRow) -> Result<EntitySubscription, StorageError> {
    let entity_id: String = row.try_get("id")?;

    let last_alert = match row.try_get::<Option<String>, _>("last_alert_state")? {
        Some(level) => match AlertLevel::from_str(&level) {
            Ok(level) => {
                let at: Option<i64> = row.try_get("last_alert_at_ms")?;
                Some(AlertState {
                    level,
                    last_transition: at.map(from_millis).transpose()?,
                })
            }
            Err(e) => {
                warn!(entity = %entity_id, "Ignoring mirrored alert state: {}", e);
                None
            }
        },
        None => None,
    };

    let cooldown: i64 = row.try_get("alert_cooldown_secs")?;

    Ok(EntitySubscription {
        display_name: row.try_get("display_name")?,
        topic: row.try_get("topic")?,
        broker_url: row.try_get("broker_url")?,
        broker_username: row.try_get("broker_username")?,
        broker_password: row.try_get("broker_password")?,
        transform: Transform::new(row.try_get("multiplier")?, row.try_get("value_offset")?),
        store_history: row.try_get("store_history")?,
        deadband: row.try_get("deadband")?,
        alerts: AlertConfig {
            enabled: row.try_get("alerts_enabled")?,
            low: row.try_get("alert_low")?,
            high: row.try_get("alert_high")?,
            hysteresis: row.try_get("alert_hysteresis")?,
            cooldown_seconds: u64::try_from(cooldown).unwrap_or(0),
            notify_on_recovery: row.try_get("notify_on_recovery")?,
        },
        last_alert,
        entity_id,
    })
}

#[async_trait]
impl ConfigStore for SqliteStore {
    async fn relevant_subscriptions(&self) -> Result<Vec<EntitySubscription>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM entities WHERE store_history = 1 OR alerts_enabled = 1 ORDER BY id",
            ENTITY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut entities = Vec::with_capacity(rows.len());
        for row in &rows {
            match entity_from_row(row) {
                Ok(entity) => entities.push(entity),
                Err(e) => warn!("Skipping unreadable entity row: {}", e),
            }
        }
        Ok(entities)
    }

    async fn write_alert_state(&self, entity_id: &str, state: &AlertState) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE entities SET last_alert_state = ?, last_alert_at_ms = ? WHERE id = ?",
        )
        .bind(state.level.as_str())
        .bind(state.last_transition.map(|t| t.timestamp_millis()))
        .bind(entity_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for SqliteStore {
    async fn store_reading(&self, reading: &Reading) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO readings (entity_id, value, recorded_at_ms, forced) VALUES (?, ?, ?, ?)")
            .bind(&reading.entity_id)
            .bind(reading.value)
            .bind(reading.recorded_at.timestamp_millis())
            .bind(reading.forced)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TargetStore for SqliteStore {
    async fn targets_for_entity(&self, entity_id: &str) -> Result<Vec<DeliveryTarget>, StorageError> {
        let rows = sqlx::query(
            "SELECT token, entity_id FROM delivery_targets
             WHERE entity_id = ? OR entity_id IS NULL ORDER BY id",
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DeliveryTarget, StorageError> {
                Ok(DeliveryTarget {
                    token: row.try_get("token")?,
                    entity_id: row.try_get("entity_id")?,
                })
            })
            .collect()
    }

    async fn delete_targets(&self, tokens: &[String]) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for token in tokens {
            let result = sqlx::query("DELETE FROM delivery_targets WHERE token = ?")
                .bind(token)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }
}
