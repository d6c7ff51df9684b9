//! Consumer checkpoint persistence.
//!
//! A checkpoint is the `last_applied_event_id` of one named consumer. It is
//! created implicitly at 0, only ever moves forward, and is written after the
//! consumer has made the effects of every event up to it durable. `reset` is
//! the one way back to 0 and is reserved for rebuilds.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use thiserror::Error;
use tracing::instrument;

use eventlog_core::EventId;

use crate::event_store::EventStoreError;
use crate::event_store::postgres::map_sqlx_error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub consumer: String,
    pub last_applied_event_id: EventId,
    pub updated_at: DateTime<Utc>,
}

/// How far a consumer trails the log head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerLag {
    pub consumer: String,
    pub last_applied_event_id: EventId,
    pub lag: u64,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    /// A checkpoint may not move backwards outside of `reset`.
    #[error("checkpoint regression for '{consumer}': at {current}, attempted {attempted}")]
    Regression {
        consumer: String,
        current: EventId,
        attempted: EventId,
    },

    #[error("checkpoint storage unavailable: {0}")]
    Unavailable(String),

    #[error("checkpoint storage error: {0}")]
    Storage(String),
}

impl CheckpointError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CheckpointError::Unavailable(_))
    }
}

impl From<EventStoreError> for CheckpointError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::StorageUnavailable(msg) => CheckpointError::Unavailable(msg),
            other => CheckpointError::Storage(other.to_string()),
        }
    }
}

#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last applied event id (0 for a consumer never seen before).
    async fn get(&self, consumer: &str) -> Result<EventId, CheckpointError>;

    /// Advance the checkpoint. Setting the current value again is a no-op;
    /// a lower value is [`CheckpointError::Regression`].
    async fn set(&self, consumer: &str, event_id: EventId) -> Result<(), CheckpointError>;

    /// Rewind to 0 (rebuilds only).
    async fn reset(&self, consumer: &str) -> Result<(), CheckpointError>;

    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError>;

    async fn lag(&self, head: EventId) -> Result<Vec<ConsumerLag>, CheckpointError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .map(|c| ConsumerLag {
                lag: head.value().saturating_sub(c.last_applied_event_id.value()),
                consumer: c.consumer,
                last_applied_event_id: c.last_applied_event_id,
            })
            .collect())
    }
}

/// In-memory checkpoints. Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> CheckpointError {
    CheckpointError::Storage("lock poisoned".to_string())
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, consumer: &str) -> Result<EventId, CheckpointError> {
        let checkpoints = self.checkpoints.read().map_err(|_| poisoned())?;
        Ok(checkpoints
            .get(consumer)
            .map_or(EventId::ZERO, |c| c.last_applied_event_id))
    }

    async fn set(&self, consumer: &str, event_id: EventId) -> Result<(), CheckpointError> {
        let mut checkpoints = self.checkpoints.write().map_err(|_| poisoned())?;
        let entry = checkpoints.entry(consumer.to_string()).or_insert_with(|| Checkpoint {
            consumer: consumer.to_string(),
            last_applied_event_id: EventId::ZERO,
            updated_at: Utc::now(),
        });
        if event_id < entry.last_applied_event_id {
            return Err(CheckpointError::Regression {
                consumer: consumer.to_string(),
                current: entry.last_applied_event_id,
                attempted: event_id,
            });
        }
        entry.last_applied_event_id = event_id;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn reset(&self, consumer: &str) -> Result<(), CheckpointError> {
        let mut checkpoints = self.checkpoints.write().map_err(|_| poisoned())?;
        checkpoints.insert(
            consumer.to_string(),
            Checkpoint {
                consumer: consumer.to_string(),
                last_applied_event_id: EventId::ZERO,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let checkpoints = self.checkpoints.read().map_err(|_| poisoned())?;
        let mut all: Vec<_> = checkpoints.values().cloned().collect();
        all.sort_by(|a, b| a.consumer.cmp(&b.consumer));
        Ok(all)
    }
}

/// Postgres-backed checkpoints (`consumer_checkpoints`).
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn get(&self, consumer: &str) -> Result<EventId, CheckpointError> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT last_applied_event_id
            FROM consumer_checkpoints
            WHERE consumer_name = $1
            "#,
        )
        .bind(consumer)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_checkpoint", e))?;

        Ok(id.map_or(EventId::ZERO, EventId::from_i64))
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn set(&self, consumer: &str, event_id: EventId) -> Result<(), CheckpointError> {
        let result = sqlx::query(
            r#"
            INSERT INTO consumer_checkpoints (consumer_name, last_applied_event_id, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (consumer_name)
            DO UPDATE SET
                last_applied_event_id = EXCLUDED.last_applied_event_id,
                updated_at = NOW()
            WHERE consumer_checkpoints.last_applied_event_id <= EXCLUDED.last_applied_event_id
            "#,
        )
        .bind(consumer)
        .bind(event_id.as_i64())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_checkpoint", e))?;

        if result.rows_affected() == 0 {
            let current = self.get(consumer).await?;
            return Err(CheckpointError::Regression {
                consumer: consumer.to_string(),
                current,
                attempted: event_id,
            });
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn reset(&self, consumer: &str) -> Result<(), CheckpointError> {
        sqlx::query(
            r#"
            INSERT INTO consumer_checkpoints (consumer_name, last_applied_event_id, updated_at)
            VALUES ($1, 0, NOW())
            ON CONFLICT (consumer_name)
            DO UPDATE SET
                last_applied_event_id = 0,
                updated_at = NOW()
            "#,
        )
        .bind(consumer)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_checkpoint", e))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, CheckpointError> {
        let rows = sqlx::query(
            r#"
            SELECT consumer_name, last_applied_event_id, updated_at
            FROM consumer_checkpoints
            ORDER BY consumer_name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_checkpoints", e))?;

        rows.iter()
            .map(|row| {
                CheckpointRow::from_row(row)
                    .map(Checkpoint::from)
                    .map_err(|e| CheckpointError::Storage(format!("failed to decode checkpoint row: {e}")))
            })
            .collect()
    }
}

#[derive(Debug)]
struct CheckpointRow {
    consumer_name: String,
    last_applied_event_id: i64,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for CheckpointRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(CheckpointRow {
            consumer_name: row.try_get("consumer_name")?,
            last_applied_event_id: row.try_get("last_applied_event_id")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<CheckpointRow> for Checkpoint {
    fn from(row: CheckpointRow) -> Self {
        Checkpoint {
            consumer: row.consumer_name,
            last_applied_event_id: EventId::from_i64(row.last_applied_event_id),
            updated_at: row.updated_at,
        }
    }
}
