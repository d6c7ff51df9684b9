//! Postgres idempotency records.
//!
//! A reservation is an `INSERT .. ON CONFLICT DO NOTHING` of a row without a
//! response. Postgres makes a concurrent insert of the same key wait for the
//! first transaction, so a racing retry either sees the committed record or
//! takes over a rolled-back reservation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgExecutor, PgPool, Row};
use tracing::{debug, instrument};

use super::{
    CommandLog, CommandOutcome, CommandRequest, IdempotencyCheck, IdempotencyKey, IdempotencyRecord,
    IdempotencyStore, StoredResponse, effective_retention,
};
use crate::event_store::postgres::{append_in_tx, map_sqlx_error};
use crate::event_store::{EventStoreError, PostgresEventStore};

/// Postgres-backed [`IdempotencyStore`].
#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    #[instrument(skip_all, fields(endpoint = %key.endpoint_name), err)]
    async fn check_and_reserve(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
    ) -> Result<IdempotencyCheck, EventStoreError> {
        // A record purged between the insert and the select gets one more try.
        for _ in 0..2 {
            if reserve(&self.pool, key, request_hash).await? {
                return Ok(IdempotencyCheck::Fresh);
            }
            if let Some(record) = fetch_record(&self.pool, key).await? {
                return Ok(record.classify(request_hash));
            }
        }
        Err(EventStoreError::StorageUnavailable(
            "idempotency record changed during reservation".to_string(),
        ))
    }

    #[instrument(skip_all, fields(endpoint = %key.endpoint_name, status = response.status_code), err)]
    async fn record(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        response: StoredResponse,
    ) -> Result<(), EventStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_records (
                org_scope,
                actor_id,
                endpoint_name,
                idempotency_key,
                request_hash,
                response_status_code,
                response_body,
                completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (org_scope, actor_id, endpoint_name, idempotency_key)
            DO UPDATE SET
                response_status_code = EXCLUDED.response_status_code,
                response_body = EXCLUDED.response_body,
                completed_at = NOW()
            WHERE idempotency_records.request_hash = EXCLUDED.request_hash
              AND idempotency_records.response_status_code IS NULL
            "#,
        )
        .bind(&key.org_scope)
        .bind(&key.actor_id)
        .bind(&key.endpoint_name)
        .bind(&key.idempotency_key)
        .bind(request_hash)
        .bind(i32::from(response.status_code))
        .bind(&response.body)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_idempotency", e))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        // Already recorded (first response wins) or owned by another request.
        match fetch_record(&self.pool, key).await? {
            Some(existing) if existing.request_hash != request_hash => Err(key.reuse_error()),
            _ => Ok(()),
        }
    }

    async fn release(&self, key: &IdempotencyKey, request_hash: &str) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE org_scope = $1
              AND actor_id = $2
              AND endpoint_name = $3
              AND idempotency_key = $4
              AND request_hash = $5
              AND response_status_code IS NULL
            "#,
        )
        .bind(&key.org_scope)
        .bind(&key.actor_id)
        .bind(&key.endpoint_name)
        .bind(&key.idempotency_key)
        .bind(request_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_idempotency", e))?;
        Ok(())
    }

    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, EventStoreError> {
        fetch_record(&self.pool, key).await
    }

    #[instrument(skip(self), err)]
    async fn purge_expired(&self, retention: Duration) -> Result<u64, EventStoreError> {
        let retention = effective_retention(retention);
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE created_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(retention.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_idempotency", e))?;

        debug!(deleted = result.rows_affected(), "purged expired idempotency records");
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl CommandLog for PostgresEventStore {
    #[instrument(
        skip_all,
        fields(
            endpoint = %command.key.endpoint_name,
            aggregate = %command.aggregate,
            expected_seq = command.expected_seq.value()
        ),
        err
    )]
    async fn commit_command(&self, mut command: CommandRequest) -> Result<CommandOutcome, EventStoreError> {
        crate::event_store::validate::validate_batch(&command.events)?;

        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if !reserve(&mut *tx, &command.key, &command.request_hash).await? {
            let existing = fetch_record(&mut *tx, &command.key).await?;
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return match existing {
                Some(record) => {
                    let response = record.resolve(&command.request_hash)?;
                    debug!("replaying stored response");
                    Ok(CommandOutcome::Replayed(response))
                }
                None => Err(EventStoreError::StorageUnavailable(
                    "idempotency record changed during reservation".to_string(),
                )),
            };
        }

        // Dropping `tx` on any error below rolls the reservation back too.
        let events = std::mem::take(&mut command.events);
        let committed = append_in_tx(&mut tx, &command.aggregate, command.expected_seq, events).await?;

        let key = command.key.clone();
        let request_hash = command.request_hash.clone();
        let response = command.respond(&committed);
        complete(&mut *tx, &key, &request_hash, &response).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(CommandOutcome::Committed {
            events: committed,
            response,
        })
    }

    async fn find_command(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, EventStoreError> {
        fetch_record(self.pool(), key).await
    }
}

/// Insert a reservation; `false` if a record already exists.
async fn reserve<'e, E>(executor: E, key: &IdempotencyKey, request_hash: &str) -> Result<bool, EventStoreError>
where
    E: PgExecutor<'e>,
{
    let inserted = sqlx::query(
        r#"
        INSERT INTO idempotency_records (
            org_scope,
            actor_id,
            endpoint_name,
            idempotency_key,
            request_hash
        )
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (org_scope, actor_id, endpoint_name, idempotency_key)
        DO NOTHING
        RETURNING created_at
        "#,
    )
    .bind(&key.org_scope)
    .bind(&key.actor_id)
    .bind(&key.endpoint_name)
    .bind(&key.idempotency_key)
    .bind(request_hash)
    .fetch_optional(executor)
    .await
    .map_err(|e| map_sqlx_error("reserve_idempotency", e))?;

    Ok(inserted.is_some())
}

async fn complete<'e, E>(
    executor: E,
    key: &IdempotencyKey,
    request_hash: &str,
    response: &StoredResponse,
) -> Result<(), EventStoreError>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        UPDATE idempotency_records
        SET response_status_code = $6,
            response_body = $7,
            completed_at = NOW()
        WHERE org_scope = $1
          AND actor_id = $2
          AND endpoint_name = $3
          AND idempotency_key = $4
          AND request_hash = $5
        "#,
    )
    .bind(&key.org_scope)
    .bind(&key.actor_id)
    .bind(&key.endpoint_name)
    .bind(&key.idempotency_key)
    .bind(request_hash)
    .bind(i32::from(response.status_code))
    .bind(&response.body)
    .execute(executor)
    .await
    .map_err(|e| map_sqlx_error("complete_idempotency", e))?;
    Ok(())
}

async fn fetch_record<'e, E>(executor: E, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, EventStoreError>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query(
        r#"
        SELECT
            org_scope,
            actor_id,
            endpoint_name,
            idempotency_key,
            request_hash,
            response_status_code,
            response_body,
            created_at
        FROM idempotency_records
        WHERE org_scope = $1
          AND actor_id = $2
          AND endpoint_name = $3
          AND idempotency_key = $4
        "#,
    )
    .bind(&key.org_scope)
    .bind(&key.actor_id)
    .bind(&key.endpoint_name)
    .bind(&key.idempotency_key)
    .fetch_optional(executor)
    .await
    .map_err(|e| map_sqlx_error("fetch_idempotency", e))?;

    row.map(|row| {
        IdempotencyRow::from_row(&row)
            .map(IdempotencyRecord::from)
            .map_err(|e| EventStoreError::Storage(format!("failed to decode idempotency row: {e}")))
    })
    .transpose()
}

#[derive(Debug)]
struct IdempotencyRow {
    org_scope: String,
    actor_id: String,
    endpoint_name: String,
    idempotency_key: String,
    request_hash: String,
    response_status_code: Option<i32>,
    response_body: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for IdempotencyRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(IdempotencyRow {
            org_scope: row.try_get("org_scope")?,
            actor_id: row.try_get("actor_id")?,
            endpoint_name: row.try_get("endpoint_name")?,
            idempotency_key: row.try_get("idempotency_key")?,
            request_hash: row.try_get("request_hash")?,
            response_status_code: row.try_get("response_status_code")?,
            response_body: row.try_get("response_body")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<IdempotencyRow> for IdempotencyRecord {
    fn from(row: IdempotencyRow) -> Self {
        let response = row.response_status_code.map(|code| StoredResponse {
            status_code: u16::try_from(code).unwrap_or(500),
            body: row.response_body,
        });
        IdempotencyRecord {
            key: IdempotencyKey {
                org_scope: row.org_scope,
                actor_id: row.actor_id,
                endpoint_name: row.endpoint_name,
                idempotency_key: row.idempotency_key,
            },
            request_hash: row.request_hash,
            response,
            created_at: row.created_at,
        }
    }
}
