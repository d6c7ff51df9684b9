//! Postgres-backed event log.
//!
//! Schema lives in `migrations/0001_event_log.sql`. `event_id` is a
//! `BIGINT GENERATED ALWAYS AS IDENTITY` column; the unique constraint on
//! `(aggregate_type, aggregate_id, aggregate_seq)` is the backstop for
//! per-aggregate ordering.
//!
//! ## Commit order
//!
//! Appends take a transaction-scoped advisory lock before reading the
//! aggregate head and inserting. Identity values are therefore handed out in
//! commit order, and a reader that sees `event_id = n` has already been able
//! to see every id below `n`. Without it a consumer could checkpoint past an
//! id that commits later.
//!
//! The lock is a single global key ([`APPEND_LOCK_KEY`]), not one per
//! aggregate: every append on the database is serialized, including appends
//! to unrelated aggregates, and held until its transaction commits. Append
//! throughput is bounded by one writer at a time. Under the lock the
//! expected-seq check never races, so the unique constraint only fires for
//! writers that bypass this module.
//!
//! ## Error mapping
//!
//! | SQLx error                                   | `EventStoreError`      |
//! |----------------------------------------------|------------------------|
//! | unique violation (`23505`) on insert         | `AggregateConflict`    |
//! | serialization failure / deadlock (`40001`, `40P01`) | `StorageUnavailable` |
//! | admin shutdown, crash, cannot connect (`57P0x`), connection errors (`08xxx`), too many connections (`53300`) | `StorageUnavailable` |
//! | I/O, pool timeout, pool closed               | `StorageUnavailable`   |
//! | anything else                                | `Storage`              |

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, field, instrument};
use uuid::Uuid;

use eventlog_core::{ActorType, AggregateRef, AggregateType, EventId, ExpectedSeq, OrgId, RequestId};

use super::query::{EventPage, ReadFilter, ReadPlan, ReadPolicy, ReadScope};
use super::r#trait::{EventMetadata, EventStore, EventStoreError, NewEvent, StoredEvent};
use super::validate::validate_batch;

/// Advisory lock key serializing every append (ASCII "eventlog"). Anything
/// else inserting into `events` must take it too.
pub const APPEND_LOCK_KEY: i64 = 0x6576_656e_746c_6f67;

const EVENT_COLUMNS: &str = r#"
    event_id,
    occurred_at,
    aggregate_type,
    aggregate_id,
    aggregate_seq,
    event_type,
    event_version,
    actor_type,
    actor_id,
    org_id,
    request_id,
    idempotency_key,
    correlation_id,
    causation_id,
    payload
"#;

/// Postgres-backed append-only event log.
///
/// Only issues `INSERT` and `SELECT` against `events`; the migration revokes
/// everything else from the runtime role.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    read_policy: ReadPolicy,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            read_policy: ReadPolicy::default(),
        }
    }

    pub fn with_read_policy(mut self, read_policy: ReadPolicy) -> Self {
        self.read_policy = read_policy;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(
        skip_all,
        fields(
            aggregate = %aggregate,
            expected_seq = expected_seq.value(),
            event_count = events.len(),
            first_event_id = field::Empty
        ),
        err
    )]
    pub async fn append_events(
        &self,
        aggregate: &AggregateRef,
        expected_seq: ExpectedSeq,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        validate_batch(&events)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let committed = append_in_tx(&mut tx, aggregate, expected_seq, events).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        if let Some(first) = committed.first() {
            Span::current().record("first_event_id", first.event_id.value());
        }
        Ok(committed)
    }

    #[instrument(skip_all, fields(after = %after, scope = ?scope, returned = field::Empty), err)]
    pub async fn read_page(
        &self,
        after: EventId,
        limit: Option<usize>,
        filter: &ReadFilter,
        scope: &ReadScope,
    ) -> Result<EventPage, EventStoreError> {
        let plan = ReadPlan::authorize(after, limit, filter, scope, &self.read_policy)?;

        // Page and head must come from the same snapshot.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_transaction", e))?;

        let excluded: Vec<String> = plan.excluded_types.iter().map(|t| t.as_str().to_string()).collect();
        let fetch = i64::try_from(plan.limit + 1).unwrap_or(i64::MAX);
        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE event_id > $1
              AND ($2::uuid IS NULL OR org_id = $2)
              AND ($3::text IS NULL OR aggregate_type = $3)
              AND ($4::text IS NULL OR aggregate_id = $4)
              AND ($5::text IS NULL OR event_type = $5)
              AND NOT (aggregate_type = ANY($6))
            ORDER BY event_id ASC
            LIMIT $7
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(plan.after.as_i64())
            .bind(plan.filter.org_id.map(Uuid::from))
            .bind(plan.filter.aggregate_type.as_ref().map(|t| t.as_str()))
            .bind(plan.filter.aggregate_id.as_deref())
            .bind(plan.filter.event_type.as_deref())
            .bind(&excluded)
            .bind(fetch)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("read_events", e))?;

        let events = decode_rows(rows)?;
        let head = head_in(&mut *tx).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let page = plan.into_page(events, head);
        Span::current().record("returned", page.events.len());
        Ok(page)
    }

    #[instrument(skip_all, fields(aggregate = %aggregate), err)]
    pub async fn load_aggregate_events(&self, aggregate: &AggregateRef) -> Result<Vec<StoredEvent>, EventStoreError> {
        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE aggregate_type = $1 AND aggregate_id = $2
            ORDER BY aggregate_seq ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(aggregate.aggregate_type.as_str())
            .bind(&aggregate.aggregate_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_aggregate", e))?;

        decode_rows(rows)
    }
}

#[async_trait::async_trait]
impl EventStore for PostgresEventStore {
    async fn append(
        &self,
        aggregate: &AggregateRef,
        expected_seq: ExpectedSeq,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.append_events(aggregate, expected_seq, events).await
    }

    async fn read(
        &self,
        after: EventId,
        limit: Option<usize>,
        filter: &ReadFilter,
        scope: &ReadScope,
    ) -> Result<EventPage, EventStoreError> {
        self.read_page(after, limit, filter, scope).await
    }

    async fn load_aggregate(&self, aggregate: &AggregateRef) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.load_aggregate_events(aggregate).await
    }

    async fn latest_seq(&self, aggregate: &AggregateRef) -> Result<u64, EventStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        latest_seq_in(&mut *conn, aggregate).await
    }

    async fn head(&self) -> Result<EventId, EventStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        head_in(&mut *conn).await
    }
}

/// Append a validated batch inside an open transaction.
///
/// Shared with the idempotent command path so reservation, append and
/// response recording commit together.
pub(crate) async fn append_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    aggregate: &AggregateRef,
    expected_seq: ExpectedSeq,
    events: Vec<NewEvent>,
) -> Result<Vec<StoredEvent>, EventStoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(APPEND_LOCK_KEY)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("advisory_lock", e))?;

    let current = latest_seq_in(&mut **tx, aggregate).await?;
    if !expected_seq.matches(current) {
        return Err(EventStoreError::conflict(aggregate, expected_seq, Some(current)));
    }

    let mut committed = Vec::with_capacity(events.len());
    let mut next_seq = expected_seq.first_assigned();
    for event in events {
        let meta = &event.metadata;
        let row = sqlx::query(
            r#"
            INSERT INTO events (
                occurred_at,
                aggregate_type,
                aggregate_id,
                aggregate_seq,
                event_type,
                event_version,
                actor_type,
                actor_id,
                org_id,
                request_id,
                idempotency_key,
                correlation_id,
                causation_id,
                payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING event_id
            "#,
        )
        .bind(event.occurred_at)
        .bind(aggregate.aggregate_type.as_str())
        .bind(&aggregate.aggregate_id)
        .bind(i64::try_from(next_seq).unwrap_or(i64::MAX))
        .bind(&event.event_type)
        .bind(i32::try_from(event.event_version).unwrap_or(i32::MAX))
        .bind(meta.actor_type.as_str())
        .bind(&meta.actor_id)
        .bind(meta.org_id.map(Uuid::from))
        .bind(Uuid::from(meta.request_id))
        .bind(meta.idempotency_key.as_deref())
        .bind(meta.correlation_id.as_deref())
        .bind(meta.causation_id.map(EventId::as_i64))
        .bind(&event.payload)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EventStoreError::conflict(aggregate, expected_seq, None)
            } else {
                map_sqlx_error("insert_event", e)
            }
        })?;

        let event_id: i64 = row
            .try_get("event_id")
            .map_err(|e| EventStoreError::Storage(format!("failed to read event_id: {e}")))?;
        committed.push(StoredEvent::committed(EventId::from_i64(event_id), aggregate, next_seq, event));
        next_seq += 1;
    }

    Ok(committed)
}

async fn latest_seq_in<'e, E>(executor: E, aggregate: &AggregateRef) -> Result<u64, EventStoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    let seq: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(MAX(aggregate_seq), 0)::BIGINT
        FROM events
        WHERE aggregate_type = $1 AND aggregate_id = $2
        "#,
    )
    .bind(aggregate.aggregate_type.as_str())
    .bind(&aggregate.aggregate_id)
    .fetch_one(executor)
    .await
    .map_err(|e| map_sqlx_error("latest_seq", e))?;

    Ok(u64::try_from(seq).unwrap_or(0))
}

async fn head_in<'e, E>(executor: E) -> Result<EventId, EventStoreError>
where
    E: sqlx::PgExecutor<'e>,
{
    let head: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(event_id), 0)::BIGINT FROM events")
        .fetch_one(executor)
        .await
        .map_err(|e| map_sqlx_error("head", e))?;
    Ok(EventId::from_i64(head))
}

/// Map SQLx errors to `EventStoreError`, separating transient failures.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some(code) if is_transient_code(code) => EventStoreError::StorageUnavailable(msg),
                _ => EventStoreError::Storage(msg),
            }
        }
        sqlx::Error::Io(e) => EventStoreError::StorageUnavailable(format!("i/o error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => {
            EventStoreError::StorageUnavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::StorageUnavailable(format!("connection pool closed in {operation}"))
        }
        other => EventStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_transient_code(code: &str) -> bool {
    matches!(code, "40001" | "40P01" | "57P01" | "57P02" | "57P03" | "53300") || code.starts_with("08")
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<StoredEvent>, EventStoreError> {
    rows.iter()
        .map(|row| {
            StoredEventRow::from_row(row)
                .map_err(|e| EventStoreError::Storage(format!("failed to decode event row: {e}")))?
                .try_into()
        })
        .collect()
}

// SQLx row types

#[derive(Debug)]
struct StoredEventRow {
    event_id: i64,
    occurred_at: DateTime<Utc>,
    aggregate_type: String,
    aggregate_id: String,
    aggregate_seq: i64,
    event_type: String,
    event_version: i32,
    actor_type: String,
    actor_id: String,
    org_id: Option<Uuid>,
    request_id: Uuid,
    idempotency_key: Option<String>,
    correlation_id: Option<String>,
    causation_id: Option<i64>,
    payload: serde_json::Value,
}

impl<'r> FromRow<'r, PgRow> for StoredEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            event_id: row.try_get("event_id")?,
            occurred_at: row.try_get("occurred_at")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_seq: row.try_get("aggregate_seq")?,
            event_type: row.try_get("event_type")?,
            event_version: row.try_get("event_version")?,
            actor_type: row.try_get("actor_type")?,
            actor_id: row.try_get("actor_id")?,
            org_id: row.try_get("org_id")?,
            request_id: row.try_get("request_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            correlation_id: row.try_get("correlation_id")?,
            causation_id: row.try_get("causation_id")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl TryFrom<StoredEventRow> for StoredEvent {
    type Error = EventStoreError;

    fn try_from(row: StoredEventRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, e: eventlog_core::DomainError| {
            EventStoreError::Storage(format!("corrupt event row {}: {what}: {e}", row.event_id))
        };
        let aggregate_type = AggregateType::new(row.aggregate_type.clone()).map_err(|e| corrupt("aggregate_type", e))?;
        let aggregate =
            AggregateRef::new(aggregate_type, row.aggregate_id.clone()).map_err(|e| corrupt("aggregate_id", e))?;
        let actor_type: ActorType = row.actor_type.parse().map_err(|e| corrupt("actor_type", e))?;

        Ok(StoredEvent {
            event_id: EventId::from_i64(row.event_id),
            occurred_at: row.occurred_at,
            aggregate,
            aggregate_seq: u64::try_from(row.aggregate_seq).unwrap_or(0),
            event_type: row.event_type,
            event_version: u32::try_from(row.event_version).unwrap_or(0),
            metadata: EventMetadata {
                actor_type,
                actor_id: row.actor_id,
                org_id: row.org_id.map(OrgId::from_uuid),
                request_id: RequestId::from_uuid(row.request_id),
                idempotency_key: row.idempotency_key,
                correlation_id: row.correlation_id,
                causation_id: row.causation_id.map(EventId::from_i64),
            },
            payload: row.payload,
        })
    }
}
