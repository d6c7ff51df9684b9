use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use eventlog_core::{ActorType, AggregateRef, DomainError, EventId, ExpectedSeq, OrgId, RequestId};
use eventlog_events::{EventEnvelope, EventPayload};

use super::query::{EventPage, ReadFilter, ReadScope};

/// Who caused an event and in response to which request.
///
/// Every event of one command carries the same metadata, except
/// `causation_id`, which a reactive writer (reconciler, scheduler) sets to the
/// event that triggered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub actor_type: ActorType,
    pub actor_id: String,
    pub org_id: Option<OrgId>,
    pub request_id: RequestId,
    pub idempotency_key: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<EventId>,
}

impl EventMetadata {
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>, org_id: Option<OrgId>, request_id: RequestId) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            org_id,
            request_id,
            idempotency_key: None,
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Metadata for events emitted by the control plane itself.
    pub fn system(actor_id: impl Into<String>, org_id: Option<OrgId>) -> Self {
        Self::new(ActorType::System, actor_id, org_id, RequestId::new())
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn caused_by(mut self, event_id: EventId) -> Self {
        self.causation_id = Some(event_id);
        self
    }
}

/// An event submitted for append; positions are assigned at commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub metadata: EventMetadata,
    pub payload: JsonValue,
}

impl NewEvent {
    /// Build from a typed payload; type name and version come from the payload type.
    pub fn from_typed<P>(payload: &P, metadata: EventMetadata) -> Result<Self, EventStoreError>
    where
        P: EventPayload,
    {
        let payload = serde_json::to_value(payload)
            .map_err(|e| EventStoreError::Validation(format!("payload serialization failed: {e}")))?;
        Ok(Self {
            event_type: P::EVENT_TYPE.to_string(),
            event_version: P::EVENT_VERSION,
            occurred_at: Utc::now(),
            metadata,
            payload,
        })
    }

    /// Build from an already-encoded JSON payload.
    pub fn raw(
        event_type: impl Into<String>,
        event_version: u32,
        payload: JsonValue,
        metadata: EventMetadata,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_version,
            occurred_at: Utc::now(),
            metadata,
            payload,
        }
    }

    pub fn occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// A committed event.
///
/// `event_id` is the global order and `aggregate_seq` the per-aggregate
/// order. Both are assigned by the store and never change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub occurred_at: DateTime<Utc>,
    pub aggregate: AggregateRef,
    pub aggregate_seq: u64,
    pub event_type: String,
    pub event_version: u32,
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub payload: JsonValue,
}

impl StoredEvent {
    pub(crate) fn committed(
        event_id: EventId,
        aggregate: &AggregateRef,
        aggregate_seq: u64,
        event: NewEvent,
    ) -> Self {
        Self {
            event_id,
            occurred_at: event.occurred_at,
            aggregate: aggregate.clone(),
            aggregate_seq,
            event_type: event.event_type,
            event_version: event.event_version,
            metadata: event.metadata,
            payload: event.payload,
        }
    }

    pub fn org_id(&self) -> Option<OrgId> {
        self.metadata.org_id
    }

    /// Consumer-facing view of this event.
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.metadata.org_id,
            self.aggregate.clone(),
            self.aggregate_seq,
            self.event_type.clone(),
            self.event_version,
            self.occurred_at,
            self.payload.clone(),
        )
    }
}

/// Event store failure.
///
/// Conflicts, key reuse and validation failures are deterministic answers to
/// the request and are never retried by the store. `StorageUnavailable` is
/// transient; see [`EventStoreError::is_retryable`].
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Another writer advanced the aggregate past `expected`.
    #[error("aggregate conflict on {aggregate}: expected seq {expected}, found {}", display_seq(.actual))]
    AggregateConflict {
        aggregate: AggregateRef,
        expected: u64,
        /// `None` when the conflict was detected by the unique constraint.
        actual: Option<u64>,
    },

    #[error("idempotency key '{idempotency_key}' reused with a different request on {endpoint_name}")]
    IdempotencyKeyReuse {
        endpoint_name: String,
        idempotency_key: String,
    },

    #[error("request with idempotency key '{idempotency_key}' on {endpoint_name} is still in flight")]
    IdempotencyInFlight {
        endpoint_name: String,
        idempotency_key: String,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

fn display_seq(actual: &Option<u64>) -> String {
    match actual {
        Some(seq) => seq.to_string(),
        None => "a newer head".to_string(),
    }
}

impl EventStoreError {
    /// Transient failures: the same request may succeed if retried unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventStoreError::StorageUnavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EventStoreError::AggregateConflict { .. })
    }

    pub(crate) fn conflict(aggregate: &AggregateRef, expected: ExpectedSeq, actual: Option<u64>) -> Self {
        EventStoreError::AggregateConflict {
            aggregate: aggregate.clone(),
            expected: expected.value(),
            actual,
        }
    }

    pub(crate) fn lock_poisoned() -> Self {
        EventStoreError::Storage("lock poisoned".to_string())
    }
}

impl From<DomainError> for EventStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) | DomainError::Conflict(msg) => {
                EventStoreError::Validation(msg)
            }
        }
    }
}

/// Append-only event log.
///
/// ## Append
///
/// `append` commits a batch for a single aggregate atomically:
/// - every event gets a contiguous `aggregate_seq` starting at
///   `expected_seq + 1` and a distinct, increasing `event_id`, or nothing is
///   written
/// - a stale `expected_seq` is [`EventStoreError::AggregateConflict`]; the
///   caller re-reads and decides again
/// - success means the events are durable and visible to every later read
///
/// ## Read
///
/// `read` pages through the global order (`event_id > after`, ascending)
/// under a [`ReadScope`]. The returned `next_after_event_id` is where the
/// caller resumes; filtering never skips past events the caller has not been
/// shown.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    async fn append(
        &self,
        aggregate: &AggregateRef,
        expected_seq: ExpectedSeq,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    async fn read(
        &self,
        after: EventId,
        limit: Option<usize>,
        filter: &ReadFilter,
        scope: &ReadScope,
    ) -> Result<EventPage, EventStoreError>;

    /// Every event of one aggregate, ascending by `aggregate_seq`.
    async fn load_aggregate(&self, aggregate: &AggregateRef) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Highest `aggregate_seq` of an aggregate (0 if it has no events).
    async fn latest_seq(&self, aggregate: &AggregateRef) -> Result<u64, EventStoreError>;

    /// Highest committed `event_id` (0 if the log is empty).
    async fn head(&self) -> Result<EventId, EventStoreError>;
}

#[async_trait::async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(
        &self,
        aggregate: &AggregateRef,
        expected_seq: ExpectedSeq,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(aggregate, expected_seq, events).await
    }

    async fn read(
        &self,
        after: EventId,
        limit: Option<usize>,
        filter: &ReadFilter,
        scope: &ReadScope,
    ) -> Result<EventPage, EventStoreError> {
        (**self).read(after, limit, filter, scope).await
    }

    async fn load_aggregate(&self, aggregate: &AggregateRef) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_aggregate(aggregate).await
    }

    async fn latest_seq(&self, aggregate: &AggregateRef) -> Result<u64, EventStoreError> {
        (**self).latest_seq(aggregate).await
    }

    async fn head(&self) -> Result<EventId, EventStoreError> {
        (**self).head().await
    }
}
