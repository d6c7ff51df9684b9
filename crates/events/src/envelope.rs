use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eventlog_core::{AggregateRef, EventId, OrgId};

/// Consumer-facing view of a committed event.
///
/// This is what projections and other consumers see: global position,
/// stream position, type/version and the payload. Actor and request metadata
/// stay on the stored event; projections never need them to derive state.
///
/// Notes:
/// - `event_id` is the global order; `aggregate_seq` is the per-stream order.
/// - `occurred_at` is informational only and never used for ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: EventId,
    org_id: Option<OrgId>,

    aggregate: AggregateRef,
    aggregate_seq: u64,

    event_type: String,
    event_version: u32,
    occurred_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_id: EventId,
        org_id: Option<OrgId>,
        aggregate: AggregateRef,
        aggregate_seq: u64,
        event_type: impl Into<String>,
        event_version: u32,
        occurred_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            org_id,
            aggregate,
            aggregate_seq,
            event_type: event_type.into(),
            event_version,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn org_id(&self) -> Option<OrgId> {
        self.org_id
    }

    pub fn aggregate(&self) -> &AggregateRef {
        &self.aggregate
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate.aggregate_id
    }

    pub fn aggregate_seq(&self) -> u64 {
        self.aggregate_seq
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> u32 {
        self.event_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Same metadata, different payload representation (e.g. JSON → typed).
    pub fn with_payload<P>(&self, payload: P) -> EventEnvelope<P> {
        EventEnvelope {
            event_id: self.event_id,
            org_id: self.org_id,
            aggregate: self.aggregate.clone(),
            aggregate_seq: self.aggregate_seq,
            event_type: self.event_type.clone(),
            event_version: self.event_version,
            occurred_at: self.occurred_at,
            payload,
        }
    }
}
