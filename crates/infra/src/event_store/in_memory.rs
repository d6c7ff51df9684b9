use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use eventlog_core::{AggregateRef, EventId, ExpectedSeq};

use super::query::{EventPage, ReadFilter, ReadPlan, ReadPolicy, ReadScope};
use super::r#trait::{EventStore, EventStoreError, NewEvent, StoredEvent};
use super::validate::validate_batch;
use crate::idempotency::{
    CommandLog, CommandOutcome, CommandRequest, IdempotencyCheck, IdempotencyKey, IdempotencyRecord,
    IdempotencyStore, IdempotencyTable, StoredResponse,
};

#[derive(Debug, Default)]
struct LogState {
    /// The global order; `events[i].event_id == i + 1`.
    events: Vec<StoredEvent>,
    /// Positions in `events` per aggregate, ascending by `aggregate_seq`.
    aggregates: HashMap<AggregateRef, Vec<usize>>,
    idempotency: IdempotencyTable,
}

impl LogState {
    fn head(&self) -> EventId {
        EventId::new(self.events.len() as u64)
    }

    fn latest_seq(&self, aggregate: &AggregateRef) -> u64 {
        self.aggregates.get(aggregate).map_or(0, |positions| positions.len() as u64)
    }

    /// The sequencer and the per-aggregate check share this one lock, so ids
    /// are handed out in commit order.
    fn append(
        &mut self,
        aggregate: &AggregateRef,
        expected_seq: ExpectedSeq,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let current = self.latest_seq(aggregate);
        if !expected_seq.matches(current) {
            return Err(EventStoreError::conflict(aggregate, expected_seq, Some(current)));
        }

        let mut committed = Vec::with_capacity(events.len());
        let positions = self.aggregates.entry(aggregate.clone()).or_default();
        for (offset, event) in events.into_iter().enumerate() {
            let position = self.events.len();
            let stored = StoredEvent::committed(
                EventId::new(position as u64 + 1),
                aggregate,
                expected_seq.first_assigned() + offset as u64,
                event,
            );
            self.events.push(stored.clone());
            positions.push(position);
            committed.push(stored);
        }
        Ok(committed)
    }
}

/// In-memory append-only event log.
///
/// Intended for tests/dev. One `RwLock` guards the log, the sequencer and the
/// idempotency records; it is never held across an `.await`.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    state: RwLock<LogState>,
    read_policy: ReadPolicy,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_policy(read_policy: ReadPolicy) -> Self {
        Self {
            state: RwLock::default(),
            read_policy,
        }
    }

    /// Number of committed events.
    pub fn len(&self) -> Result<usize, EventStoreError> {
        self.read_state(|s| s.events.len())
    }

    pub fn is_empty(&self) -> Result<bool, EventStoreError> {
        Ok(self.len()? == 0)
    }

    fn read_state<T>(&self, f: impl FnOnce(&LogState) -> T) -> Result<T, EventStoreError> {
        let state = self.state.read().map_err(|_| EventStoreError::lock_poisoned())?;
        Ok(f(&state))
    }

    fn write_state<T>(&self, f: impl FnOnce(&mut LogState) -> T) -> Result<T, EventStoreError> {
        let mut state = self.state.write().map_err(|_| EventStoreError::lock_poisoned())?;
        Ok(f(&mut state))
    }
}

#[async_trait::async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        aggregate: &AggregateRef,
        expected_seq: ExpectedSeq,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        validate_batch(&events)?;
        let committed = self.write_state(|s| s.append(aggregate, expected_seq, events))??;
        debug!(
            aggregate = %aggregate,
            first_event_id = %committed[0].event_id,
            count = committed.len(),
            "appended events"
        );
        Ok(committed)
    }

    async fn read(
        &self,
        after: EventId,
        limit: Option<usize>,
        filter: &ReadFilter,
        scope: &ReadScope,
    ) -> Result<EventPage, EventStoreError> {
        let plan = ReadPlan::authorize(after, limit, filter, scope, &self.read_policy)?;
        self.read_state(|s| {
            let start = usize::try_from(plan.after.value()).unwrap_or(usize::MAX).min(s.events.len());
            let matching: Vec<StoredEvent> = s.events[start..]
                .iter()
                .filter(|e| plan.matches(e))
                .take(plan.limit + 1)
                .cloned()
                .collect();
            let head = s.head();
            plan.into_page(matching, head)
        })
    }

    async fn load_aggregate(&self, aggregate: &AggregateRef) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.read_state(|s| {
            s.aggregates
                .get(aggregate)
                .map(|positions| positions.iter().map(|&p| s.events[p].clone()).collect())
                .unwrap_or_default()
        })
    }

    async fn latest_seq(&self, aggregate: &AggregateRef) -> Result<u64, EventStoreError> {
        self.read_state(|s| s.latest_seq(aggregate))
    }

    async fn head(&self) -> Result<EventId, EventStoreError> {
        self.read_state(LogState::head)
    }
}

#[async_trait::async_trait]
impl CommandLog for InMemoryEventStore {
    async fn commit_command(&self, mut command: CommandRequest) -> Result<CommandOutcome, EventStoreError> {
        validate_batch(&command.events)?;
        let key = command.key.clone();
        let request_hash = command.request_hash.clone();
        let aggregate = command.aggregate.clone();
        let events = std::mem::take(&mut command.events);

        self.write_state(move |s| {
            if let Some(response) = s.idempotency.precheck(&key, &request_hash)? {
                debug!(endpoint = %key.endpoint_name, "replaying stored response");
                return Ok(CommandOutcome::Replayed(response));
            }
            let committed = s.append(&aggregate, command.expected_seq, events)?;
            let response = command.respond(&committed);
            s.idempotency.record(&key, &request_hash, response.clone())?;
            Ok(CommandOutcome::Committed {
                events: committed,
                response,
            })
        })?
    }

    async fn find_command(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, EventStoreError> {
        self.read_state(|s| s.idempotency.lookup(key))
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for InMemoryEventStore {
    async fn check_and_reserve(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
    ) -> Result<IdempotencyCheck, EventStoreError> {
        self.write_state(|s| s.idempotency.check_and_reserve(key, request_hash))
    }

    async fn record(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        response: StoredResponse,
    ) -> Result<(), EventStoreError> {
        self.write_state(|s| s.idempotency.record(key, request_hash, response))?
    }

    async fn release(&self, key: &IdempotencyKey, request_hash: &str) -> Result<(), EventStoreError> {
        self.write_state(|s| s.idempotency.release(key, request_hash))
    }

    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, EventStoreError> {
        self.read_state(|s| s.idempotency.lookup(key))
    }

    async fn purge_expired(&self, retention: Duration) -> Result<u64, EventStoreError> {
        self.write_state(|s| s.idempotency.purge_expired(retention, Utc::now()))
    }
}
