//! Idempotency guard: deduplicates retried commands.
//!
//! A record is keyed by `(org scope, actor, endpoint, idempotency key)` and
//! holds the hash of the normalized request plus the response the first
//! execution produced. A retry with the same hash gets that response back
//! without re-executing; the same key with a different hash is a client error.
//!
//! [`CommandLog::commit_command`] is the preferred entry point: reservation,
//! append and response recording happen in one transaction (Postgres) or under
//! one lock (in-memory), so a racing retry can never observe a command that
//! executed without its record.

pub mod postgres;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use eventlog_core::{AggregateRef, ExpectedSeq, OrgId};

use crate::event_store::{EventStore, EventStoreError, NewEvent, StoredEvent};

pub use postgres::PostgresIdempotencyStore;

/// Org scope used for requests that are not tied to an org.
pub const GLOBAL_SCOPE: &str = "_global";

/// Records are kept at least this long, whatever retention is requested.
pub const MIN_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

const MAX_PART_LEN: usize = 255;

/// Composite key of an idempotency record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub org_scope: String,
    pub actor_id: String,
    pub endpoint_name: String,
    pub idempotency_key: String,
}

impl IdempotencyKey {
    pub fn new(
        org_id: Option<OrgId>,
        actor_id: impl Into<String>,
        endpoint_name: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Result<Self, EventStoreError> {
        let key = Self {
            org_scope: org_id.map_or_else(|| GLOBAL_SCOPE.to_string(), |org| org.to_string()),
            actor_id: actor_id.into(),
            endpoint_name: endpoint_name.into(),
            idempotency_key: idempotency_key.into(),
        };
        for (field, value) in [
            ("actor_id", &key.actor_id),
            ("endpoint_name", &key.endpoint_name),
            ("idempotency_key", &key.idempotency_key),
        ] {
            if value.trim().is_empty() || value.len() > MAX_PART_LEN {
                return Err(EventStoreError::Validation(format!(
                    "{field} must be 1..={MAX_PART_LEN} bytes"
                )));
            }
        }
        Ok(key)
    }

    fn reuse_error(&self) -> EventStoreError {
        EventStoreError::IdempotencyKeyReuse {
            endpoint_name: self.endpoint_name.clone(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }

    fn in_flight_error(&self) -> EventStoreError {
        EventStoreError::IdempotencyInFlight {
            endpoint_name: self.endpoint_name.clone(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }
}

/// Durable copy of what the first execution answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status_code: u16,
    pub body: Option<JsonValue>,
}

impl StoredResponse {
    pub fn new(status_code: u16, body: Option<JsonValue>) -> Self {
        Self { status_code, body }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub request_hash: String,
    /// `None` while the first execution is still in flight.
    pub response: Option<StoredResponse>,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    fn classify(&self, request_hash: &str) -> IdempotencyCheck {
        if self.request_hash != request_hash {
            return IdempotencyCheck::Conflict;
        }
        match &self.response {
            Some(response) => IdempotencyCheck::Replay(response.clone()),
            None => IdempotencyCheck::InFlight,
        }
    }

    /// The stored response for a retry of this request, or why there is none.
    pub fn resolve(&self, request_hash: &str) -> Result<StoredResponse, EventStoreError> {
        match self.classify(request_hash) {
            IdempotencyCheck::Replay(response) => Ok(response),
            IdempotencyCheck::Conflict => Err(self.key.reuse_error()),
            IdempotencyCheck::InFlight | IdempotencyCheck::Fresh => Err(self.key.in_flight_error()),
        }
    }
}

/// Answer of [`IdempotencyStore::check_and_reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyCheck {
    /// No prior record; a reservation now exists. Execute, then `record`.
    Fresh,
    /// Same request seen before; return this response without executing.
    Replay(StoredResponse),
    /// Same key, different request.
    Conflict,
    /// Same request reserved by an execution that has not recorded yet.
    InFlight,
}

/// Hash of a normalized request: SHA-256 over `endpoint_name`, a newline and
/// the request in RFC 8785 canonical JSON (sorted keys, normalized numbers),
/// hex encoded.
pub fn request_hash(endpoint_name: &str, request: &impl Serialize) -> Result<String, EventStoreError> {
    let value = serde_json::to_value(request)
        .map_err(|e| EventStoreError::Validation(format!("request serialization failed: {e}")))?;
    let canonical = canonical_json(&value)?;

    let mut hasher = Sha256::new();
    hasher.update(endpoint_name.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

fn canonical_json(value: &JsonValue) -> Result<String, EventStoreError> {
    serde_json_canonicalizer::to_string(value)
        .map_err(|e| EventStoreError::Validation(format!("request cannot be canonicalized: {e}")))
}

/// Retention actually applied by `purge_expired`.
pub fn effective_retention(requested: Duration) -> Duration {
    requested.max(MIN_RETENTION)
}

/// Standalone idempotency guard, for commands whose effects are not a single
/// event-store append.
#[async_trait::async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn check_and_reserve(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
    ) -> Result<IdempotencyCheck, EventStoreError>;

    /// Store the response for a reservation (or create the record outright).
    /// Recording twice keeps the first response.
    async fn record(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        response: StoredResponse,
    ) -> Result<(), EventStoreError>;

    /// Drop a reservation whose execution failed, so a retry can run again.
    /// Recorded responses are never released.
    async fn release(&self, key: &IdempotencyKey, request_hash: &str) -> Result<(), EventStoreError>;

    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, EventStoreError>;

    /// Delete records older than `retention` (never less than [`MIN_RETENTION`]).
    /// Returns the number of records deleted.
    async fn purge_expired(&self, retention: Duration) -> Result<u64, EventStoreError>;
}

type ResponseFn = Box<dyn FnOnce(&[StoredEvent]) -> StoredResponse + Send>;

/// One idempotent command: the append it performs and how to answer it.
pub struct CommandRequest {
    pub key: IdempotencyKey,
    pub request_hash: String,
    pub aggregate: AggregateRef,
    pub expected_seq: ExpectedSeq,
    pub events: Vec<NewEvent>,
    respond: ResponseFn,
}

impl CommandRequest {
    /// `respond` builds the response from the committed events; it runs inside
    /// the commit, so it must be quick and infallible.
    pub fn new(
        key: IdempotencyKey,
        request_hash: impl Into<String>,
        aggregate: AggregateRef,
        expected_seq: ExpectedSeq,
        mut events: Vec<NewEvent>,
        respond: impl FnOnce(&[StoredEvent]) -> StoredResponse + Send + 'static,
    ) -> Self {
        for event in &mut events {
            event
                .metadata
                .idempotency_key
                .get_or_insert_with(|| key.idempotency_key.clone());
        }
        Self {
            key,
            request_hash: request_hash.into(),
            aggregate,
            expected_seq,
            events,
            respond: Box::new(respond),
        }
    }

    pub(crate) fn respond(self, committed: &[StoredEvent]) -> StoredResponse {
        (self.respond)(committed)
    }
}

impl core::fmt::Debug for CommandRequest {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandRequest")
            .field("key", &self.key)
            .field("request_hash", &self.request_hash)
            .field("aggregate", &self.aggregate)
            .field("expected_seq", &self.expected_seq)
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// First execution: the events were appended and the response recorded.
    Committed {
        events: Vec<StoredEvent>,
        response: StoredResponse,
    },
    /// A retry: nothing was appended.
    Replayed(StoredResponse),
}

impl CommandOutcome {
    pub fn response(&self) -> &StoredResponse {
        match self {
            CommandOutcome::Committed { response, .. } => response,
            CommandOutcome::Replayed(response) => response,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, CommandOutcome::Replayed(_))
    }
}

/// Event store that can commit an idempotent command atomically.
#[async_trait::async_trait]
pub trait CommandLog: EventStore {
    /// Reserve the key, append and record the response as one unit.
    ///
    /// A replay returns the stored response and appends nothing. Key reuse is
    /// [`EventStoreError::IdempotencyKeyReuse`]. On any append failure the
    /// reservation is rolled back with it.
    async fn commit_command(&self, command: CommandRequest) -> Result<CommandOutcome, EventStoreError>;

    /// The idempotency record for `key`, if any (completed or in flight).
    async fn find_command(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, EventStoreError>;
}

/// In-memory idempotency records. No locking of its own; owners wrap it.
#[derive(Debug, Default)]
pub(crate) struct IdempotencyTable {
    records: HashMap<IdempotencyKey, IdempotencyRecord>,
}

impl IdempotencyTable {
    /// Classify without reserving; `None` means no record exists.
    pub fn check(&self, key: &IdempotencyKey, request_hash: &str) -> Option<IdempotencyCheck> {
        self.records.get(key).map(|r| r.classify(request_hash))
    }

    pub fn check_and_reserve(&mut self, key: &IdempotencyKey, request_hash: &str) -> IdempotencyCheck {
        if let Some(existing) = self.check(key, request_hash) {
            return existing;
        }
        self.records.insert(
            key.clone(),
            IdempotencyRecord {
                key: key.clone(),
                request_hash: request_hash.to_string(),
                response: None,
                created_at: Utc::now(),
            },
        );
        IdempotencyCheck::Fresh
    }

    pub fn record(
        &mut self,
        key: &IdempotencyKey,
        request_hash: &str,
        response: StoredResponse,
    ) -> Result<(), EventStoreError> {
        let record = self
            .records
            .entry(key.clone())
            .or_insert_with(|| IdempotencyRecord {
                key: key.clone(),
                request_hash: request_hash.to_string(),
                response: None,
                created_at: Utc::now(),
            });
        if record.request_hash != request_hash {
            return Err(key.reuse_error());
        }
        if record.response.is_none() {
            record.response = Some(response);
        }
        Ok(())
    }

    pub fn release(&mut self, key: &IdempotencyKey, request_hash: &str) {
        let releasable = self
            .records
            .get(key)
            .is_some_and(|r| r.request_hash == request_hash && r.response.is_none());
        if releasable {
            self.records.remove(key);
        }
    }

    pub fn lookup(&self, key: &IdempotencyKey) -> Option<IdempotencyRecord> {
        self.records.get(key).cloned()
    }

    pub fn purge_expired(&mut self, retention: Duration, now: DateTime<Utc>) -> u64 {
        let Some(cutoff) = chrono::Duration::from_std(effective_retention(retention))
            .ok()
            .and_then(|r| now.checked_sub_signed(r))
        else {
            return 0;
        };
        let before = self.records.len();
        self.records.retain(|_, r| r.created_at >= cutoff);
        (before - self.records.len()) as u64
    }

    /// Resolve a command against existing records: `Some` when it must not run.
    pub fn precheck(&self, key: &IdempotencyKey, request_hash: &str) -> Result<Option<StoredResponse>, EventStoreError> {
        self.records
            .get(key)
            .map(|record| record.resolve(request_hash))
            .transpose()
    }

    #[cfg(test)]
    pub fn backdate(&mut self, key: &IdempotencyKey, created_at: DateTime<Utc>) {
        if let Some(r) = self.records.get_mut(key) {
            r.created_at = created_at;
        }
    }
}

/// In-memory [`IdempotencyStore`]. Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    table: Mutex<IdempotencyTable>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut IdempotencyTable) -> T) -> Result<T, EventStoreError> {
        let mut table = self.table.lock().map_err(|_| EventStoreError::lock_poisoned())?;
        Ok(f(&mut table))
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check_and_reserve(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
    ) -> Result<IdempotencyCheck, EventStoreError> {
        self.with_table(|t| t.check_and_reserve(key, request_hash))
    }

    async fn record(
        &self,
        key: &IdempotencyKey,
        request_hash: &str,
        response: StoredResponse,
    ) -> Result<(), EventStoreError> {
        self.with_table(|t| t.record(key, request_hash, response))?
    }

    async fn release(&self, key: &IdempotencyKey, request_hash: &str) -> Result<(), EventStoreError> {
        self.with_table(|t| t.release(key, request_hash))
    }

    async fn lookup(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>, EventStoreError> {
        self.with_table(|t| t.lookup(key))
    }

    async fn purge_expired(&self, retention: Duration) -> Result<u64, EventStoreError> {
        self.with_table(|t| t.purge_expired(retention, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn key(k: &str) -> IdempotencyKey {
        IdempotencyKey::new(None, "user_1", "orgs.create", k).unwrap()
    }

    #[test]
    fn orgless_requests_use_the_global_scope() {
        assert_eq!(key("k").org_scope, GLOBAL_SCOPE);
        let org = OrgId::new();
        let scoped = IdempotencyKey::new(Some(org), "user_1", "apps.create", "k").unwrap();
        assert_eq!(scoped.org_scope, org.to_string());
        assert!(IdempotencyKey::new(None, "", "apps.create", "k").is_err());
    }

    #[test]
    fn request_hash_ignores_key_order() {
        let a = request_hash("orgs.create", &json!({"name": "acme", "meta": {"b": 1, "a": [2, {"y": 1, "x": 0}]}}))
            .unwrap();
        let b = request_hash("orgs.create", &json!({"meta": {"a": [2, {"x": 0, "y": 1}], "b": 1}, "name": "acme"}))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let other_endpoint = request_hash("orgs.update", &json!({"name": "acme", "meta": {"b": 1, "a": [2, {"y": 1, "x": 0}]}}))
            .unwrap();
        assert_ne!(a, other_endpoint);
        let other_body = request_hash("orgs.create", &json!({"name": "acme2"})).unwrap();
        assert_ne!(a, other_body);
    }

    #[test]
    fn canonical_form_is_compact_and_sorted() {
        let out = canonical_json(&json!({"b": "x\"y", "a": [true, null, 1.5]})).unwrap();
        assert_eq!(out, r#"{"a":[true,null,1.5],"b":"x\"y"}"#);
    }

    #[test]
    fn request_hash_normalizes_numbers() {
        // A client re-encoding `1` as `1.0` is still the same request.
        let int = request_hash("apps.scale", &json!({"replicas": 1, "ratio": 0.5})).unwrap();
        let float = request_hash("apps.scale", &json!({"ratio": 0.50, "replicas": 1.0})).unwrap();
        assert_eq!(int, float);
        assert_eq!(canonical_json(&json!({"n": 1.0})).unwrap(), r#"{"n":1}"#);

        let different = request_hash("apps.scale", &json!({"replicas": 2, "ratio": 0.5})).unwrap();
        assert_ne!(int, different);
    }

    #[test]
    fn reserve_then_record_then_replay() {
        let mut table = IdempotencyTable::default();
        let k = key("k1");
        assert_eq!(table.check_and_reserve(&k, "h1"), IdempotencyCheck::Fresh);
        assert_eq!(table.check_and_reserve(&k, "h1"), IdempotencyCheck::InFlight);
        assert_eq!(table.check_and_reserve(&k, "h2"), IdempotencyCheck::Conflict);

        let response = StoredResponse::new(201, Some(json!({"org_id": "o1"})));
        table.record(&k, "h1", response.clone()).unwrap();
        assert_eq!(table.check_and_reserve(&k, "h1"), IdempotencyCheck::Replay(response.clone()));

        // First response wins.
        table.record(&k, "h1", StoredResponse::new(500, None)).unwrap();
        assert_eq!(table.lookup(&k).unwrap().response, Some(response));
        assert!(matches!(
            table.record(&k, "h2", StoredResponse::new(200, None)),
            Err(EventStoreError::IdempotencyKeyReuse { .. })
        ));
    }

    #[test]
    fn release_only_drops_unrecorded_reservations() {
        let mut table = IdempotencyTable::default();
        let k = key("k1");
        table.check_and_reserve(&k, "h1");
        table.release(&k, "h2");
        assert!(table.lookup(&k).is_some());
        table.release(&k, "h1");
        assert!(table.lookup(&k).is_none());

        table.record(&k, "h1", StoredResponse::new(200, None)).unwrap();
        table.release(&k, "h1");
        assert!(table.lookup(&k).is_some());
    }

    #[test]
    fn purge_never_goes_below_a_day() {
        let mut table = IdempotencyTable::default();
        let now = Utc::now();
        let recent = key("recent");
        let old = key("old");
        table.record(&recent, "h", StoredResponse::new(200, None)).unwrap();
        table.record(&old, "h", StoredResponse::new(200, None)).unwrap();
        table.backdate(&recent, now - chrono::Duration::hours(2));
        table.backdate(&old, now - chrono::Duration::hours(30));

        // One minute requested, clamped to 24h: only the 30h-old record goes.
        assert_eq!(table.purge_expired(Duration::from_secs(60), now), 1);
        assert!(table.lookup(&recent).is_some());
        assert!(table.lookup(&old).is_none());
    }

    #[tokio::test]
    async fn in_memory_store_implements_the_guard() {
        let store = InMemoryIdempotencyStore::new();
        let k = key("k1");
        assert_eq!(store.check_and_reserve(&k, "h").await.unwrap(), IdempotencyCheck::Fresh);
        store.record(&k, "h", StoredResponse::new(202, None)).await.unwrap();
        assert_eq!(
            store.check_and_reserve(&k, "h").await.unwrap(),
            IdempotencyCheck::Replay(StoredResponse::new(202, None))
        );
        assert_eq!(store.purge_expired(Duration::ZERO).await.unwrap(), 0);
    }
}
