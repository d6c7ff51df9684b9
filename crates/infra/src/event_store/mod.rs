//! Append-only event log: the sequencer, the store and the read API.
//!
//! Two backends share one contract ([`EventStore`]): an in-memory store for
//! tests and development, and Postgres for everything else. Validation and
//! read authorization are backend-independent and run before either touches
//! storage.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;
pub(crate) mod validate;

pub use in_memory::InMemoryEventStore;
pub use postgres::{APPEND_LOCK_KEY, PostgresEventStore};
pub use query::{DEFAULT_READ_LIMIT, EventPage, MAX_READ_LIMIT, ReadFilter, ReadPolicy, ReadScope, clamp_limit};
pub use r#trait::{EventMetadata, EventStore, EventStoreError, NewEvent, StoredEvent};
