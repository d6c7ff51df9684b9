//! Infrastructure layer: event log storage, idempotency, consumers, config.
//!
//! Every store has an in-memory implementation for tests/dev and a Postgres
//! implementation behind the same trait.

pub mod checkpoint;
pub mod command_dispatcher;
pub mod config;
pub mod consumer;
pub mod db;
pub mod event_store;
pub mod idempotency;
pub mod replay;
pub mod retry;

mod integration_tests;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, ConsumerLag, InMemoryCheckpointStore, PostgresCheckpointStore};
pub use command_dispatcher::{CommandContext, CommandDispatcher, DispatchError};
pub use config::{ConfigError, DbConfig, EventLogConfig};
pub use consumer::{BatchOutcome, ConsumerConfig, ConsumerError, ConsumerHandler, ConsumerRunner, ConsumerState, ProjectionConsumer};
pub use db::Database;
pub use event_store::{
    EventMetadata, EventPage, EventStore, EventStoreError, InMemoryEventStore, NewEvent, PostgresEventStore, ReadFilter,
    ReadPolicy, ReadScope, StoredEvent,
};
pub use idempotency::{
    CommandLog, CommandOutcome, CommandRequest, IdempotencyCheck, IdempotencyKey, IdempotencyRecord, IdempotencyStore,
    InMemoryIdempotencyStore, PostgresIdempotencyStore, StoredResponse, request_hash,
};
pub use replay::{ReplayError, ReplayHandle, ReplayPhase, ReplayProgress, spawn_rebuild};
pub use retry::{RetryPolicy, retry_on_conflict};
