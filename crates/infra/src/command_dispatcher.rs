//! Command execution pipeline.
//!
//! ```text
//! Command (idempotency key + request hash)
//!   ↓
//! 1. Look up the key: a completed retry is answered from the stored response
//!   ↓
//! 2. Load the aggregate's history; its last seq is the expectation
//!   ↓
//! 3. Decide (pure): history -> new events, or a domain rejection
//!   ↓
//! 4. Commit: reserve key + append + record response, atomically
//!   ↓
//! 5. On an aggregate conflict, go back to 2 (bounded by the retry policy)
//! ```
//!
//! The dispatcher does no IO of its own; it composes a [`CommandLog`].

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use eventlog_core::{AggregateRef, DomainError, ExpectedSeq};

use crate::event_store::{EventStoreError, NewEvent, StoredEvent};
use crate::idempotency::{CommandLog, CommandOutcome, CommandRequest, IdempotencyKey, StoredResponse};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The decision function refused the command. Nothing was written.
    #[error("command rejected: {0}")]
    Rejected(DomainError),

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

impl DispatchError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, DispatchError::Store(err) if err.is_conflict())
    }
}

/// Everything that identifies one command execution.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub key: IdempotencyKey,
    pub request_hash: String,
    pub aggregate: AggregateRef,
}

/// Runs decide-then-append against one aggregate with idempotency.
#[derive(Debug)]
pub struct CommandDispatcher<S: ?Sized> {
    store: Arc<S>,
    retry: RetryPolicy,
}

impl<S> CommandDispatcher<S>
where
    S: CommandLog + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Dispatch one command.
    ///
    /// `decide` gets the aggregate's full history (ascending seq) and returns
    /// the events to append. It may run more than once when writers race, so
    /// it must be pure. An empty decision appends nothing and is answered
    /// without recording the key. `respond` builds the response stored under
    /// the idempotency key and is called with the committed events.
    #[instrument(
        skip_all,
        fields(aggregate = %ctx.aggregate, endpoint = %ctx.key.endpoint_name),
        err
    )]
    pub async fn dispatch<D, R>(
        &self,
        ctx: CommandContext,
        mut decide: D,
        respond: R,
    ) -> Result<CommandOutcome, DispatchError>
    where
        D: FnMut(&[StoredEvent]) -> Result<Vec<NewEvent>, DomainError> + Send,
        R: Fn(&[StoredEvent]) -> StoredResponse + Clone + Send + 'static,
    {
        if let Some(record) = self.store.find_command(&ctx.key).await? {
            let response = record.resolve(&ctx.request_hash)?;
            debug!("replaying stored response");
            return Ok(CommandOutcome::Replayed(response));
        }

        let mut attempt = 1;
        loop {
            let history = self.store.load_aggregate(&ctx.aggregate).await?;
            let expected = ExpectedSeq::exact(history.last().map_or(0, |e| e.aggregate_seq));
            let events = decide(&history).map_err(DispatchError::Rejected)?;
            if events.is_empty() {
                return Ok(CommandOutcome::Committed {
                    events: Vec::new(),
                    response: respond(&[]),
                });
            }

            let request = CommandRequest::new(
                ctx.key.clone(),
                ctx.request_hash.clone(),
                ctx.aggregate.clone(),
                expected,
                events,
                respond.clone(),
            );
            match self.store.commit_command(request).await {
                Err(err) if err.is_conflict() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(attempt, expected_seq = expected.value(), error = %err, "re-deciding after conflict");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return Ok(other?),
            }
        }
    }
}
