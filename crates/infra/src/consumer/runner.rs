use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, instrument, warn};

use eventlog_core::EventId;

use super::handler::ConsumerHandler;
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::event_store::{EventStore, EventStoreError, ReadScope};
use crate::retry::RetryPolicy;

/// Where a consumer is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Idle,
    Fetching,
    Applying,
    Checkpointing,
    Rebuilding,
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The handler failed on an event. Nothing past the last checkpoint is
    /// acknowledged; the event is delivered again on the next cycle.
    #[error("consumer '{consumer}' failed to apply event {event_id}: {reason}")]
    Apply {
        consumer: String,
        event_id: EventId,
        reason: String,
    },

    #[error("consumer '{consumer}' failed to flush: {reason}")]
    Flush { consumer: String, reason: String },

    #[error("consumer '{consumer}' failed to clear derived state: {reason}")]
    Clear { consumer: String, reason: String },

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl ConsumerError {
    /// Whether the polling loop should back off and try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConsumerError::Apply { .. } | ConsumerError::Flush { .. } => true,
            ConsumerError::Store(err) => err.is_retryable(),
            ConsumerError::Checkpoint(err) => err.is_retryable(),
            ConsumerError::Clear { .. } => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    /// Sleep between polls once caught up.
    pub poll_interval: Duration,
    /// Backoff after retryable failures. `max_attempts` is ignored: the loop
    /// keeps retrying until shutdown.
    pub backoff: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(100),
            backoff: RetryPolicy::exponential(u32::MAX, Duration::from_millis(100), Duration::from_secs(30)),
        }
    }
}

/// Result of one fetch/apply/checkpoint cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Events handed to the handler (redeliveries included).
    pub applied: usize,
    /// Checkpoint after the cycle.
    pub checkpoint: EventId,
    /// No more events past the checkpoint at the time of the read.
    pub caught_up: bool,
}

/// Drives one consumer over the log: read past the checkpoint, apply, flush,
/// checkpoint.
///
/// Cycles and rebuilds of one runner never overlap: a rebuild waits for the
/// cycle in flight to checkpoint, and cycles wait for the rebuild. Run exactly
/// one runner per consumer name.
pub struct ConsumerRunner<S, C, H>
where
    S: EventStore + ?Sized,
    C: CheckpointStore + ?Sized,
    H: ConsumerHandler + ?Sized,
{
    store: Arc<S>,
    checkpoints: Arc<C>,
    handler: Arc<H>,
    scope: ReadScope,
    config: ConsumerConfig,
    state: watch::Sender<ConsumerState>,
    exclusive: Mutex<()>,
}

impl<S, C, H> ConsumerRunner<S, C, H>
where
    S: EventStore + ?Sized,
    C: CheckpointStore + ?Sized,
    H: ConsumerHandler + ?Sized,
{
    pub fn new(store: Arc<S>, checkpoints: Arc<C>, handler: Arc<H>) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            store,
            checkpoints,
            handler,
            scope: ReadScope::Internal,
            config: ConsumerConfig::default(),
            state,
            exclusive: Mutex::new(()),
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Read scope used for fetching. Defaults to [`ReadScope::Internal`].
    pub fn with_scope(mut self, scope: ReadScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn name(&self) -> &str {
        self.handler.name()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub async fn checkpoint(&self) -> Result<EventId, ConsumerError> {
        Ok(self.checkpoints.get(self.handler.name()).await?)
    }

    pub async fn head(&self) -> Result<EventId, ConsumerError> {
        Ok(self.store.head().await?)
    }

    /// One cycle. Always ends in [`ConsumerState::Idle`], also on error.
    #[instrument(skip_all, fields(consumer = %self.handler.name()))]
    pub async fn run_once(&self) -> Result<BatchOutcome, ConsumerError> {
        let _exclusive = self.exclusive.lock().await;
        let result = self.cycle().await;
        self.state.send_replace(ConsumerState::Idle);
        result
    }

    async fn cycle(&self) -> Result<BatchOutcome, ConsumerError> {
        let name = self.handler.name();

        self.state.send_replace(ConsumerState::Fetching);
        let cursor = self.checkpoints.get(name).await?;
        let page = self
            .store
            .read(cursor, Some(self.config.batch_size), &self.handler.filter(), &self.scope)
            .await?;

        self.state.send_replace(ConsumerState::Applying);
        for event in &page.events {
            self.handler
                .apply(event)
                .await
                .map_err(|e| ConsumerError::Apply {
                    consumer: name.to_string(),
                    event_id: event.event_id,
                    reason: e.to_string(),
                })?;
        }

        // Filtered-out events still move the checkpoint forward.
        let next = page.next_after_event_id;
        if next > cursor {
            self.state.send_replace(ConsumerState::Checkpointing);
            if !page.events.is_empty() {
                self.handler.flush().await.map_err(|e| ConsumerError::Flush {
                    consumer: name.to_string(),
                    reason: e.to_string(),
                })?;
            }
            self.checkpoints.set(name, next).await?;
        }

        debug!(
            fetched = page.events.len(),
            from = %cursor,
            checkpoint = %next.max(cursor),
            "consumer cycle complete"
        );

        Ok(BatchOutcome {
            applied: page.events.len(),
            checkpoint: next.max(cursor),
            caught_up: !page.has_more,
        })
    }

    /// Run cycles until the consumer has caught up with the head observed by
    /// its last read. Returns the number of events applied.
    pub async fn catch_up(&self) -> Result<u64, ConsumerError> {
        let mut applied = 0u64;
        loop {
            let outcome = self.run_once().await?;
            applied += outcome.applied as u64;
            if outcome.caught_up {
                return Ok(applied);
            }
        }
    }

    /// Operator-triggered rebuild: rewind the checkpoint to 0, then have the
    /// handler drop its derived state. Catch-up afterwards is a normal run.
    ///
    /// The checkpoint goes first. If the process dies in between, the handler
    /// sees its old events again, which at-least-once delivery already allows.
    #[instrument(skip_all, fields(consumer = %self.handler.name()))]
    pub async fn rebuild(&self) -> Result<(), ConsumerError> {
        let _exclusive = self.exclusive.lock().await;
        self.state.send_replace(ConsumerState::Rebuilding);
        let result = self.reset_and_clear().await;
        self.state.send_replace(ConsumerState::Idle);
        if result.is_ok() {
            info!("consumer reset for rebuild");
        }
        result
    }

    async fn reset_and_clear(&self) -> Result<(), ConsumerError> {
        let name = self.handler.name();
        self.checkpoints.reset(name).await?;
        self.handler.clear().await.map_err(|e| ConsumerError::Clear {
            consumer: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Poll until `shutdown` turns `true` (or its sender is dropped).
    ///
    /// Shutdown is only observed between cycles; an in-flight batch finishes
    /// and checkpoints first. Retryable failures back off exponentially,
    /// anything else stops the loop with the error.
    #[instrument(skip_all, fields(consumer = %self.handler.name()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        info!("consumer started");
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_once().await {
                Ok(outcome) => {
                    failures = 0;
                    if outcome.caught_up {
                        self.config.poll_interval
                    } else {
                        Duration::ZERO
                    }
                }
                Err(err) if err.is_retryable() => {
                    failures = failures.saturating_add(1);
                    let delay = self.config.backoff.delay_for_attempt(failures);
                    warn!(
                        error = %err,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "consumer cycle failed, backing off"
                    );
                    delay
                }
                Err(err) => {
                    error!(error = %err, "consumer stopped");
                    return Err(err);
                }
            };

            if delay.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("consumer stopped");
        Ok(())
    }
}
