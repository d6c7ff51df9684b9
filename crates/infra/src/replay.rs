//! Background rebuilds with progress reporting.
//!
//! A rebuild is the consumer's `Rebuilding` entry followed by ordinary
//! catch-up. Live appends keep flowing while it runs. The reset waits for any
//! cycle of the same runner that is in flight, so no stale checkpoint can land
//! after it. The target is the head observed when replay starts; anything
//! appended later is picked up by the consumer's normal loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use eventlog_core::EventId;

use crate::checkpoint::CheckpointStore;
use crate::consumer::{ConsumerError, ConsumerHandler, ConsumerRunner};
use crate::event_store::EventStore;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    #[error("replay cancelled")]
    Cancelled,

    #[error("replay failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPhase {
    /// Checkpoint reset and derived state cleared.
    Resetting,
    Replaying,
    Complete,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayProgress {
    pub consumer: String,
    pub phase: ReplayPhase,
    pub processed_events: u64,
    pub checkpoint: EventId,
    /// Log head when replay started.
    pub target_event_id: EventId,
    pub is_complete: bool,
    pub error: Option<String>,
}

/// Handle for monitoring and cancelling a rebuild.
#[derive(Debug, Clone)]
pub struct ReplayHandle {
    progress: Arc<RwLock<ReplayProgress>>,
    cancellation: Arc<AtomicBool>,
}

impl ReplayHandle {
    pub async fn progress(&self) -> ReplayProgress {
        self.progress.read().await.clone()
    }

    /// Stop after the batch in flight. The checkpoint stays wherever that
    /// batch left it; the consumer resumes from there.
    pub fn cancel(&self) {
        self.cancellation.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.load(Ordering::Relaxed)
    }

    pub async fn wait_for_completion(&self) -> Result<ReplayProgress, ReplayError> {
        loop {
            let progress = self.progress.read().await.clone();
            if progress.is_complete {
                return match progress.phase {
                    ReplayPhase::Cancelled => Err(ReplayError::Cancelled),
                    ReplayPhase::Failed => Err(ReplayError::Failed(progress.error.unwrap_or_default())),
                    _ => Ok(progress),
                };
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Rebuild a consumer from event 0 on a background task.
pub fn spawn_rebuild<S, C, H>(runner: Arc<ConsumerRunner<S, C, H>>) -> ReplayHandle
where
    S: EventStore + ?Sized + 'static,
    C: CheckpointStore + ?Sized + 'static,
    H: ConsumerHandler + ?Sized + 'static,
{
    let progress = Arc::new(RwLock::new(ReplayProgress {
        consumer: runner.name().to_string(),
        phase: ReplayPhase::Resetting,
        processed_events: 0,
        checkpoint: EventId::ZERO,
        target_event_id: EventId::ZERO,
        is_complete: false,
        error: None,
    }));
    let cancellation = Arc::new(AtomicBool::new(false));

    let handle = ReplayHandle {
        progress: progress.clone(),
        cancellation: cancellation.clone(),
    };

    tokio::spawn(async move {
        let result = run_rebuild(&runner, &progress, &cancellation).await;

        let mut prog = progress.write().await;
        prog.is_complete = true;
        match result {
            Ok(()) => {
                prog.phase = ReplayPhase::Complete;
                info!(
                    consumer = %prog.consumer,
                    processed = prog.processed_events,
                    checkpoint = %prog.checkpoint,
                    "rebuild complete"
                );
            }
            Err(ReplayError::Cancelled) => {
                prog.phase = ReplayPhase::Cancelled;
                info!(consumer = %prog.consumer, checkpoint = %prog.checkpoint, "rebuild cancelled");
            }
            Err(err) => {
                warn!(consumer = %prog.consumer, error = %err, "rebuild failed");
                prog.phase = ReplayPhase::Failed;
                prog.error = Some(err.to_string());
            }
        }
    });

    handle
}

async fn run_rebuild<S, C, H>(
    runner: &ConsumerRunner<S, C, H>,
    progress: &RwLock<ReplayProgress>,
    cancellation: &AtomicBool,
) -> Result<(), ReplayError>
where
    S: EventStore + ?Sized,
    C: CheckpointStore + ?Sized,
    H: ConsumerHandler + ?Sized,
{
    runner.rebuild().await?;
    let target = runner.head().await?;
    {
        let mut prog = progress.write().await;
        prog.phase = ReplayPhase::Replaying;
        prog.target_event_id = target;
    }

    loop {
        if cancellation.load(Ordering::Relaxed) {
            return Err(ReplayError::Cancelled);
        }

        let outcome = runner.run_once().await?;
        {
            let mut prog = progress.write().await;
            prog.processed_events += outcome.applied as u64;
            prog.checkpoint = outcome.checkpoint;
        }

        if outcome.checkpoint >= target || outcome.caught_up {
            return Ok(());
        }
    }
}
