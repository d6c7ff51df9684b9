//! Consumers: checkpointed, at-least-once processing of the global order.
//!
//! A consumer cycles `Idle -> Fetching -> Applying -> Checkpointing -> Idle`.
//! The checkpoint is written only after the handler has flushed, so a crash
//! anywhere before that redelivers the batch. `Rebuilding` is entered by an
//! operator and resets the checkpoint to 0 before clearing derived state.
//!
//! Consumers are independent of each other and of writers: each one has its
//! own checkpoint, reads through the same snapshot-consistent read API as any
//! other client, and holds no store resources while its handler runs.

pub mod handler;
pub mod runner;

pub use handler::{ConsumerHandler, HandlerError, ProjectionConsumer};
pub use runner::{BatchOutcome, ConsumerConfig, ConsumerError, ConsumerRunner, ConsumerState};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::{Notify, Semaphore, watch};

    use eventlog_core::{AggregateRef, AggregateType, EventId, ExpectedSeq, OrgId};

    use super::*;
    use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
    use crate::event_store::{EventMetadata, EventStore, InMemoryEventStore, NewEvent, ReadFilter, StoredEvent};

    /// Records every delivery; fails once on a chosen event id.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<EventId>>,
        fail_on: Mutex<Option<EventId>>,
        flushed: AtomicBool,
        filter: ReadFilter,
    }

    #[async_trait::async_trait]
    impl ConsumerHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn filter(&self) -> ReadFilter {
            self.filter.clone()
        }

        async fn apply(&self, event: &StoredEvent) -> Result<(), HandlerError> {
            let mut fail_on = self.fail_on.lock().unwrap();
            if *fail_on == Some(event.event_id) {
                *fail_on = None;
                return Err("boom".into());
            }
            self.seen.lock().unwrap().push(event.event_id);
            Ok(())
        }

        async fn flush(&self) -> Result<(), HandlerError> {
            self.flushed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn clear(&self) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().clear();
            Ok(())
        }
    }

    fn org_ref(id: &str) -> AggregateRef {
        AggregateRef::new(AggregateType::new("org").unwrap(), id).unwrap()
    }

    async fn seed(store: &InMemoryEventStore, org: Option<OrgId>, aggregates: usize) {
        for i in 0..aggregates {
            let event = NewEvent::raw("org.created", 1, json!({ "n": i }), EventMetadata::system("test", org));
            store
                .append(&org_ref(&format!("o{i}")), ExpectedSeq::NEW, vec![event])
                .await
                .unwrap();
        }
    }

    fn small_batches() -> ConsumerConfig {
        ConsumerConfig {
            batch_size: 3,
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn catch_up_applies_everything_and_checkpoints() {
        let store = Arc::new(InMemoryEventStore::new());
        seed(&store, None, 7).await;
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let handler = Arc::new(Recorder::default());
        let runner = ConsumerRunner::new(store.clone(), checkpoints.clone(), handler.clone()).with_config(small_batches());

        assert_eq!(runner.catch_up().await.unwrap(), 7);
        assert_eq!(checkpoints.get("recorder").await.unwrap(), EventId::new(7));
        assert_eq!(handler.seen.lock().unwrap().len(), 7);
        assert!(handler.flushed.load(Ordering::SeqCst));
        assert_eq!(runner.state(), ConsumerState::Idle);

        let outcome = runner.run_once().await.unwrap();
        assert_eq!(outcome.applied, 0);
        assert!(outcome.caught_up);
    }

    #[tokio::test]
    async fn failed_apply_does_not_checkpoint_and_redelivers() {
        let store = Arc::new(InMemoryEventStore::new());
        seed(&store, None, 3).await;
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let handler = Arc::new(Recorder::default());
        *handler.fail_on.lock().unwrap() = Some(EventId::new(2));
        let runner = ConsumerRunner::new(store, checkpoints.clone(), handler.clone());

        let err = runner.run_once().await.unwrap_err();
        assert!(matches!(err, ConsumerError::Apply { event_id, .. } if event_id == EventId::new(2)));
        assert!(err.is_retryable());
        assert_eq!(checkpoints.get("recorder").await.unwrap(), EventId::ZERO);
        assert_eq!(runner.state(), ConsumerState::Idle);

        runner.run_once().await.unwrap();
        assert_eq!(checkpoints.get("recorder").await.unwrap(), EventId::new(3));
        // Event 1 was delivered twice.
        assert_eq!(
            *handler.seen.lock().unwrap(),
            vec![EventId::new(1), EventId::new(1), EventId::new(2), EventId::new(3)]
        );
    }

    #[tokio::test]
    async fn filtered_consumer_still_advances_past_other_events() {
        let store = Arc::new(InMemoryEventStore::new());
        let mine = OrgId::new();
        seed(&store, Some(mine), 2).await;
        let other = NewEvent::raw("org.created", 1, json!({}), EventMetadata::system("test", Some(OrgId::new())));
        store.append(&org_ref("x"), ExpectedSeq::NEW, vec![other]).await.unwrap();

        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let handler = Arc::new(Recorder {
            filter: ReadFilter::all().org(mine),
            ..Default::default()
        });
        let runner = ConsumerRunner::new(store, checkpoints.clone(), handler.clone());
        runner.catch_up().await.unwrap();

        assert_eq!(handler.seen.lock().unwrap().len(), 2);
        assert_eq!(checkpoints.get("recorder").await.unwrap(), EventId::new(3));
    }

    #[tokio::test]
    async fn rebuild_resets_checkpoint_and_clears_state() {
        let store = Arc::new(InMemoryEventStore::new());
        seed(&store, None, 4).await;
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let handler = Arc::new(Recorder::default());
        let runner = ConsumerRunner::new(store, checkpoints.clone(), handler.clone());
        runner.catch_up().await.unwrap();

        runner.rebuild().await.unwrap();
        assert_eq!(checkpoints.get("recorder").await.unwrap(), EventId::ZERO);
        assert!(handler.seen.lock().unwrap().is_empty());

        runner.catch_up().await.unwrap();
        assert_eq!(handler.seen.lock().unwrap().len(), 4);
        assert_eq!(checkpoints.get("recorder").await.unwrap(), EventId::new(4));
    }

    #[tokio::test]
    async fn run_picks_up_live_appends_and_stops_on_shutdown() {
        let store = Arc::new(InMemoryEventStore::new());
        seed(&store, None, 2).await;
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let handler = Arc::new(Recorder::default());
        let runner = Arc::new(
            ConsumerRunner::new(store.clone(), checkpoints.clone(), handler.clone()).with_config(small_batches()),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run(shutdown_rx).await })
        };

        let late = NewEvent::raw("org.created", 1, json!({}), EventMetadata::system("test", None));
        store.append(&org_ref("late"), ExpectedSeq::NEW, vec![late]).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while checkpoints.get("recorder").await.unwrap() < EventId::new(3) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(handler.seen.lock().unwrap().len(), 3);
    }

    /// Parks the first delivery of `hold` until released.
    struct Gated {
        seen: Mutex<Vec<EventId>>,
        hold: EventId,
        armed: AtomicBool,
        entered: Notify,
        release: Semaphore,
    }

    #[async_trait::async_trait]
    impl ConsumerHandler for Gated {
        fn name(&self) -> &str {
            "gated"
        }

        async fn apply(&self, event: &StoredEvent) -> Result<(), HandlerError> {
            if event.event_id == self.hold && self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.acquire().await?.forget();
            }
            self.seen.lock().unwrap().push(event.event_id);
            Ok(())
        }

        async fn clear(&self) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().clear();
            Ok(())
        }
    }

    #[tokio::test]
    async fn rebuild_waits_for_the_cycle_in_flight() {
        let store = Arc::new(InMemoryEventStore::new());
        seed(&store, None, 6).await;
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        checkpoints.set("gated", EventId::new(4)).await.unwrap();
        let handler = Arc::new(Gated {
            seen: Mutex::new(Vec::new()),
            hold: EventId::new(5),
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            release: Semaphore::new(0),
        });
        let runner = Arc::new(ConsumerRunner::new(store, checkpoints.clone(), handler.clone()));

        let live = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run_once().await })
        };
        handler.entered.notified().await;

        let rebuild = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.rebuild().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!rebuild.is_finished());
        assert_eq!(checkpoints.get("gated").await.unwrap(), EventId::new(4));

        handler.release.add_permits(1);
        assert_eq!(live.await.unwrap().unwrap().checkpoint, EventId::new(6));
        rebuild.await.unwrap().unwrap();

        // The live checkpoint landed before the reset, not after it.
        assert_eq!(checkpoints.get("gated").await.unwrap(), EventId::ZERO);
        assert!(handler.seen.lock().unwrap().is_empty());

        runner.catch_up().await.unwrap();
        assert_eq!(*handler.seen.lock().unwrap(), (1..=6).map(EventId::new).collect::<Vec<_>>());
        assert_eq!(checkpoints.get("gated").await.unwrap(), EventId::new(6));
    }
}
