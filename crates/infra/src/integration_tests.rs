//! Integration tests for the full event log pipeline.
//!
//! Tests: Command → Idempotency → EventStore → Consumer → Projection
//!
//! Verifies:
//! - Per-aggregate sequences are gapless under racing writers
//! - Global order is observed identically by every reader
//! - Retried commands commit once and answer identically
//! - Consumers survive crashes between apply and checkpoint
//! - Rebuilding from 0 reproduces incremental state

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;
    use serde_json::{Value as JsonValue, json};

    use eventlog_core::{AggregateRef, AggregateType, DomainError, EventId, ExpectedSeq, OrgId};
    use eventlog_events::{HandlerRegistry, ProjectionRunner, RegistryProjection};

    use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
    use crate::command_dispatcher::{CommandContext, CommandDispatcher, DispatchError};
    use crate::consumer::{ConsumerConfig, ConsumerHandler, ConsumerRunner, HandlerError, ProjectionConsumer};
    use crate::event_store::{
        EventMetadata, EventStore, EventStoreError, InMemoryEventStore, NewEvent, ReadFilter, ReadScope, StoredEvent,
    };
    use crate::idempotency::{IdempotencyKey, StoredResponse, request_hash};

    fn aggregate(kind: &str, id: &str) -> AggregateRef {
        AggregateRef::new(AggregateType::new(kind).unwrap(), id).unwrap()
    }

    fn event(event_type: &str, payload: JsonValue) -> NewEvent {
        NewEvent::raw(event_type, 1, payload, EventMetadata::system("test", None))
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
    }

    async fn all_events(store: &InMemoryEventStore) -> Vec<StoredEvent> {
        let mut after = EventId::ZERO;
        let mut events = Vec::new();
        loop {
            let page = store
                .read(after, Some(7), &ReadFilter::all(), &ReadScope::Elevated)
                .await
                .unwrap();
            events.extend(page.events);
            after = page.next_after_event_id;
            if !page.has_more {
                return events;
            }
        }
    }

    #[tokio::test]
    async fn org_created_twice_at_the_same_seq_conflicts() {
        let store = InMemoryEventStore::new();
        let o1 = aggregate("org", "o1");

        let committed = store
            .append(&o1, ExpectedSeq::NEW, vec![event("org.created", json!({ "name": "acme" }))])
            .await
            .unwrap();
        assert_eq!(committed[0].aggregate_seq, 1);
        assert!(!committed[0].event_id.is_zero());

        let err = store
            .append(&o1, ExpectedSeq::NEW, vec![event("org.created", json!({ "name": "acme" }))])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EventStoreError::AggregateConflict { expected: 0, actual: Some(1), .. }
        ));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn create_org_command_is_idempotent() {
        let store = Arc::new(InMemoryEventStore::new());
        let dispatcher = CommandDispatcher::new(store.clone());
        let actor_org = OrgId::new();

        let submit = |body: JsonValue| {
            let dispatcher = &dispatcher;
            async move {
                let ctx = CommandContext {
                    key: IdempotencyKey::new(Some(actor_org), "user-1", "create_org", "k1").unwrap(),
                    request_hash: request_hash("create_org", &body).unwrap(),
                    aggregate: aggregate("org", "o1"),
                };
                let name = body["name"].clone();
                dispatcher
                    .dispatch(
                        ctx,
                        move |history: &[StoredEvent]| {
                            if !history.is_empty() {
                                return Err(DomainError::Conflict("org exists".into()));
                            }
                            Ok(vec![event("org.created", json!({ "name": name.clone() }))])
                        },
                        |committed: &[StoredEvent]| {
                            StoredResponse::new(201, Some(json!({ "org_id": committed[0].aggregate.aggregate_id })))
                        },
                    )
                    .await
            }
        };

        let first = submit(json!({ "name": "acme" })).await.unwrap();
        assert_eq!(first.response().body, Some(json!({ "org_id": "o1" })));

        for _ in 0..3 {
            let again = submit(json!({ "name": "acme" })).await.unwrap();
            assert!(again.is_replay());
            assert_eq!(again.response(), first.response());
        }
        assert_eq!(store.len().unwrap(), 1);

        for _ in 0..2 {
            let err = submit(json!({ "name": "other" })).await.unwrap_err();
            assert!(matches!(
                err,
                DispatchError::Store(EventStoreError::IdempotencyKeyReuse { .. })
            ));
        }
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(all_events(&store).await[0].metadata.idempotency_key.as_deref(), Some("k1"));
    }

    /// Durable billing totals keyed by account. Applying an event twice is a
    /// no-op because applied ids are stored with the totals.
    #[derive(Debug, Default)]
    struct BillingState {
        totals: BTreeMap<String, i64>,
        applied: BTreeSet<EventId>,
        deliveries: Vec<u64>,
    }

    struct BillingProjection {
        state: Arc<Mutex<BillingState>>,
        crash_after: Option<EventId>,
    }

    #[async_trait::async_trait]
    impl ConsumerHandler for BillingProjection {
        fn name(&self) -> &str {
            "billing-projection"
        }

        async fn apply(&self, event: &StoredEvent) -> Result<(), HandlerError> {
            {
                let mut state = self.state.lock().unwrap();
                state.deliveries.push(event.event_id.value());
                if state.applied.insert(event.event_id) {
                    let amount = event.payload["amount"].as_i64().unwrap_or(0);
                    *state.totals.entry(event.aggregate.aggregate_id.clone()).or_default() += amount;
                }
            }
            if self.crash_after == Some(event.event_id) {
                return Err("process killed".into());
            }
            Ok(())
        }

        async fn clear(&self) -> Result<(), HandlerError> {
            *self.state.lock().unwrap() = BillingState::default();
            Ok(())
        }
    }

    #[tokio::test]
    async fn consumer_crash_before_checkpoint_redelivers_the_batch() {
        let store = Arc::new(InMemoryEventStore::new());
        for i in 1..=50 {
            let account = aggregate("account", &format!("acct-{}", i % 3));
            let seq = store.latest_seq(&account).await.unwrap();
            store
                .append(&account, ExpectedSeq::exact(seq), vec![event("usage.recorded", json!({ "amount": i }))])
                .await
                .unwrap();
        }

        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let state = Arc::new(Mutex::new(BillingState::default()));
        let config = ConsumerConfig {
            batch_size: 8,
            ..Default::default()
        };

        // Events up to 42 were processed by an earlier run.
        let warmup = ConsumerRunner::new(
            store.clone(),
            checkpoints.clone(),
            Arc::new(BillingProjection {
                state: state.clone(),
                crash_after: None,
            }),
        )
        .with_config(ConsumerConfig {
            batch_size: 42,
            ..Default::default()
        });
        warmup.run_once().await.unwrap();
        assert_eq!(checkpoints.get("billing-projection").await.unwrap(), EventId::new(42));
        state.lock().unwrap().deliveries.clear();

        let crashing = ConsumerRunner::new(
            store.clone(),
            checkpoints.clone(),
            Arc::new(BillingProjection {
                state: state.clone(),
                crash_after: Some(EventId::new(47)),
            }),
        )
        .with_config(config.clone());
        assert!(crashing.run_once().await.is_err());
        assert_eq!(checkpoints.get("billing-projection").await.unwrap(), EventId::new(42));

        let restarted = ConsumerRunner::new(
            store.clone(),
            checkpoints.clone(),
            Arc::new(BillingProjection {
                state: state.clone(),
                crash_after: None,
            }),
        )
        .with_config(config);
        let outcome = restarted.run_once().await.unwrap();
        assert_eq!(outcome.checkpoint, EventId::new(50));
        assert_eq!(checkpoints.get("billing-projection").await.unwrap(), EventId::new(50));

        let state = state.lock().unwrap();
        let expected: Vec<u64> = (43..=47).chain(43..=50).collect();
        assert_eq!(state.deliveries, expected);
        let total: i64 = state.totals.values().sum();
        assert_eq!(total, (1..=50).sum::<i64>());
    }

    #[tokio::test]
    async fn racing_writers_one_conflicts_then_retries_at_the_next_seq() {
        let store = Arc::new(InMemoryEventStore::new());
        let app = aggregate("app", "a1");
        for seq in 0..4 {
            store
                .append(&app, ExpectedSeq::exact(seq), vec![event("app.updated", json!({ "seq": seq + 1 }))])
                .await
                .unwrap();
        }

        let race = |writer: &'static str| {
            let store = store.clone();
            let app = app.clone();
            tokio::spawn(async move {
                store
                    .append(&app, ExpectedSeq::exact(4), vec![event("app.updated", json!({ "writer": writer }))])
                    .await
            })
        };
        let (a, b) = tokio::join!(race("a"), race("b"));
        let results = [a.unwrap(), b.unwrap()];

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0][0].aggregate_seq, 5);
        let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(loser.is_conflict());

        let retried = store
            .append(&app, ExpectedSeq::exact(5), vec![event("app.updated", json!({ "writer": "retry" }))])
            .await
            .unwrap();
        assert_eq!(retried[0].aggregate_seq, 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_with_the_same_expectation_admit_exactly_one() {
        for round in 0..20 {
            let store = Arc::new(InMemoryEventStore::new());
            let org = aggregate("org", &format!("o{round}"));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let store = store.clone();
                    let org = org.clone();
                    tokio::spawn(async move {
                        store
                            .append(&org, ExpectedSeq::NEW, vec![event("org.created", json!({}))])
                            .await
                    })
                })
                .collect();

            let mut ok = 0;
            let mut conflicts = 0;
            for handle in handles {
                match handle.await.unwrap() {
                    Ok(_) => ok += 1,
                    Err(err) if err.is_conflict() => conflicts += 1,
                    Err(err) => panic!("unexpected error: {err}"),
                }
            }
            assert_eq!((ok, conflicts), (1, 1));
        }
    }

    #[derive(Debug, Clone)]
    struct AppendOp {
        aggregate: usize,
        stale_by: u64,
        batch: usize,
    }

    fn append_op() -> impl Strategy<Value = AppendOp> {
        (0usize..4, 0u64..3, 1usize..4).prop_map(|(aggregate, stale_by, batch)| AppendOp {
            aggregate,
            stale_by,
            batch,
        })
    }

    proptest! {
        #[test]
        fn sequences_stay_gapless_and_global_order_is_total(ops in prop::collection::vec(append_op(), 1..60)) {
            runtime().block_on(async {
                let store = InMemoryEventStore::new();
                let refs: Vec<_> = (0..4).map(|i| aggregate("app", &format!("a{i}"))).collect();
                let mut committed = 0usize;

                for op in &ops {
                    let target = &refs[op.aggregate];
                    let latest = store.latest_seq(target).await.unwrap();
                    let expected = latest.saturating_sub(op.stale_by);
                    let batch = (0..op.batch).map(|i| event("app.updated", json!({ "i": i }))).collect();
                    match store.append(target, ExpectedSeq::exact(expected), batch).await {
                        Ok(events) => {
                            prop_assert_eq!(expected, latest);
                            committed += events.len();
                        }
                        Err(err) => {
                            prop_assert!(err.is_conflict());
                            prop_assert!(expected < latest);
                        }
                    }
                }

                for target in &refs {
                    let history = store.load_aggregate(target).await.unwrap();
                    let seqs: Vec<u64> = history.iter().map(|e| e.aggregate_seq).collect();
                    let gapless: Vec<u64> = (1..=history.len() as u64).collect();
                    prop_assert_eq!(seqs, gapless);
                    prop_assert!(history.windows(2).all(|w| w[0].event_id < w[1].event_id));
                }

                let everything = all_events(&store).await;
                prop_assert_eq!(everything.len(), committed);
                let ids: Vec<u64> = everything.iter().map(|e| e.event_id.value()).collect();
                let contiguous: Vec<u64> = (1..=committed as u64).collect();
                prop_assert_eq!(ids, contiguous);
                Ok(())
            })?;
        }
    }

    type Balances = BTreeMap<String, i64>;

    fn balances_projection() -> RegistryProjection<Balances> {
        let mut registry = HandlerRegistry::<Balances>::new();
        registry
            .register_raw("ledger.posted", 1, |mut balances, e| {
                let amount = e.payload()["amount"].as_i64().unwrap_or(0);
                *balances.entry(e.aggregate_id().to_string()).or_default() += amount;
                Ok(balances)
            })
            .unwrap();
        registry
            .register_raw("ledger.closed", 1, |mut balances, e| {
                balances.remove(e.aggregate_id());
                Ok(balances)
            })
            .unwrap();
        RegistryProjection::new(registry, Balances::new())
    }

    /// Fails once right after applying each listed event, like a process
    /// killed before it could checkpoint.
    struct Crashing {
        inner: ProjectionConsumer<RegistryProjection<Balances>>,
        crash_after: Mutex<BTreeSet<EventId>>,
    }

    #[async_trait::async_trait]
    impl ConsumerHandler for Crashing {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn apply(&self, event: &StoredEvent) -> Result<(), HandlerError> {
            self.inner.apply(event).await?;
            if self.crash_after.lock().unwrap().remove(&event.event_id) {
                return Err("crash".into());
            }
            Ok(())
        }

        async fn clear(&self) -> Result<(), HandlerError> {
            self.inner.clear().await
        }
    }

    #[derive(Debug, Clone)]
    struct LedgerOp {
        account: usize,
        amount: i64,
        close: bool,
    }

    fn ledger_op() -> impl Strategy<Value = LedgerOp> {
        (0usize..5, -100i64..100, prop::bool::weighted(0.1)).prop_map(|(account, amount, close)| LedgerOp {
            account,
            amount,
            close,
        })
    }

    proptest! {
        #[test]
        fn rebuild_from_zero_matches_incremental_catch_up_with_crashes(
            ops in prop::collection::vec(ledger_op(), 1..80),
            crash_points in prop::collection::btree_set(1u64..80, 0..10),
            batch_size in 1usize..6,
        ) {
            runtime().block_on(async {
                let store = Arc::new(InMemoryEventStore::new());
                let mut seqs: HashMap<usize, u64> = HashMap::new();
                for op in &ops {
                    let account = aggregate("ledger", &format!("acct-{}", op.account));
                    let seq = seqs.entry(op.account).or_default();
                    let new = if op.close {
                        event("ledger.closed", json!({}))
                    } else {
                        event("ledger.posted", json!({ "amount": op.amount }))
                    };
                    store.append(&account, ExpectedSeq::exact(*seq), vec![new]).await.unwrap();
                    *seq += 1;
                }
                let head = store.head().await.unwrap();

                // Incremental: small batches, crashes, a fresh runner after every crash.
                let checkpoints = Arc::new(InMemoryCheckpointStore::new());
                let handler = Arc::new(Crashing {
                    inner: ProjectionConsumer::new("balances", ProjectionRunner::new(balances_projection())),
                    crash_after: Mutex::new(crash_points.iter().copied().map(EventId::new).collect()),
                });
                let config = ConsumerConfig { batch_size, ..Default::default() };
                let mut cycles = 0;
                while checkpoints.get("balances").await.unwrap() < head {
                    let runner = ConsumerRunner::new(store.clone(), checkpoints.clone(), handler.clone())
                        .with_config(config.clone());
                    let _ = runner.run_once().await;
                    cycles += 1;
                    prop_assert!(cycles < 10_000);
                }
                let incremental = handler.inner.with_projection(|p| p.state().clone()).unwrap();

                // Rebuild: a fresh projection from 0 in one pass.
                let rebuilt_handler = Arc::new(ProjectionConsumer::new(
                    "balances-rebuild",
                    ProjectionRunner::new(balances_projection()),
                ));
                let rebuild = ConsumerRunner::new(store.clone(), checkpoints.clone(), rebuilt_handler.clone())
                    .with_config(ConsumerConfig { batch_size: 1000, ..Default::default() });
                rebuild.rebuild().await.unwrap();
                rebuild.catch_up().await.unwrap();
                let rebuilt = rebuilt_handler.with_projection(|p| p.state().clone()).unwrap();

                prop_assert_eq!(incremental, rebuilt);
                Ok(())
            })?;
        }
    }
}
