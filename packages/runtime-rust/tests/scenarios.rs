//! End-to-end scenarios over a running bus.
//!
//! Every test runs with paused tokio time: lock polling and retry delays
//! advance virtually, lease expiry follows the wall clock (or a manual clock
//! where expiry is asserted).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use simplebus_core::{
    AnyMessage, CorrelationKey, CorrelationValue, Handle, Handler, ManualClock, Message,
    MessagePreview, Outbox, Saga, SagaData, StartedBy, StateMapper,
};
use simplebus_runtime::samples::{import_evaluator, publish_agent, train_models, WorkDelay};
use simplebus_runtime::storage::{MemoryStateStore, ResourceId, StateStore};
use simplebus_runtime::{
    BusBuilder, BusConfig, BusError, BusHost, DistributedLock, HealthState, LockConfig,
    ReleaseOutcome, TransportConfig,
};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Counts routed messages by wire name.
#[derive(Clone, Default)]
struct Seen(Arc<Mutex<HashMap<String, u32>>>);

impl Seen {
    fn count<M: Message>(&self) -> u32 {
        self.0.lock().get(M::MESSAGE_TYPE).copied().unwrap_or(0)
    }
}

impl MessagePreview for Seen {
    fn peek(&self, message: &dyn AnyMessage) {
        *self
            .0
            .lock()
            .entry(message.message_type().to_string())
            .or_default() += 1;
    }
}

fn config() -> BusConfig {
    BusConfig {
        node_id: "scenario".to_string(),
        lock: LockConfig {
            poll_interval: Duration::from_millis(20),
            ..LockConfig::default()
        },
        transport: TransportConfig {
            retry_tick: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(5),
            ..TransportConfig::default()
        },
    }
}

async fn start<F>(store: &Arc<MemoryStateStore>, seen: &Seen, register: F) -> BusHost
where
    F: FnOnce(&simplebus_runtime::HandlerRegistry) -> Result<(), simplebus_core::ConfigError>,
{
    let seen = seen.clone();
    BusBuilder::new(config())
        .store(store.clone())
        .configure(move |registry| {
            registry.preview(seen);
            register(registry)
        })
        .unwrap()
        .start()
        .await
        .unwrap()
}

const IDLE: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Scenario A: publish-agent runs to completion, deployment created once
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn publish_agent_deploys_once_after_both_trainings() {
    let store = Arc::new(MemoryStateStore::new());
    let seen = Seen::default();
    let host = start(&store, &seen, |registry| {
        publish_agent::register(registry, WorkDelay::default())
    })
    .await;

    let id = Uuid::new_v4();
    host.bus()
        .send(&publish_agent::PublishAgent { id })
        .await
        .unwrap();
    assert!(host.wait_idle(IDLE).await);

    assert_eq!(seen.count::<publish_agent::CreateCorpus>(), 1);
    assert_eq!(seen.count::<publish_agent::TrainIntentClassifierModel>(), 1);
    assert_eq!(seen.count::<publish_agent::TrainEntityRecognizerModel>(), 1);
    assert_eq!(seen.count::<publish_agent::CreateDeployment>(), 1);
    assert_eq!(seen.count::<publish_agent::AgentPublished>(), 1);
    assert_eq!(store.record_count(), 0);
    assert_eq!(store.lease_count(), 0);

    assert!(host.shutdown().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn concurrent_publishes_stay_isolated() {
    let store = Arc::new(MemoryStateStore::new());
    let seen = Seen::default();
    let host = start(&store, &seen, |registry| {
        publish_agent::register(registry, WorkDelay(Duration::from_millis(5)))
    })
    .await;

    let bus = host.bus();
    for _ in 0..5 {
        bus.send(&publish_agent::PublishAgent { id: Uuid::new_v4() })
            .await
            .unwrap();
    }
    assert!(host.wait_idle(IDLE).await);

    assert_eq!(seen.count::<publish_agent::CreateDeployment>(), 5);
    assert_eq!(seen.count::<publish_agent::AgentPublished>(), 5);
    assert_eq!(store.record_count(), 0);

    host.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Scenario B: a non-start message for an unknown instance
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unknown_instance_cannot_materialize() {
    let store = Arc::new(MemoryStateStore::new());
    let seen = Seen::default();
    let host = start(&store, &seen, |registry| {
        publish_agent::register(registry, WorkDelay::default())
    })
    .await;

    let err = host
        .router()
        .route(Arc::new(publish_agent::CorpusCreated {
            id: Uuid::new_v4(),
            success: true,
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::CannotMaterialize { .. }));
    assert_eq!(store.record_count(), 0);
    assert_eq!(store.lease_count(), 0);

    // Through the transport the same failure is logged and acknowledged.
    host.bus()
        .send(&publish_agent::CorpusCreated {
            id: Uuid::new_v4(),
            success: true,
        })
        .await
        .unwrap();
    assert!(host.wait_idle(IDLE).await);
    assert_eq!(seen.count::<publish_agent::TrainIntentClassifierModel>(), 0);
    assert_eq!(store.record_count(), 0);

    host.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Scenario C: two lock holders race for one resource
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn racing_locks_hold_one_at_a_time() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let lock_config = LockConfig {
        poll_interval: Duration::from_millis(50),
        ..LockConfig::default()
    };
    let first = DistributedLock::new(store.clone(), clock.clone(), lock_config.clone());
    let second = DistributedLock::new(store.clone(), clock.clone(), lock_config);
    let resource = ResourceId::new();

    let held = first.acquire(&resource).await.unwrap();
    assert!(second.try_acquire(&resource).await.unwrap().is_none());

    let waiter = {
        let second = second.clone();
        tokio::spawn(async move { second.acquire(&resource).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!waiter.is_finished());

    assert_eq!(first.release(held).await.unwrap(), ReleaseOutcome::Released);
    let taken = waiter.await.unwrap().unwrap();
    assert!(first.try_acquire(&resource).await.unwrap().is_none());

    // A crashed holder: the lease is reclaimed once its TTL has passed.
    clock.advance(Duration::from_secs(25));
    let reclaimed = first.acquire(&resource).await.unwrap();
    assert_ne!(reclaimed.owner, taken.owner);
    assert_eq!(second.release(taken).await.unwrap(), ReleaseOutcome::Stale);
    assert_eq!(first.release(reclaimed).await.unwrap(), ReleaseOutcome::Released);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenTally {
    id: String,
}

impl Message for OpenTally {
    const MESSAGE_TYPE: &'static str = "scenario.open-tally";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Bump {
    id: String,
}

impl Message for Bump {
    const MESSAGE_TYPE: &'static str = "scenario.bump";
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TallyState {
    id: String,
    count: u32,
}

#[derive(Default)]
struct TallySaga {
    data: SagaData<TallyState>,
}

impl Handler for TallySaga {}

impl Saga for TallySaga {
    const SAGA_TYPE: &'static str = "scenario.tally";
    type State = TallyState;

    fn configure_mapping(mapper: &mut StateMapper<Self>) {
        mapper
            .start_with::<OpenTally>("id", "id")
            .map::<Bump>("id", "id");
    }

    fn saga_data(&self) -> &SagaData<TallyState> {
        &self.data
    }

    fn saga_data_mut(&mut self) -> &mut SagaData<TallyState> {
        &mut self.data
    }
}

impl StartedBy<OpenTally> for TallySaga {}

#[async_trait]
impl Handle<OpenTally> for TallySaga {
    async fn handle(&mut self, _message: &OpenTally, _bus: &mut Outbox) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Handle<Bump> for TallySaga {
    async fn handle(&mut self, _message: &Bump, _bus: &mut Outbox) -> anyhow::Result<()> {
        let count = self.state()?.count;
        tokio::time::sleep(Duration::from_millis(3)).await;
        self.state_mut()?.count = count + 1;
        Ok(())
    }
}

fn register_tally(registry: &simplebus_runtime::HandlerRegistry) -> Result<(), simplebus_core::ConfigError> {
    registry
        .saga(TallySaga::default)?
        .handles::<OpenTally>()?
        .handles::<Bump>()?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn two_hosts_sharing_a_store_lose_no_updates() {
    let store = Arc::new(MemoryStateStore::new());
    let seen = Seen::default();
    let left = start(&store, &seen, register_tally).await;
    let right = start(&store, &seen, register_tally).await;

    let id = "tally-1".to_string();
    left.bus().send(&OpenTally { id: id.clone() }).await.unwrap();
    assert!(left.wait_idle(IDLE).await);

    for n in 0..12 {
        let bus = if n % 2 == 0 { left.bus() } else { right.bus() };
        bus.send(&Bump { id: id.clone() }).await.unwrap();
    }
    assert!(left.wait_idle(IDLE).await);
    assert!(right.wait_idle(IDLE).await);

    let key = CorrelationKey {
        saga_type: TallySaga::SAGA_TYPE,
        field: "id".to_string(),
        value: CorrelationValue::from(id.as_str()),
    };
    let record = store.get(&key).await.unwrap().unwrap();
    assert_eq!(record.document["count"], 12);
    assert_eq!(store.lease_count(), 0);

    left.shutdown().await.unwrap();
    right.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Completion and retry
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn completed_saga_is_deleted_and_can_restart() {
    let store = Arc::new(MemoryStateStore::new());
    let seen = Seen::default();
    let host = start(&store, &seen, |registry| {
        train_models::register_with(registry, Arc::new(|| true))
    })
    .await;

    let id = Uuid::new_v4();
    host.bus()
        .send(&train_models::TrainModels { id })
        .await
        .unwrap();
    assert!(host.wait_idle(IDLE).await);
    assert_eq!(seen.count::<train_models::ModelsTrained>(), 1);
    assert_eq!(store.record_count(), 0);

    let err = host
        .router()
        .route(Arc::new(train_models::IntentClassifierTrained { id }))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::CannotMaterialize { .. }));

    host.bus()
        .send(&train_models::TrainModels { id })
        .await
        .unwrap();
    assert!(host.wait_idle(IDLE).await);
    assert_eq!(seen.count::<train_models::ModelsTrained>(), 2);
    assert_eq!(store.record_count(), 0);

    host.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn pending_training_is_polled_until_finished() {
    let store = Arc::new(MemoryStateStore::new());
    let seen = Seen::default();
    let checks = Arc::new(AtomicU32::new(0));
    let probe = {
        let checks = Arc::clone(&checks);
        Arc::new(move || checks.fetch_add(1, Ordering::SeqCst) >= 4)
    };
    let host = start(&store, &seen, move |registry| {
        train_models::register_with(registry, probe)
    })
    .await;

    host.bus()
        .send(&train_models::TrainModels { id: Uuid::new_v4() })
        .await
        .unwrap();
    assert!(host.wait_idle(IDLE).await);

    let polled = seen.count::<train_models::CheckIntentClassifier>()
        + seen.count::<train_models::CheckEntityRecognizer>();
    assert_eq!(polled, 6);
    assert_eq!(seen.count::<train_models::ModelsTrained>(), 1);
    assert_eq!(store.record_count(), 0);

    host.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn import_merges_after_all_tables_staged() {
    let store = Arc::new(MemoryStateStore::new());
    let seen = Seen::default();
    let host = start(&store, &seen, |registry| {
        import_evaluator::register(registry, WorkDelay::default())
    })
    .await;

    host.bus()
        .send(&import_evaluator::ImportEvaluatorData {
            import_id: Uuid::new_v4(),
        })
        .await
        .unwrap();
    assert!(host.wait_idle(IDLE).await);
    assert_eq!(seen.count::<import_evaluator::Table5Staged>(), 1);
    assert_eq!(seen.count::<import_evaluator::MergeStagedData>(), 1);
    assert_eq!(seen.count::<import_evaluator::EvaluatorDataImported>(), 1);
    assert_eq!(store.record_count(), 0);

    assert_eq!(host.health_state(), HealthState::Ready);
    host.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_stage_abandons_the_import() {
    let store = Arc::new(MemoryStateStore::new());
    let seen = Seen::default();
    // The workflow alone: stage commands have no handler and are dropped.
    let host = start(&store, &seen, |registry| {
        registry
            .saga(import_evaluator::ImportEvaluatorWorkflow::default)?
            .handles::<import_evaluator::ImportEvaluatorData>()?
            .handles::<import_evaluator::Table2Staged>()?
            .handles::<import_evaluator::Table3Staged>()?;
        Ok(())
    })
    .await;

    let import_id = Uuid::new_v4();
    let bus = host.bus();
    bus.send(&import_evaluator::ImportEvaluatorData { import_id })
        .await
        .unwrap();
    assert!(host.wait_idle(IDLE).await);
    assert_eq!(store.record_count(), 1);

    bus.send(&import_evaluator::Table3Staged {
        import_id,
        success: false,
    })
    .await
    .unwrap();
    assert!(host.wait_idle(IDLE).await);
    assert_eq!(store.record_count(), 0);

    // Later events for the abandoned import find nothing to hydrate.
    let err = host
        .router()
        .route(Arc::new(import_evaluator::Table2Staged {
            import_id,
            success: true,
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::CannotMaterialize { .. }));

    host.shutdown().await.unwrap();
}
