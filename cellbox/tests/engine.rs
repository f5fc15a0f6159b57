mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cellbox::{
    BudgetLedger, BuildError, CacheGroup, CellKey, ConfigError, Engine, EngineConfig, EntryState,
    Kind, LimiterConfig, ProducerError, Requested,
};
use cellbox_feoxdb::FeOxDbStore;
use common::{TestWorld, eventually, init_tracing};

type TestEngine = Engine<TestWorld, Vec<u8>>;

fn counting(
    calls: &Arc<AtomicUsize>,
) -> impl Fn(&TestWorld, &CellKey) -> Result<Vec<u8>, ProducerError> + Send + Sync + 'static {
    let calls = calls.clone();
    move |world: &TestWorld, key: &CellKey| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![world.seed, key.coord().x() as u8, key.coord().z() as u8])
    }
}

#[tokio::test]
async fn persisted_artifacts_are_shared_between_engines() {
    init_tracing();
    let disk = FeOxDbStore::in_memory().unwrap();
    let first: TestEngine = Engine::builder().persistent(disk.clone()).build().unwrap();
    let second: TestEngine = Engine::builder().persistent(disk).build().unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let old_world = TestWorld::new(7);
    let produced = first.request_sync(&old_world, old_world.key("heightmap", 3, 4), counting(&calls));
    assert_eq!(produced, Some(vec![7, 3, 4]));
    first.store().io().wait_idle().await;

    // A reloaded world gets a new id but reads the same persisted cells.
    let new_world = TestWorld::new(8);
    let key = new_world.key("heightmap", 3, 4);
    assert_eq!(
        second.request_async(&new_world, key.clone(), counting(&calls)),
        Requested::Scheduled
    );
    second.flush_all();
    eventually(|| second.state(&key) == EntryState::Ready).await;

    assert_eq!(second.get_if_ready(&key), Some(vec![7, 3, 4]));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.stats().store.disk_hits, 1);
}

#[tokio::test]
async fn shutdown_drops_state_and_discards_late_results() {
    let engine: TestEngine = Engine::builder().build().unwrap();
    let world = TestWorld::new(1);
    let ready = world.key("heightmap", 0, 0);
    let pending = world.key("heightmap", 1, 0);
    let calls = Arc::new(AtomicUsize::new(0));

    engine.request_sync(&world, ready.clone(), counting(&calls));
    engine.request_async(&world, pending.clone(), counting(&calls));
    assert_eq!(engine.batch().stats().pending, 1);

    engine.shutdown();
    assert_eq!(engine.state(&ready), EntryState::Absent);
    assert!(!engine.store().in_memory(&ready));
    assert_eq!(engine.batch().stats().pending, 0);
    let heightmap = engine.ledger().group("heightmap").unwrap();
    assert_eq!(heightmap.snapshot().entries, 0);

    eventually(|| engine.batch().stats().completed == 1).await;
    assert_eq!(engine.state(&pending), EntryState::Absent);
    assert_eq!(engine.memo().stats().discarded, 1);
}

#[tokio::test]
async fn stats_cover_every_component() {
    let engine: TestEngine = Engine::builder().parallelism(2).build().unwrap();
    let world = TestWorld::new(1);
    let calls = Arc::new(AtomicUsize::new(0));

    for x in 0..3 {
        engine.request_sync(&world, world.key("noise", x, 0), counting(&calls));
    }
    engine.get_if_ready(&world.key("noise", 0, 0));

    let stats = engine.stats();
    assert_eq!(stats.memo.produced, 3);
    assert_eq!(stats.memo.hits, 1);
    assert_eq!(stats.store.entries, 3);
    assert_eq!(stats.store.admitted, 3);
    assert_eq!(stats.limiter.in_use, 0);
    assert!(stats.limiter.limit <= 2);
    assert_eq!(stats.batch.enqueued, 0);
}

#[tokio::test]
async fn store_groups_join_a_shared_ledger() {
    let ledger = BudgetLedger::new();
    let trimmed = Arc::new(AtomicUsize::new(0));
    ledger.register(CacheGroup::new("biomes", 128, 512).with_eviction(Arc::new({
        let trimmed = trimmed.clone();
        move |_fraction: f64| {
            trimmed.fetch_add(1, Ordering::SeqCst);
            0
        }
    })));

    let engine: TestEngine = Engine::builder().ledger(ledger.clone()).build().unwrap();
    let world = TestWorld::new(1);
    let calls = Arc::new(AtomicUsize::new(0));
    engine.request_sync(&world, world.key("heightmap", 0, 0), counting(&calls));

    let memo_group = engine.memo().budget_group().name().to_owned();
    let names: Vec<_> = ledger
        .snapshot()
        .into_iter()
        .map(|group| group.name.to_string())
        .collect();
    assert_eq!(names, ["biomes", "heightmap", memo_group.as_str()]);
    assert_eq!(ledger.group("heightmap").unwrap().snapshot().entries, 1);
    assert_eq!(ledger.group(&memo_group).unwrap().snapshot().entries, 1);

    assert_eq!(ledger.request_eviction(0.5), 1);
    assert_eq!(trimmed.load(Ordering::SeqCst), 1);
    assert_eq!(ledger.group(&memo_group).unwrap().snapshot().entries, 0);

    drop(engine);
    assert!(ledger.group(&memo_group).is_none());
}

#[tokio::test]
async fn limiter_floor_above_parallelism_is_tolerated() {
    let config = EngineConfig::builder()
        .limiter(LimiterConfig {
            floor: 8,
            ..LimiterConfig::default()
        })
        .build();
    let engine: TestEngine = Engine::builder()
        .config(config)
        .parallelism(2)
        .build()
        .unwrap();

    assert!(engine.stats().limiter.limit <= 2);
    let world = TestWorld::new(3);
    let calls = Arc::new(AtomicUsize::new(0));
    let produced = engine.request_sync(&world, world.key("heightmap", 0, 0), counting(&calls));
    assert_eq!(produced, Some(vec![3, 0, 0]));
}

#[test]
fn config_from_json_is_clamped() {
    let config = EngineConfig::from_json(
        r#"{
            "kinds": { "heightmap": { "ttl": "2s", "max_entries": 16 } },
            "memo": { "failure_backoff": "250ms" },
            "batch": { "min_threshold": 0, "max_threshold": 32 }
        }"#,
    )
    .unwrap();

    let heightmap = config.kind_policy(&Kind::new("heightmap"));
    assert_eq!(heightmap.ttl, Duration::from_secs(2));
    assert_eq!(heightmap.max_entries, 16);
    assert_eq!(heightmap.approx_bytes, 64 * 1024);
    assert_eq!(
        config.kind_policy(&Kind::new("noise")).ttl,
        Duration::from_secs(300)
    );
    assert_eq!(config.memo.failure_backoff, Duration::from_millis(250));
    assert_eq!(config.batch.min_threshold, 1);
    assert_eq!(config.batch.max_threshold, 32);
}

#[test]
fn malformed_config_is_rejected() {
    let error = EngineConfig::from_json(r#"{ "memo": { "failure_backoff": "soon" } }"#);
    assert!(matches!(error, Err(ConfigError::Parse(_))));
}

#[test]
fn build_outside_runtime_needs_a_handle() {
    let result: Result<TestEngine, _> = Engine::builder().build();
    assert!(matches!(result, Err(BuildError::NoRuntime(_))));
}

#[test]
fn engine_runs_on_a_supplied_runtime() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let engine: TestEngine = Engine::builder()
        .runtime(runtime.handle().clone())
        .build()
        .unwrap();
    let world = TestWorld::new(4);
    let key = world.key("heightmap", 1, 2);
    let calls = Arc::new(AtomicUsize::new(0));

    assert_eq!(
        engine.request_async(&world, key.clone(), counting(&calls)),
        Requested::Scheduled
    );
    engine.flush_all();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while engine.state(&key) != EntryState::Ready {
        assert!(std::time::Instant::now() < deadline, "artifact never became ready");
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(engine.get_if_ready(&key), Some(vec![4, 1, 2]));
}
