mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cellbox::{
    BudgetLedger, CacheGroup, CellKey, ContextId, Coord, EngineConfig, HostFeedback, IdleHost,
    KindPolicy, ManualFeedback, StoreConfig, TieredStore,
};
use common::{SwitchGate, TestStore, blob, key_in};

/// Vec header plus 400 payload bytes.
const ENTRY: usize = 424;

fn config(store: StoreConfig) -> EngineConfig {
    EngineConfig::builder().store(store).build()
}

fn no_grace(max_bytes: usize) -> StoreConfig {
    StoreConfig {
        max_bytes,
        insert_grace: Duration::ZERO,
        access_grace: Duration::ZERO,
        aggressive_ratio: 1.0,
        ..StoreConfig::default()
    }
}

fn memory_store(config: EngineConfig, feedback: Arc<dyn HostFeedback>) -> TieredStore<Vec<u8>> {
    TieredStore::builder()
        .config(config)
        .feedback(feedback)
        .build()
        .unwrap()
}

fn tiered_store(config: EngineConfig, persistent: &TestStore) -> TieredStore<Vec<u8>> {
    TieredStore::builder()
        .config(config)
        .persistent(Arc::new(persistent.clone()))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn insert_grace_protects_new_entries() {
    let store = memory_store(
        config(StoreConfig {
            max_bytes: 1024,
            insert_grace: Duration::from_secs(3),
            access_grace: Duration::from_secs(10),
            ..StoreConfig::default()
        }),
        Arc::new(IdleHost),
    );
    let context = ContextId::fresh();
    let (a, b, c) = (
        key_in(context, "heightmap", 0, 0),
        key_in(context, "heightmap", 1, 0),
        key_in(context, "heightmap", 2, 0),
    );

    assert!(store.put(a.clone(), blob(400, 1)));
    assert!(store.put(b.clone(), blob(400, 2)));
    assert_eq!(store.stats_summary().bytes, 2 * ENTRY);

    assert!(!store.put(c.clone(), blob(400, 3)), "both residents are in grace");
    assert_eq!(store.stats_summary().budget_rejections, 1);

    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(store.put(c.clone(), blob(400, 3)));

    assert!(!store.in_memory(&a), "oldest entry is evicted first");
    assert!(store.in_memory(&b));
    assert!(store.in_memory(&c));
    assert_eq!(store.stats_summary().evictions.aggressive, 1);
}

#[tokio::test(start_paused = true)]
async fn access_grace_protects_recently_read_entries() {
    let store = memory_store(
        config(StoreConfig {
            max_bytes: 1024,
            insert_grace: Duration::from_secs(3),
            access_grace: Duration::from_secs(10),
            aggressive_ratio: 1.0,
            ..StoreConfig::default()
        }),
        Arc::new(IdleHost),
    );
    let context = ContextId::fresh();
    let (a, b, big) = (
        key_in(context, "heightmap", 0, 0),
        key_in(context, "heightmap", 1, 0),
        key_in(context, "heightmap", 2, 0),
    );
    store.put(a.clone(), blob(400, 1));
    store.put(b.clone(), blob(400, 2));

    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(store.peek(&a), Some(blob(400, 1)));

    // Needs both slots, but `a` was read moments ago.
    assert!(!store.put(big.clone(), blob(700, 9)));
    assert!(store.in_memory(&a));
    assert!(!store.in_memory(&b));

    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(store.put(big.clone(), blob(700, 9)));
    assert!(!store.in_memory(&a));
    assert_eq!(store.stats_summary().evictions.capacity, 2);
}

#[tokio::test(start_paused = true)]
async fn host_load_shrinks_budget() {
    let feedback = Arc::new(ManualFeedback::new());
    let store = memory_store(config(no_grace(2048)), feedback.clone());
    assert_eq!(store.effective_budget(), 2048);

    let context = ContextId::fresh();
    let keys: Vec<_> = (0..4).map(|x| key_in(context, "heightmap", x, 0)).collect();
    for key in &keys[..3] {
        assert!(store.put(key.clone(), blob(400, 0)));
    }
    assert_eq!(store.stats_summary().bytes, 3 * ENTRY);

    feedback.set_tick_ms(45.0);
    let elevated = store.effective_budget();
    assert!(elevated < 2048);

    feedback.set_tick_ms(60.0);
    assert_eq!(store.effective_budget(), 1024);
    assert!(elevated > 1024);

    assert!(store.put(keys[3].clone(), blob(400, 0)));
    let stats = store.stats_summary();
    assert!(stats.bytes <= 1024, "{stats}");
    assert_eq!(stats.entries, 2);
    assert!(!store.in_memory(&keys[0]));
    assert!(!store.in_memory(&keys[1]));
}

#[tokio::test(start_paused = true)]
async fn kind_entry_cap_evicts_within_kind() {
    let config = EngineConfig::builder()
        .kind(
            "noise",
            KindPolicy {
                max_entries: 2,
                ..KindPolicy::default()
            },
        )
        .store(no_grace(1 << 20))
        .build();
    let store = memory_store(config, Arc::new(IdleHost));
    let context = ContextId::fresh();

    let height = key_in(context, "heightmap", 0, 0);
    store.put(height.clone(), blob(8, 0));
    for x in 0..3 {
        store.put(key_in(context, "noise", x, 0), blob(8, 0));
    }

    assert!(store.in_memory(&height));
    assert!(!store.in_memory(&key_in(context, "noise", 0, 0)));
    assert_eq!(store.stats_summary().evictions.kind_cap, 1);
    assert_eq!(store.stats_summary().entries, 3);
}

#[tokio::test]
async fn gate_rejection_still_persists() {
    let persistent = TestStore::new();
    let gate = Arc::new(SwitchGate::default());
    gate.rejecting.store(true, Ordering::SeqCst);
    let store: TieredStore<Vec<u8>> = TieredStore::builder()
        .persistent(Arc::new(persistent.clone()))
        .gate(gate.clone())
        .build()
        .unwrap();
    let key = key_in(ContextId::fresh(), "heightmap", 0, 0);

    assert!(!store.put(key.clone(), blob(64, 1)));
    assert!(!store.in_memory(&key));
    assert_eq!(store.stats_summary().gate_rejections, 1);

    store.io().wait_idle().await;
    assert!(persistent.has(&key));

    gate.rejecting.store(false, Ordering::SeqCst);
    assert_eq!(store.get(&key).await, Some(blob(64, 1)));
    assert!(store.in_memory(&key));
}

#[tokio::test]
async fn persisted_artifacts_survive_clearing_memory() {
    let persistent = TestStore::new();
    let store = tiered_store(EngineConfig::default(), &persistent);
    let key = key_in(ContextId::fresh(), "heightmap", 3, -7);

    store.put(key.clone(), blob(128, 7));
    store.io().wait_idle().await;
    assert_eq!(persistent.counters.write_count(), 1);

    assert_eq!(store.clear_all(), 1);
    assert!(!store.in_memory(&key));
    assert_eq!(store.peek(&key), None);

    assert_eq!(store.get(&key).await, Some(blob(128, 7)));
    assert!(store.in_memory(&key), "disk hit is promoted");
    store.io().wait_idle().await;
    assert_eq!(persistent.counters.write_count(), 1, "promotion is not written back");

    let stats = store.stats_summary();
    assert_eq!(stats.disk_hits, 1);
    assert_eq!(stats.corrupt_entries, 0);
}

#[tokio::test]
async fn namespaces_differing_in_punctuation_do_not_share_disk_slots() {
    let persistent = TestStore::new();
    let store = tiered_store(EngineConfig::default(), &persistent);
    let context = ContextId::fresh();
    let spaced = CellKey::new("heightmap", context, Coord::new("mod:deep caves", 0, 0));
    let underscored = CellKey::new("heightmap", context, Coord::new("mod:deep_caves", 0, 0));

    store.put(spaced.clone(), blob(32, 1));
    store.io().wait_idle().await;
    store.clear_all();

    assert_eq!(store.get(&underscored).await, None);
    assert_eq!(store.get(&spaced).await, Some(blob(32, 1)));
    assert_eq!(persistent.len(), 1);
}

#[tokio::test]
async fn failed_read_does_not_block_later_reads() {
    let persistent = TestStore::new();
    let store = tiered_store(EngineConfig::default(), &persistent);
    let key = key_in(ContextId::fresh(), "heightmap", 2, 2);

    store.put(key.clone(), blob(32, 9));
    store.io().wait_idle().await;
    store.clear_all();

    persistent.set_failing(true);
    assert_eq!(store.get(&key).await, None);
    persistent.set_failing(false);

    assert_eq!(store.get(&key).await, Some(blob(32, 9)));
    assert_eq!(persistent.counters.read_count(), 2);
}

#[tokio::test]
async fn persisted_artifacts_are_shared_across_contexts() {
    let persistent = TestStore::new();
    let store = tiered_store(EngineConfig::default(), &persistent);
    let first = key_in(ContextId::fresh(), "heightmap", 1, 1);
    let second = key_in(ContextId::fresh(), "heightmap", 1, 1);

    store.put(first, blob(32, 4));
    store.io().wait_idle().await;

    assert_eq!(store.get(&second).await, Some(blob(32, 4)));
}

#[tokio::test]
async fn corrupt_entry_is_deleted_and_reported_absent() {
    let persistent = TestStore::new();
    let store = tiered_store(EngineConfig::default(), &persistent);
    let key = key_in(ContextId::fresh(), "heightmap", 0, 0);
    persistent.insert_raw(&key, b"not an envelope");

    assert_eq!(store.get(&key).await, None);
    assert_eq!(store.stats_summary().corrupt_entries, 1);

    store.io().wait_idle().await;
    assert!(!persistent.has(&key));
    assert_eq!(persistent.counters.remove_count(), 1);
}

#[tokio::test]
async fn entry_moved_to_another_key_is_corrupt() {
    let persistent = TestStore::new();
    let store = tiered_store(EngineConfig::default(), &persistent);
    let context = ContextId::fresh();
    let noise = key_in(context, "noise", 0, 0);

    store.put(noise.clone(), blob(16, 1));
    store.io().wait_idle().await;

    // Moved under another key: the envelope still names the old one.
    let raw = persistent.take_raw(&noise).unwrap();
    let height = key_in(context, "heightmap", 0, 0);
    persistent.put_raw(&height, raw);

    assert_eq!(store.get(&height).await, None);
    assert_eq!(store.stats_summary().corrupt_entries, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_misses_share_one_read() {
    let persistent = TestStore::new().with_read_delay(Duration::from_millis(20));
    let store = tiered_store(EngineConfig::default(), &persistent);
    let key = key_in(ContextId::fresh(), "heightmap", 0, 0);

    store.put(key.clone(), blob(64, 5));
    store.io().wait_idle().await;
    store.clear_all();

    let (first, second, third) = tokio::join!(store.get(&key), store.get(&key), store.get(&key));

    assert_eq!(first, Some(blob(64, 5)));
    assert_eq!(second, first);
    assert_eq!(third, first);
    assert_eq!(persistent.counters.read_count(), 1);
}

#[tokio::test]
async fn remove_schedules_persistent_delete() {
    let persistent = TestStore::new();
    let store = tiered_store(EngineConfig::default(), &persistent);
    let key = key_in(ContextId::fresh(), "heightmap", 0, 0);

    store.put(key.clone(), blob(64, 5));
    store.io().wait_idle().await;
    assert!(persistent.has(&key));

    assert!(store.remove(&key));
    store.io().wait_idle().await;
    assert!(!persistent.has(&key));
    assert!(!store.remove(&key));
}

#[tokio::test]
async fn persistent_failures_read_as_misses() {
    let persistent = TestStore::new();
    persistent.set_failing(true);
    let store = tiered_store(EngineConfig::default(), &persistent);
    let key = key_in(ContextId::fresh(), "heightmap", 0, 0);

    assert!(store.put(key.clone(), blob(64, 5)), "memory tier still admits");
    store.io().wait_idle().await;
    store.clear_all();

    assert_eq!(store.get(&key).await, None);
    let stats = store.stats_summary();
    assert_eq!(stats.disk_errors, 2);
    assert_eq!(stats.disk_misses, 1);
}

#[tokio::test(start_paused = true)]
async fn memory_emergency_trims_store_and_ledger_groups() {
    let feedback = Arc::new(ManualFeedback::new());
    let ledger = BudgetLedger::new();
    let trims = Arc::new(AtomicUsize::new(0));
    ledger.register(CacheGroup::new("biome_lookup", 1024, 256).with_eviction(Arc::new({
        let trims = trims.clone();
        move |_fraction: f64| {
            trims.fetch_add(1, Ordering::SeqCst);
            10
        }
    })));

    let store: TieredStore<Vec<u8>> = TieredStore::builder()
        .config(config(no_grace(1 << 20)))
        .feedback(feedback.clone())
        .ledger(ledger.clone())
        .build()
        .unwrap();
    let context = ContextId::fresh();
    store.put(key_in(context, "heightmap", 0, 0), blob(16, 0));
    store.put(key_in(context, "heightmap", 1, 0), blob(16, 0));

    feedback.set_memory_pressure(0.9);
    let newest = key_in(context, "heightmap", 2, 0);
    assert!(store.put(newest.clone(), blob(16, 0)));

    let stats = store.stats_summary();
    assert_eq!(stats.emergencies, 1);
    assert_eq!(stats.evictions.emergency, 2);
    assert_eq!(stats.entries, 1);
    assert!(store.in_memory(&newest));
    assert_eq!(trims.load(Ordering::SeqCst), 1);

    // Within the cooldown nothing else fires.
    store.put(key_in(context, "heightmap", 3, 0), blob(16, 0));
    assert_eq!(store.stats_summary().emergencies, 1);
    assert_eq!(trims.load(Ordering::SeqCst), 1);

    let groups = ledger.snapshot();
    let heightmap = groups.iter().find(|g| g.name.as_str() == "heightmap").unwrap();
    assert_eq!(heightmap.entries, 2);
}
