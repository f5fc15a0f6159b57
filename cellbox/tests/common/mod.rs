//! Shared helpers for the engine integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cellbox::{AcceleratorGate, Admission, CellKey, ContextId, Coord, Namespace, ProducerContext};
use cellbox_backend::{DeleteStatus, DiskKey, StoreError, StoreResult};
use cellbox_core::Raw;
use dashmap::DashMap;

pub const NAMESPACE: &str = "overworld";

#[derive(Debug, Default)]
pub struct StoreCounters {
    pub read_count: AtomicUsize,
    pub write_count: AtomicUsize,
    pub remove_count: AtomicUsize,
}

impl StoreCounters {
    pub fn read_count(&self) -> usize {
        self.read_count.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.remove_count.load(Ordering::SeqCst)
    }
}

/// In-memory persistent tier with counters and failure injection.
///
/// Clones share the same map, so a test can keep one handle and give
/// another to the engine.
#[derive(Clone, Debug, Default)]
pub struct TestStore {
    entries: Arc<DashMap<DiskKey, Raw>>,
    pub counters: Arc<StoreCounters>,
    failing: Arc<AtomicBool>,
    read_delay: Duration,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every read sleeps for `delay` before answering.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    /// Makes every operation fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn has(&self, key: &CellKey) -> bool {
        self.entries.contains_key(&DiskKey::from_cell(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Stores raw bytes, bypassing the engine's encoding.
    pub fn insert_raw(&self, key: &CellKey, raw: &'static [u8]) {
        self.entries
            .insert(DiskKey::from_cell(key), Bytes::from_static(raw));
    }

    pub fn put_raw(&self, key: &CellKey, raw: Raw) {
        self.entries.insert(DiskKey::from_cell(key), raw);
    }

    pub fn take_raw(&self, key: &CellKey) -> Option<Raw> {
        self.entries.remove(&DiskKey::from_cell(key)).map(|(_, raw)| raw)
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Io(std::io::Error::other("simulated failure")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl cellbox::PersistentStore for TestStore {
    async fn read(&self, key: &DiskKey) -> StoreResult<Option<Raw>> {
        self.counters.read_count.fetch_add(1, Ordering::SeqCst);
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        self.check()?;
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn write(&self, key: &DiskKey, value: Raw, _ttl: Option<Duration>) -> StoreResult<()> {
        self.counters.write_count.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.entries.insert(key.clone(), value);
        Ok(())
    }

    async fn remove(&self, key: &DiskKey) -> StoreResult<DeleteStatus> {
        self.counters.remove_count.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(match self.entries.remove(key) {
            Some(_) => DeleteStatus::Deleted(1),
            None => DeleteStatus::Missing,
        })
    }
}

/// Producer context standing in for a loaded world.
#[derive(Debug)]
pub struct TestWorld {
    pub id: ContextId,
    pub seed: u8,
}

impl TestWorld {
    pub fn new(seed: u8) -> Arc<Self> {
        Arc::new(Self {
            id: ContextId::fresh(),
            seed,
        })
    }

    pub fn key(&self, kind: &str, x: i32, z: i32) -> CellKey {
        CellKey::new(kind, self.id, self.coord(x, z))
    }
}

impl ProducerContext for TestWorld {
    fn context_id(&self) -> ContextId {
        self.id
    }

    fn namespace(&self) -> Namespace {
        Namespace::new(NAMESPACE)
    }
}

pub fn key_in(context: ContextId, kind: &str, x: i32, z: i32) -> CellKey {
    CellKey::new(kind, context, Coord::new(NAMESPACE, x, z))
}

/// Artifact of `len` bytes. Its size hint is `len` plus the `Vec` header.
pub fn blob(len: usize, fill: u8) -> Vec<u8> {
    vec![fill; len]
}

/// Gate whose answer is switched by the test.
#[derive(Debug, Default)]
pub struct SwitchGate {
    pub rejecting: AtomicBool,
    pub asked: AtomicUsize,
}

impl AcceleratorGate for SwitchGate {
    fn admit(&self, _bytes: usize) -> Admission {
        self.asked.fetch_add(1, Ordering::SeqCst);
        if self.rejecting.load(Ordering::SeqCst) {
            Admission::reject(0.97)
        } else {
            Admission::accept(0.2)
        }
    }
}

/// Polls `check` on real time until it holds, failing after five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            std::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Yields to the scheduler until `check` holds. For paused-clock tests
/// whose pending work never leaves the runtime.
pub async fn settle(mut check: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if check() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached after 10000 yields");
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("cellbox=debug")
        .try_init();
}
