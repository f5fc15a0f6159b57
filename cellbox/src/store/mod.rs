//! Two-tier artifact store.
//!
//! [`TieredStore`] keeps a bounded in-memory tier in front of an optional
//! [`PersistentStore`]:
//!
//! ```text
//! put(key, artifact)
//!    ├─> encode + schedule disk write (always, off-thread)
//!    └─> memory admission
//!          1. accelerator gate
//!          2. emergency watchdog (memory pressure, with cooldown)
//!          3. bounded aggressive cleanup above `aggressive_ratio`
//!          4. LRU eviction until the entry fits
//!          5. per-kind entry cap
//!
//! get(key)
//!    ├─> memory (refreshes recency)
//!    └─> disk (deduplicated read) -> decode -> admit, no re-persist
//! ```
//!
//! Capacity eviction never touches an entry inside either grace window:
//! one measured from insertion, one from the last read. The byte budget is
//! recomputed on every admission from host load, so admission tightens on
//! its own as the host slows down.
//!
//! One coarse lock guards recency, byte totals and the per-kind ledgers.
//! No I/O, encoding or ledger callback runs while it is held.

mod memory;
mod stats;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cellbox_backend::{DiskKey, PersistentStore};
use cellbox_core::{AcceleratorGate, Artifact, CellKey, HostFeedback, IdleHost, Raw};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use memory::EvictionCounts;
pub use stats::StoreStats;

use crate::config::EngineConfig;
use crate::error::BuildError;
use crate::io::IoPool;
use crate::ledger::BudgetLedger;
use crate::metrics;
use memory::{Grace, Reason, StoreState};

type PendingRead = Shared<BoxFuture<'static, Option<Raw>>>;

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    disk_hits: AtomicU64,
    disk_misses: AtomicU64,
    admitted: AtomicU64,
    gate_rejections: AtomicU64,
    budget_rejections: AtomicU64,
    emergencies: AtomicU64,
    corrupt_entries: AtomicU64,
    disk_errors: AtomicU64,
}

struct StoreInner<A> {
    config: EngineConfig,
    grace: Grace,
    state: Mutex<StoreState<A>>,
    persistent: Option<Arc<dyn PersistentStore>>,
    io: IoPool,
    pending_reads: Arc<DashMap<DiskKey, PendingRead>>,
    feedback: Arc<dyn HostFeedback>,
    gate: Option<Arc<dyn AcceleratorGate>>,
    ledger: BudgetLedger,
    counters: Arc<Counters>,
}

/// Bounded in-memory tier backed by an optional persistent tier.
///
/// Cloning is cheap; clones share both tiers.
pub struct TieredStore<A> {
    inner: Arc<StoreInner<A>>,
}

impl<A> Clone for TieredStore<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A> std::fmt::Debug for TieredStore<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStore")
            .field("persistent", &self.inner.persistent.as_ref().map(|p| p.label()))
            .field("max_bytes", &self.inner.config.store.max_bytes)
            .finish()
    }
}

impl<A: Artifact> TieredStore<A> {
    /// Starts building a store.
    pub fn builder() -> TieredStoreBuilder<A> {
        TieredStoreBuilder::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState<A>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Background pool running persistent-tier operations.
    pub fn io(&self) -> &IoPool {
        &self.inner.io
    }

    /// Shared budget ledger this store reports into.
    pub fn ledger(&self) -> &BudgetLedger {
        &self.inner.ledger
    }

    /// Byte budget after applying the current host load.
    pub fn effective_budget(&self) -> usize {
        let store = &self.inner.config.store;
        let limiter = &self.inner.config.limiter;
        let load = self.inner.feedback.smoothed_tick_ms();
        let factor = if load >= limiter.load_high_ms {
            store.pressure_high_factor
        } else if load >= limiter.load_elevated_ms {
            store.pressure_elevated_factor
        } else {
            1.0
        };
        (store.max_bytes as f64 * factor) as usize
    }

    /// Stores `artifact` under `key`.
    ///
    /// A persistent write is always scheduled. Returns whether the artifact
    /// was also admitted to the in-memory tier.
    pub fn put(&self, key: CellKey, artifact: A) -> bool {
        self.persist(&key, &artifact);
        self.admit(key, artifact, Instant::now())
    }

    /// Returns the in-memory artifact for `key`, refreshing its recency.
    /// Never touches the persistent tier.
    pub fn peek(&self, key: &CellKey) -> Option<A> {
        self.peek_fresh(key, None).map(|(artifact, _)| artifact)
    }

    /// Like [`peek`](Self::peek), but entries produced longer than `max_age`
    /// ago count as a miss. Returns the artifact with its production time.
    pub(crate) fn peek_fresh(
        &self,
        key: &CellKey,
        max_age: Option<Duration>,
    ) -> Option<(A, Instant)> {
        let now = Instant::now();
        let hit = {
            let mut state = self.lock();
            let fresh = state.produced_at(key).is_some_and(|produced_at| {
                max_age.is_none_or(|age| now.saturating_duration_since(produced_at) < age)
            });
            if fresh {
                state
                    .touch(key, now)
                    .map(|entry| (entry.artifact.clone(), entry.produced_at))
            } else {
                None
            }
        };
        let counter = if hit.is_some() {
            &self.inner.counters.memory_hits
        } else {
            &self.inner.counters.memory_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        hit
    }

    /// Whether `key` is held in memory. Does not count as an access.
    pub fn in_memory(&self, key: &CellKey) -> bool {
        self.lock().contains(key)
    }

    /// Returns the artifact for `key` from memory, or from the persistent
    /// tier, promoting a persistent hit into memory.
    ///
    /// Concurrent misses for the same key share one persistent read. A
    /// persisted entry that fails to decode is deleted and reported as
    /// absent.
    pub async fn get(&self, key: &CellKey) -> Option<A> {
        self.get_fresh(key, None).await.map(|(artifact, _)| artifact)
    }

    /// Like [`get`](Self::get), but artifacts older than `max_age` in
    /// either tier count as a miss. Stale persisted entries are left in
    /// place for their own time-to-live to remove.
    ///
    /// Returns the artifact with its production time. A promoted artifact
    /// keeps the age it had on disk, so its time-to-live does not restart.
    pub(crate) async fn get_fresh(
        &self,
        key: &CellKey,
        max_age: Option<Duration>,
    ) -> Option<(A, Instant)> {
        if let Some(hit) = self.peek_fresh(key, max_age) {
            return Some(hit);
        }
        self.inner.persistent.as_ref()?;

        let disk_key = DiskKey::from_cell(key);
        let Some(raw) = self.read_persisted(disk_key.clone()).await else {
            self.inner.counters.disk_misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match self.inner.config.store.format.decode::<A>(&disk_key, &raw) {
            Ok(decoded) if !is_fresh(decoded.written_at, max_age) => {
                self.inner.counters.disk_misses.fetch_add(1, Ordering::Relaxed);
                debug!(%key, written_at = ?decoded.written_at, "persisted artifact too old");
                None
            }
            Ok(decoded) => {
                self.inner.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
                let produced_at = produced_at(decoded.written_at);
                let cached = self.admit(key.clone(), decoded.artifact.clone(), produced_at);
                debug!(%key, cached, written_at = ?decoded.written_at, "promoted persisted artifact");
                Some((decoded.artifact, produced_at))
            }
            Err(error) => {
                self.inner.counters.corrupt_entries.fetch_add(1, Ordering::Relaxed);
                warn!(%key, %error, "discarding corrupt persisted entry");
                self.delete_persisted(disk_key);
                None
            }
        }
    }

    /// Removes `key` from memory and schedules a persistent delete.
    /// Returns whether it was held in memory.
    pub fn remove(&self, key: &CellKey) -> bool {
        let removed = {
            let mut state = self.lock();
            let removed = state.remove(key).is_some();
            metrics::record_occupancy(state.len(), state.total_bytes());
            removed
        };
        self.delete_persisted(DiskKey::from_cell(key));
        removed
    }

    /// Removes every in-memory entry matching `predicate` and schedules a
    /// persistent delete for each. Returns the removed keys.
    pub fn remove_where(&self, predicate: impl FnMut(&CellKey) -> bool) -> Vec<CellKey> {
        let removed = {
            let mut state = self.lock();
            let removed = state.remove_where(predicate);
            metrics::record_occupancy(state.len(), state.total_bytes());
            removed
        };
        for key in &removed {
            self.delete_persisted(DiskKey::from_cell(key));
        }
        removed
    }

    /// Removes every in-memory entry matching `predicate`, leaving the
    /// persistent tier untouched. Returns the number removed.
    pub fn forget_where(&self, predicate: impl FnMut(&CellKey) -> bool) -> usize {
        let mut state = self.lock();
        let removed = state.remove_where(predicate).len();
        metrics::record_occupancy(state.len(), state.total_bytes());
        removed
    }

    /// Drops the whole in-memory tier. The persistent tier is untouched.
    /// Returns the number of entries dropped.
    pub fn clear_all(&self) -> usize {
        let removed = self.lock().clear();
        metrics::record_occupancy(0, 0);
        debug!(removed, "cleared in-memory tier");
        removed
    }

    /// Point-in-time counters and occupancy.
    pub fn stats_summary(&self) -> StoreStats {
        let (entries, bytes, evictions) = {
            let state = self.lock();
            (state.len(), state.total_bytes(), state.evictions)
        };
        let c = &self.inner.counters;
        StoreStats {
            entries,
            bytes,
            effective_budget: self.effective_budget(),
            nominal_budget: self.inner.config.store.max_bytes,
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            memory_misses: c.memory_misses.load(Ordering::Relaxed),
            disk_hits: c.disk_hits.load(Ordering::Relaxed),
            disk_misses: c.disk_misses.load(Ordering::Relaxed),
            admitted: c.admitted.load(Ordering::Relaxed),
            gate_rejections: c.gate_rejections.load(Ordering::Relaxed),
            budget_rejections: c.budget_rejections.load(Ordering::Relaxed),
            evictions,
            emergencies: c.emergencies.load(Ordering::Relaxed),
            corrupt_entries: c.corrupt_entries.load(Ordering::Relaxed),
            disk_errors: c.disk_errors.load(Ordering::Relaxed),
        }
    }

    fn admit(&self, key: CellKey, artifact: A, produced_at: Instant) -> bool {
        let inner = &*self.inner;
        let size = artifact.size_hint();

        if let Some(gate) = &inner.gate {
            let admission = gate.admit(size);
            if !admission.accepted {
                inner.counters.gate_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(%key, utilization = admission.utilization, "accelerator gate refused artifact");
                // An older copy would now be stale.
                self.lock().remove(&key);
                return false;
            }
        }

        let now = Instant::now();
        let budget = self.effective_budget();
        let store = &inner.config.store;
        let policy = inner.config.kind_policy(key.kind());

        let (admitted, emergency) = {
            let mut state = self.lock();
            state.remove(&key);
            let emergency = self.check_emergency(&mut state, now);

            let aggressive_target = (budget as f64 * store.aggressive_ratio) as usize;
            if state.total_bytes() > aggressive_target {
                state.shrink_to(
                    aggressive_target,
                    inner.grace,
                    now,
                    store.aggressive_batch,
                    Reason::Aggressive,
                );
            }

            let admitted = size <= budget && {
                let target = budget - size;
                if state.total_bytes() > target {
                    state.shrink_to(target, inner.grace, now, usize::MAX, Reason::Capacity);
                }
                state.make_room_in_kind(key.kind(), policy.max_entries, inner.grace, now);
                state.total_bytes() <= target && state.kind_len(key.kind()) < policy.max_entries
            };

            if admitted {
                let group = inner.ledger.ensure_group(
                    key.kind().as_str(),
                    policy.max_entries,
                    policy.approx_bytes,
                );
                state.insert(key.clone(), artifact, size, now, produced_at, group);
            }
            metrics::record_occupancy(state.len(), state.total_bytes());
            (admitted, emergency)
        };

        if admitted {
            inner.counters.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.counters.budget_rejections.fetch_add(1, Ordering::Relaxed);
            debug!(%key, size, budget, "no room for artifact in memory");
        }

        if emergency {
            let trimmed = inner.ledger.request_eviction(store.emergency_fraction);
            debug!(trimmed, "external cache groups trimmed");
        }
        admitted
    }

    fn check_emergency(&self, state: &mut StoreState<A>, now: Instant) -> bool {
        let store = &self.inner.config.store;
        let pressure = self.inner.feedback.memory_pressure();
        if pressure < store.emergency_ratio {
            return false;
        }
        if state
            .last_emergency
            .is_some_and(|at| now.saturating_duration_since(at) < store.emergency_cooldown)
        {
            return false;
        }
        state.last_emergency = Some(now);
        let removed = state.evict_fraction(store.emergency_fraction, self.inner.grace, now);
        self.inner.counters.emergencies.fetch_add(1, Ordering::Relaxed);
        warn!(pressure, removed, "memory pressure emergency eviction");
        true
    }

    fn persist(&self, key: &CellKey, artifact: &A) {
        let Some(persistent) = self.inner.persistent.clone() else {
            return;
        };
        let disk_key = DiskKey::from_cell(key);
        let raw = match self.inner.config.store.format.encode(&disk_key, artifact) {
            Ok(raw) => raw,
            Err(error) => {
                self.inner.counters.disk_errors.fetch_add(1, Ordering::Relaxed);
                warn!(%key, %error, "failed to encode artifact");
                return;
            }
        };
        let ttl = self.inner.config.store.disk_ttl;
        let counters = self.inner.counters.clone();

        self.inner.io.spawn("write", async move {
            match persistent.write(&disk_key, raw, Some(ttl)).await {
                Ok(()) => metrics::record_disk("write", true),
                Err(error) => {
                    counters.disk_errors.fetch_add(1, Ordering::Relaxed);
                    metrics::record_disk("write", false);
                    warn!(key = %disk_key, %error, "persistent write failed");
                }
            }
        });
    }

    fn delete_persisted(&self, disk_key: DiskKey) {
        let Some(persistent) = self.inner.persistent.clone() else {
            return;
        };
        let counters = self.inner.counters.clone();

        self.inner.io.spawn("remove", async move {
            match persistent.remove(&disk_key).await {
                Ok(status) => {
                    metrics::record_disk("remove", true);
                    debug!(key = %disk_key, ?status, "persistent delete");
                }
                Err(error) => {
                    counters.disk_errors.fetch_add(1, Ordering::Relaxed);
                    metrics::record_disk("remove", false);
                    warn!(key = %disk_key, %error, "persistent delete failed");
                }
            }
        });
    }

    /// Reads `disk_key`, joining a read already in flight for it.
    /// I/O failures are logged and read as a miss.
    async fn read_persisted(&self, disk_key: DiskKey) -> Option<Raw> {
        let persistent = self.inner.persistent.clone()?;

        let (read, sender) = match self.inner.pending_reads.entry(disk_key.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), None),
            Entry::Vacant(entry) => {
                let (sender, receiver) = oneshot::channel();
                let read = async move { receiver.await.ok().flatten() }.boxed().shared();
                entry.insert(read.clone());
                (read, Some(sender))
            }
        };

        if let Some(sender) = sender {
            let pending = PendingReadGuard {
                pending: self.inner.pending_reads.clone(),
                key: disk_key.clone(),
            };
            let counters = self.inner.counters.clone();
            self.inner.io.spawn("read", async move {
                let raw = match persistent.read(&disk_key).await {
                    Ok(raw) => {
                        metrics::record_disk("read", true);
                        raw
                    }
                    Err(error) => {
                        counters.disk_errors.fetch_add(1, Ordering::Relaxed);
                        metrics::record_disk("read", false);
                        warn!(key = %disk_key, %error, "persistent read failed");
                        None
                    }
                };
                drop(pending);
                let _ = sender.send(raw);
            });
        }

        read.await
    }
}

/// Unregisters a shared read once its task ends, even if the task is
/// dropped before finishing. Later misses then start a new read.
struct PendingReadGuard {
    pending: Arc<DashMap<DiskKey, PendingRead>>,
    key: DiskKey,
}

impl Drop for PendingReadGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

/// Maps a wall-clock write time onto the monotonic clock. Unknown or
/// future write times count as now.
fn produced_at(written_at: Option<DateTime<Utc>>) -> Instant {
    let now = Instant::now();
    written_at
        .and_then(|at| Utc::now().signed_duration_since(at).to_std().ok())
        .and_then(|age| now.checked_sub(age))
        .unwrap_or(now)
}

fn is_fresh(written_at: Option<DateTime<Utc>>, max_age: Option<Duration>) -> bool {
    match (written_at, max_age) {
        (Some(written_at), Some(max_age)) => Utc::now()
            .signed_duration_since(written_at)
            .to_std()
            .map(|age| age < max_age)
            .unwrap_or(true),
        _ => true,
    }
}

/// Builder for [`TieredStore`].
pub struct TieredStoreBuilder<A> {
    config: EngineConfig,
    feedback: Arc<dyn HostFeedback>,
    gate: Option<Arc<dyn AcceleratorGate>>,
    persistent: Option<Arc<dyn PersistentStore>>,
    ledger: BudgetLedger,
    runtime: Option<Handle>,
    _artifact: PhantomData<fn() -> A>,
}

impl<A> Default for TieredStoreBuilder<A> {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            feedback: Arc::new(IdleHost),
            gate: None,
            persistent: None,
            ledger: BudgetLedger::new(),
            runtime: None,
            _artifact: PhantomData,
        }
    }
}

impl<A: Artifact> TieredStoreBuilder<A> {
    /// Uses the store, limiter-load and kind settings of `config`. It is
    /// clamped on build.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Source of host load and memory pressure.
    pub fn feedback(mut self, feedback: Arc<dyn HostFeedback>) -> Self {
        self.feedback = feedback;
        self
    }

    /// Capacity check consulted before in-memory admission.
    pub fn gate(mut self, gate: Arc<dyn AcceleratorGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Persistent tier behind memory.
    pub fn persistent(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.persistent = Some(store);
        self
    }

    /// Ledger receiving per-kind usage and emergency trim requests.
    pub fn ledger(mut self, ledger: BudgetLedger) -> Self {
        self.ledger = ledger;
        self
    }

    /// Runtime running persistent-tier operations. Defaults to the current
    /// runtime.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Builds the store.
    pub fn build(self) -> Result<TieredStore<A>, BuildError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()?,
        };
        let config = self.config.clamped();
        let grace = Grace {
            insert: config.store.insert_grace,
            access: config.store.access_grace,
        };
        let io = IoPool::new(runtime, config.store.io_concurrency);

        Ok(TieredStore {
            inner: Arc::new(StoreInner {
                grace,
                state: Mutex::new(StoreState::default()),
                persistent: self.persistent,
                io,
                pending_reads: Arc::new(DashMap::new()),
                feedback: self.feedback,
                gate: self.gate,
                ledger: self.ledger,
                counters: Arc::new(Counters::default()),
                config,
            }),
        })
    }
}
