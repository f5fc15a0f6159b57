//! Coalescing memoization cache.
//!
//! [`MemoCache`] owns the state machine of every key:
//!
//! ```text
//! Absent ──claim──> InFlight ──ok──> Ready ──ttl──> Absent
//!                       │
//!                       └──err──> Failed ──backoff──> Absent
//! ```
//!
//! A claim is installed atomically through the map's entry API, so at most
//! one computation per key is ever in flight. Requests arriving while a key
//! is claimed return immediately instead of scheduling a second run.
//!
//! Async requests are handed to the [`BatchQueue`]; the dispatched task
//! first consults the [`TieredStore`] (memory, then disk), then an optional
//! [`AlternateProducer`], and only then runs the producer on the blocking
//! pool. Sync requests compute on the caller's thread when the limiter has a
//! free slot and fall back to the async path otherwise.
//!
//! Expired entries are dropped lazily by a bounded prune pass that runs
//! every `prune_every` successful completions, not on a timer.
//!
//! `Ready` artifacts are tracked in a [`CacheGroup`] of their own in the
//! store's ledger, so an emergency eviction also drops the least recently
//! read memo entries.

mod entry;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use cellbox_core::{Artifact, CellKey, ContextId, Coord, ProducerContext};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use entry::EntryState;

use crate::batch::{BatchQueue, BatchTask};
use crate::config::EngineConfig;
use crate::error::{DispatchError, ProducerError};
use crate::ledger::{BudgetLedger, CacheGroup};
use crate::limiter::AdaptiveLimiter;
use crate::metrics::{self, MemoEvent};
use crate::store::TieredStore;
use entry::Entry;

/// Source of artifacts that can stand in for the producer, such as a
/// hardware-accelerated path. Consulted before the producer on the async
/// path.
pub trait AlternateProducer<C, A>: Send + Sync {
    /// Returns the artifact for `key`, or `None` to fall through to the
    /// producer.
    fn produce(&self, context: &C, key: &CellKey) -> Option<A>;
}

/// Outcome of [`MemoCache::request_async`].
#[derive(Debug, Clone, PartialEq)]
pub enum Requested<A> {
    /// A claim was installed and the computation queued.
    Scheduled,
    /// Another computation already holds the claim.
    InFlight,
    /// A fresh artifact was already available.
    Ready(A),
    /// The key failed recently and may not be retried before `retry_at`.
    BackingOff {
        /// Earliest retry.
        retry_at: Instant,
    },
}

/// Counters of a [`MemoCache`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoStats {
    /// Keys currently tracked, in any state.
    pub entries: usize,
    /// Estimated bytes of `Ready` artifacts.
    pub ready_bytes: usize,
    /// Lookups that found a fresh artifact.
    pub hits: u64,
    /// Lookups that found nothing usable.
    pub misses: u64,
    /// Lookups answered by promoting the store's memory tier.
    pub promotions: u64,
    /// Claims installed.
    pub claims: u64,
    /// Requests that joined an existing claim.
    pub coalesced: u64,
    /// Producer invocations.
    pub produced: u64,
    /// Artifacts supplied by the alternate producer.
    pub alternate: u64,
    /// Producer failures.
    pub failures: u64,
    /// Results dropped because their claim was invalidated.
    pub discarded: u64,
    /// Entries removed by prune passes.
    pub pruned: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    claims: AtomicU64,
    coalesced: AtomicU64,
    produced: AtomicU64,
    alternate: AtomicU64,
    failures: AtomicU64,
    discarded: AtomicU64,
    pruned: AtomicU64,
}

enum Claim<A> {
    Claimed(u64),
    InFlight,
    Ready(A),
    BackingOff(Instant),
}

enum Produced<A> {
    Producer(A),
    Alternate(A),
}

static NEXT_GROUP: AtomicU64 = AtomicU64::new(1);

struct MemoInner<C, A> {
    config: EngineConfig,
    entries: DashMap<CellKey, Entry<A>>,
    group: Arc<CacheGroup>,
    ledger: BudgetLedger,
    store: TieredStore<A>,
    batch: BatchQueue,
    limiter: AdaptiveLimiter,
    alternate: Option<Arc<dyn AlternateProducer<C, A>>>,
    next_claim: AtomicU64,
    puts: AtomicU64,
    prune_cursor: AtomicUsize,
    counters: Counters,
}

/// Per-key memoization with in-flight coalescing and failure backoff.
///
/// Cloning is cheap; clones share the same entries.
pub struct MemoCache<C, A> {
    inner: Arc<MemoInner<C, A>>,
}

impl<C, A> Clone for MemoCache<C, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C, A> std::fmt::Debug for MemoCache<C, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoCache")
            .field("entries", &self.inner.entries.len())
            .field("alternate", &self.inner.alternate.is_some())
            .finish()
    }
}

impl<C, A> MemoCache<C, A>
where
    C: ProducerContext,
    A: Artifact,
{
    /// Creates a cache mirroring results into `store` and scheduling work
    /// through `batch`. `config` is clamped first.
    ///
    /// Registers a budget group for `Ready` entries in the store's ledger;
    /// it is unregistered when the last clone is dropped.
    pub fn new(
        config: EngineConfig,
        store: TieredStore<A>,
        batch: BatchQueue,
        limiter: AdaptiveLimiter,
        alternate: Option<Arc<dyn AlternateProducer<C, A>>>,
    ) -> Self {
        let config = config.clamped();
        let ledger = store.ledger().clone();
        let name = format!("memo-{}", NEXT_GROUP.fetch_add(1, Ordering::Relaxed));
        let inner = Arc::new_cyclic(|weak: &Weak<MemoInner<C, A>>| {
            let weak = weak.clone();
            let evict = move |fraction: f64| {
                weak.upgrade()
                    .map_or(0, |inner| inner.evict_least_recent(fraction))
            };
            let group = ledger.register(
                CacheGroup::new(name, usize::MAX, 0).with_eviction(Arc::new(evict)),
            );
            MemoInner {
                config,
                entries: DashMap::new(),
                group,
                ledger,
                store,
                batch,
                limiter,
                alternate,
                next_claim: AtomicU64::new(1),
                puts: AtomicU64::new(0),
                prune_cursor: AtomicUsize::new(0),
                counters: Counters::default(),
            }
        });
        Self { inner }
    }

    /// Ledger group accounting for this cache's `Ready` entries.
    pub fn budget_group(&self) -> &Arc<CacheGroup> {
        &self.inner.group
    }

    fn ttl(&self, key: &CellKey) -> Duration {
        self.inner.config.kind_policy(key.kind()).ttl
    }

    /// Returns the artifact if `key` is `Ready` and fresh, refreshing its
    /// last access. On a miss, a fresh copy in the store's memory tier is
    /// promoted to `Ready`. Never blocks and never schedules work.
    pub fn get_if_ready(&self, key: &CellKey) -> Option<A> {
        let now = Instant::now();
        let ttl = self.ttl(key);

        if let Some(mut entry) = self.inner.entries.get_mut(key)
            && let Entry::Ready {
                artifact,
                inserted_at,
                last_access,
                ..
            } = &mut *entry
            && now.saturating_duration_since(*inserted_at) < ttl
        {
            *last_access = now;
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_memo(key.kind().as_str(), MemoEvent::Hit);
            return Some(artifact.clone());
        }

        match self.promote_from_store(key, now, ttl) {
            Some(artifact) => {
                self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_memo(key.kind().as_str(), MemoEvent::Hit);
                Some(artifact)
            }
            None => {
                self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_memo(key.kind().as_str(), MemoEvent::Miss);
                None
            }
        }
    }

    fn promote_from_store(&self, key: &CellKey, now: Instant, ttl: Duration) -> Option<A> {
        let (artifact, produced_at) = self.inner.store.peek_fresh(key, Some(ttl))?;
        let size_hint = artifact.size_hint();
        let ready = Entry::Ready {
            artifact: artifact.clone(),
            inserted_at: produced_at,
            last_access: now,
            size_hint,
        };
        match self.inner.entries.entry(key.clone()) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(ready);
                self.inner.group.record_put(Some(size_hint));
            }
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_stale(now, ttl) {
                    let old = occupied.insert(ready);
                    self.inner.untrack(&old);
                    self.inner.group.record_put(Some(size_hint));
                }
            }
        }
        self.inner.counters.promotions.fetch_add(1, Ordering::Relaxed);
        debug!(%key, "promoted artifact from store memory tier");
        Some(artifact)
    }

    /// Installs a claim unless the key is fresh, claimed or backing off.
    fn try_claim(&self, key: &CellKey) -> Claim<A> {
        let now = Instant::now();
        let ttl = self.ttl(key);
        let id = self.inner.next_claim.fetch_add(1, Ordering::Relaxed);
        let claim = Entry::InFlight {
            claim: id,
            since: now,
        };

        match self.inner.entries.entry(key.clone()) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(claim);
            }
            MapEntry::Occupied(mut occupied) => match occupied.get() {
                Entry::InFlight { since, .. } => {
                    self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    metrics::record_memo(key.kind().as_str(), MemoEvent::Coalesced);
                    debug!(
                        %key,
                        waited_ms = now.saturating_duration_since(*since).as_millis() as u64,
                        "joined in-flight claim"
                    );
                    return Claim::InFlight;
                }
                Entry::Ready {
                    artifact,
                    inserted_at,
                    ..
                } if now.saturating_duration_since(*inserted_at) < ttl => {
                    return Claim::Ready(artifact.clone());
                }
                Entry::Failed { retry_at } if now < *retry_at => {
                    return Claim::BackingOff(*retry_at);
                }
                _ => {
                    let old = occupied.insert(claim);
                    self.inner.untrack(&old);
                }
            },
        }

        self.inner.counters.claims.fetch_add(1, Ordering::Relaxed);
        metrics::record_memo(key.kind().as_str(), MemoEvent::Claim);
        debug!(%key, claim = id, "claimed key");
        Claim::Claimed(id)
    }

    /// Claims `key` and queues `producer` for it, returning immediately.
    ///
    /// Nothing is scheduled if the key is fresh, already claimed or still
    /// backing off from a failure. Safe to call from threads outside the
    /// runtime.
    pub fn request_async<P>(&self, context: &Arc<C>, key: CellKey, producer: P) -> Requested<A>
    where
        P: Fn(&C, &CellKey) -> Result<A, ProducerError> + Send + Sync + 'static,
    {
        match self.try_claim(&key) {
            Claim::Claimed(claim) => {
                let task = self.produce_task(context.clone(), key.clone(), claim, producer);
                self.inner.batch.enqueue(context.context_id(), key, task);
                Requested::Scheduled
            }
            Claim::InFlight => Requested::InFlight,
            Claim::Ready(artifact) => Requested::Ready(artifact),
            Claim::BackingOff(retry_at) => Requested::BackingOff { retry_at },
        }
    }

    /// Computes `key` on the calling thread if a limiter slot is free right
    /// now, otherwise degrades to [`request_async`](Self::request_async) and
    /// returns `None`.
    ///
    /// Returns `None` as well when another computation holds the claim or
    /// the key is backing off. Producer errors are logged, never returned.
    pub fn request_sync<P>(&self, context: &Arc<C>, key: CellKey, producer: P) -> Option<A>
    where
        P: Fn(&C, &CellKey) -> Result<A, ProducerError> + Send + Sync + 'static,
    {
        if let Some(artifact) = self.get_if_ready(&key) {
            return Some(artifact);
        }
        let Some(permit) = self.inner.limiter.try_enter() else {
            debug!(%key, "no free slot, computing asynchronously");
            self.request_async(context, key, producer);
            return None;
        };

        let claim = match self.try_claim(&key) {
            Claim::Claimed(claim) => claim,
            Claim::Ready(artifact) => return Some(artifact),
            Claim::InFlight | Claim::BackingOff(_) => return None,
        };

        let mut guard = ClaimGuard {
            inner: &self.inner,
            key: &key,
            claim,
            armed: true,
        };
        let started = Instant::now();
        self.inner.counters.produced.fetch_add(1, Ordering::Relaxed);
        let result = producer(&**context, &key);
        permit.release();
        guard.armed = false;

        match result {
            Ok(artifact) => {
                self.inner.limiter.record_duration(started.elapsed());
                self.inner
                    .complete(&key, claim, artifact.clone(), Instant::now(), true);
                Some(artifact)
            }
            Err(error) => {
                warn!(%key, %error, "producer failed");
                self.inner.fail(&key, claim);
                None
            }
        }
    }

    fn produce_task<P>(&self, context: Arc<C>, key: CellKey, claim: u64, producer: P) -> BatchTask
    where
        P: Fn(&C, &CellKey) -> Result<A, ProducerError> + Send + Sync + 'static,
    {
        let inner = self.inner.clone();
        async move {
            let ttl = inner.config.kind_policy(key.kind()).ttl;
            if let Some((artifact, produced_at)) = inner.store.get_fresh(&key, Some(ttl)).await {
                debug!(%key, "served from store");
                inner.complete(&key, claim, artifact, produced_at, false);
                return Ok(());
            }

            let alternate = inner.alternate.clone();
            let task_key = key.clone();
            let started = Instant::now();
            let joined = tokio::task::spawn_blocking(move || {
                if let Some(artifact) = alternate
                    .as_ref()
                    .and_then(|alternate| alternate.produce(&*context, &task_key))
                {
                    return Ok(Produced::Alternate(artifact));
                }
                producer(&*context, &task_key).map(Produced::Producer)
            })
            .await;

            match joined {
                Ok(Ok(Produced::Producer(artifact))) => {
                    inner.counters.produced.fetch_add(1, Ordering::Relaxed);
                    inner.limiter.record_duration(started.elapsed());
                    inner.complete(&key, claim, artifact, Instant::now(), true);
                    Ok(())
                }
                Ok(Ok(Produced::Alternate(artifact))) => {
                    inner.counters.alternate.fetch_add(1, Ordering::Relaxed);
                    inner.complete(&key, claim, artifact, Instant::now(), true);
                    Ok(())
                }
                Ok(Err(source)) => {
                    inner.counters.produced.fetch_add(1, Ordering::Relaxed);
                    inner.fail(&key, claim);
                    Err(DispatchError::Producer { key, source })
                }
                Err(source) => {
                    inner.fail(&key, claim);
                    Err(DispatchError::Join { key, source })
                }
            }
        }
        .boxed()
    }

    /// Drops `key` from the cache and the store, scheduling a persistent
    /// delete. A computation in flight for it finishes but its result is
    /// discarded. Returns whether the cache tracked the key.
    pub fn invalidate(&self, key: &CellKey) -> bool {
        let removed = self.inner.entries.remove(key);
        if let Some((_, old)) = &removed {
            self.inner.untrack(old);
        }
        self.inner.store.remove(key);
        removed.is_some()
    }

    /// Drops every key of `context` whose coordinate lies in the
    /// `width` x `depth` rectangle starting at `origin`, from the cache and
    /// the store. Returns the number of cache entries removed.
    pub fn invalidate_area(&self, context: ContextId, origin: &Coord, width: u32, depth: u32) -> usize {
        let in_area =
            |key: &CellKey| key.context() == context && key.coord().within(origin, width, depth);

        let tracked: Vec<CellKey> = self
            .inner
            .entries
            .iter()
            .filter(|entry| in_area(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        let removed = tracked
            .iter()
            .filter_map(|key| self.inner.entries.remove(key))
            .inspect(|(_, old)| self.inner.untrack(old))
            .count();

        let dropped = self.inner.store.remove_where(in_area);
        // Keys only on disk still need their persistent copy deleted.
        for key in tracked.iter().filter(|key| !dropped.contains(key)) {
            self.inner.store.remove(key);
        }
        debug!(
            %context,
            %origin,
            width,
            depth,
            removed,
            store_removed = dropped.len(),
            "invalidated area"
        );
        removed
    }

    /// Drops every entry owned by `context` from the cache and from the
    /// store's memory tier. Persisted artifacts stay available to a future
    /// context of the same namespace.
    pub fn forget_context(&self, context: ContextId) -> usize {
        let before = self.inner.entries.len();
        self.inner.entries.retain(|key, entry| {
            let keep = key.context() != context;
            if !keep {
                self.inner.untrack(entry);
            }
            keep
        });
        let removed = before.saturating_sub(self.inner.entries.len());
        let forgotten = self.inner.store.forget_where(|key| key.context() == context);
        debug!(%context, removed, forgotten, "forgot context");
        removed
    }

    /// Drops every entry, including in-flight claims.
    pub fn clear(&self) {
        self.inner.entries.clear();
        self.inner.group.clear();
    }

    /// Current state of `key`.
    pub fn state(&self, key: &CellKey) -> EntryState {
        let now = Instant::now();
        self.inner
            .entries
            .get(key)
            .map_or(EntryState::Absent, |entry| entry.state(now, self.ttl(key)))
    }

    /// When `key` was last read through [`get_if_ready`](Self::get_if_ready)
    /// or produced, if it is `Ready`.
    pub fn last_access(&self, key: &CellKey) -> Option<Instant> {
        match &*self.inner.entries.get(key)? {
            Entry::Ready { last_access, .. } => Some(*last_access),
            _ => None,
        }
    }

    /// Runs one bounded prune pass now. Returns the number of entries
    /// removed.
    pub fn prune(&self) -> usize {
        self.inner.prune()
    }

    /// Counters and occupancy.
    pub fn stats(&self) -> MemoStats {
        let (entries, ready_bytes) = self.inner.entries.iter().fold((0, 0), |(n, bytes), e| {
            let size = match e.value() {
                Entry::Ready { size_hint, .. } => *size_hint,
                _ => 0,
            };
            (n + 1, bytes + size)
        });
        let c = &self.inner.counters;
        MemoStats {
            entries,
            ready_bytes,
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            promotions: c.promotions.load(Ordering::Relaxed),
            claims: c.claims.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            produced: c.produced.load(Ordering::Relaxed),
            alternate: c.alternate.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            pruned: c.pruned.load(Ordering::Relaxed),
        }
    }
}

impl<C, A: Artifact> MemoInner<C, A> {
    /// Installs `Ready` if `claim` still owns `key`, mirroring the artifact
    /// into the store when `persist` is set. The time-to-live counts from
    /// `produced_at`.
    fn complete(
        &self,
        key: &CellKey,
        claim: u64,
        artifact: A,
        produced_at: Instant,
        persist: bool,
    ) {
        let now = Instant::now();
        let installed = match self.entries.get_mut(key) {
            Some(mut entry) if entry.holds_claim(claim) => {
                let size_hint = artifact.size_hint();
                *entry = Entry::Ready {
                    size_hint,
                    artifact: artifact.clone(),
                    inserted_at: produced_at.min(now),
                    last_access: now,
                };
                self.group.record_put(Some(size_hint));
                true
            }
            _ => false,
        };

        if !installed {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(%key, claim, "claim superseded, discarding result");
            return;
        }
        if persist {
            self.store.put(key.clone(), artifact);
        }

        let puts = self.puts.fetch_add(1, Ordering::Relaxed) + 1;
        if puts.is_multiple_of(self.config.memo.prune_every.max(1)) {
            self.prune();
        }
    }

    /// Installs `Failed` if `claim` still owns `key`.
    fn fail(&self, key: &CellKey, claim: u64) {
        let retry_at = Instant::now() + self.config.memo.failure_backoff;
        if let Some(mut entry) = self.entries.get_mut(key)
            && entry.holds_claim(claim)
        {
            *entry = Entry::Failed { retry_at };
        }
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        metrics::record_memo(key.kind().as_str(), MemoEvent::Failure);
    }

    fn prune(&self) -> usize {
        let now = Instant::now();
        let batch = self.config.memo.prune_batch;
        let cursor = self.prune_cursor.load(Ordering::Relaxed);

        let (scanned, stale) = {
            let mut scanned = 0;
            let mut stale = Vec::new();
            for entry in self.entries.iter().skip(cursor).take(batch) {
                scanned += 1;
                let ttl = self.config.kind_policy(entry.key().kind()).ttl;
                if entry.value().is_stale(now, ttl) {
                    stale.push(entry.key().clone());
                }
            }
            (scanned, stale)
        };
        let next = if scanned < batch { 0 } else { cursor + scanned };
        self.prune_cursor.store(next, Ordering::Relaxed);

        let mut removed = 0;
        for key in stale {
            let ttl = self.config.kind_policy(key.kind()).ttl;
            if let Some((_, old)) = self
                .entries
                .remove_if(&key, |_, entry| entry.is_stale(now, ttl))
            {
                self.untrack(&old);
                removed += 1;
            }
        }
        if removed > 0 {
            self.counters.pruned.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, scanned, "pruned expired entries");
        }
        removed
    }
}

impl<C, A> MemoInner<C, A> {
    /// Takes a removed or replaced entry out of the budget group.
    fn untrack(&self, entry: &Entry<A>) {
        if let Some(size) = entry.ready_size() {
            self.group.record_remove(Some(size));
        }
    }

    /// Drops `fraction` of the `Ready` entries, least recently read first.
    /// Claims and failures are left alone.
    fn evict_least_recent(&self, fraction: f64) -> usize {
        let mut ready: Vec<(Instant, CellKey)> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.value() {
                Entry::Ready { last_access, .. } => Some((*last_access, entry.key().clone())),
                _ => None,
            })
            .collect();
        let target = (ready.len() as f64 * fraction).ceil() as usize;
        if target == 0 {
            return 0;
        }
        ready.sort_unstable_by_key(|(last_access, _)| *last_access);

        let mut removed = 0;
        for (_, key) in ready.into_iter().take(target) {
            if let Some((_, old)) = self
                .entries
                .remove_if(&key, |_, entry| matches!(entry, Entry::Ready { .. }))
            {
                self.untrack(&old);
                removed += 1;
            }
        }
        debug!(group = self.group.name(), removed, fraction, "evicted memo entries");
        removed
    }
}

impl<C, A> Drop for MemoInner<C, A> {
    fn drop(&mut self) {
        self.ledger.unregister(self.group.name());
    }
}

/// Marks a sync claim failed if the producer unwinds.
struct ClaimGuard<'a, C, A: Artifact> {
    inner: &'a MemoInner<C, A>,
    key: &'a CellKey,
    claim: u64,
    armed: bool,
}

impl<C, A: Artifact> Drop for ClaimGuard<'_, C, A> {
    fn drop(&mut self) {
        if self.armed {
            warn!(key = %self.key, "producer panicked");
            self.inner.fail(self.key, self.claim);
        }
    }
}
