//! Per-group budget accounting.
//!
//! Every cache that wants to take part in coordinated trimming registers a
//! [`CacheGroup`] with the shared [`BudgetLedger`]. The tiered store keeps
//! one tracking-only group per artifact kind; unrelated caches in the
//! embedding application can register groups carrying an eviction callback
//! so a single pressure signal trims them all.
//!
//! Groups are independent. The ledger never moves budget between them and
//! makes no fairness promise across groups.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use smol_str::SmolStr;
use tracing::debug;

/// Callback trimming a registered cache by a fraction in `0.0..=1.0`.
/// Returns the number of entries it removed.
pub type EvictionCallback = Arc<dyn Fn(f64) -> usize + Send + Sync>;

/// One independently budgeted cache partition.
pub struct CacheGroup {
    name: SmolStr,
    max_entries: usize,
    approx_bytes_per_entry: usize,
    entries: AtomicUsize,
    bytes: AtomicUsize,
    accesses: AtomicU64,
    evict: Option<EvictionCallback>,
}

impl std::fmt::Debug for CacheGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheGroup")
            .field("name", &self.name)
            .field("max_entries", &self.max_entries)
            .field("entries", &self.entries)
            .field("bytes", &self.bytes)
            .field("evictable", &self.evict.is_some())
            .finish()
    }
}

impl CacheGroup {
    /// Creates a tracking-only group.
    pub fn new(name: impl Into<SmolStr>, max_entries: usize, approx_bytes_per_entry: usize) -> Self {
        Self {
            name: name.into(),
            max_entries,
            approx_bytes_per_entry,
            entries: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            accesses: AtomicU64::new(0),
            evict: None,
        }
    }

    /// Attaches the callback invoked by [`BudgetLedger::request_eviction`].
    pub fn with_eviction(mut self, callback: EvictionCallback) -> Self {
        self.evict = Some(callback);
        self
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured entry capacity.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Records a new entry of `bytes` bytes, or the configured estimate when
    /// `bytes` is `None`.
    pub fn record_put(&self, bytes: Option<usize>) {
        self.entries.fetch_add(1, Ordering::AcqRel);
        self.bytes
            .fetch_add(bytes.unwrap_or(self.approx_bytes_per_entry), Ordering::AcqRel);
    }

    /// Records removal of an entry previously recorded with `record_put`.
    pub fn record_remove(&self, bytes: Option<usize>) {
        let bytes = bytes.unwrap_or(self.approx_bytes_per_entry);
        let _ = self
            .entries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        let _ = self
            .bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(bytes))
            });
    }

    /// Records a read hit.
    pub fn record_access(&self) {
        self.accesses.fetch_add(1, Ordering::Relaxed);
    }

    /// Resets entry and byte counts to zero.
    pub fn clear(&self) {
        self.entries.store(0, Ordering::Release);
        self.bytes.store(0, Ordering::Release);
    }

    /// Whether the group is at or above its entry capacity.
    pub fn is_full(&self) -> bool {
        self.entries.load(Ordering::Acquire) >= self.max_entries
    }

    /// Point-in-time usage.
    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            name: self.name.clone(),
            entries: self.entries.load(Ordering::Acquire),
            max_entries: self.max_entries,
            bytes: self.bytes.load(Ordering::Acquire),
            accesses: self.accesses.load(Ordering::Relaxed),
        }
    }

    fn evict(&self, fraction: f64) -> usize {
        self.evict.as_ref().map_or(0, |callback| callback(fraction))
    }
}

/// Usage of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    /// Group name.
    pub name: SmolStr,
    /// Live entries.
    pub entries: usize,
    /// Configured capacity.
    pub max_entries: usize,
    /// Estimated bytes.
    pub bytes: usize,
    /// Recorded read hits.
    pub accesses: u64,
}

/// Registry of cache groups sharing one pressure signal.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone, Debug, Default)]
pub struct BudgetLedger {
    groups: Arc<DashMap<SmolStr, Arc<CacheGroup>>>,
}

impl BudgetLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `group`, replacing any group of the same name.
    pub fn register(&self, group: CacheGroup) -> Arc<CacheGroup> {
        let group = Arc::new(group);
        self.groups.insert(group.name.clone(), group.clone());
        group
    }

    /// Returns the group named `name`, creating a tracking-only group with
    /// the given budget if none exists.
    pub fn ensure_group(
        &self,
        name: &str,
        max_entries: usize,
        approx_bytes_per_entry: usize,
    ) -> Arc<CacheGroup> {
        self.groups
            .entry(SmolStr::new(name))
            .or_insert_with(|| Arc::new(CacheGroup::new(name, max_entries, approx_bytes_per_entry)))
            .clone()
    }

    /// Looks up a group.
    pub fn group(&self, name: &str) -> Option<Arc<CacheGroup>> {
        self.groups.get(name).map(|g| g.clone())
    }

    /// Removes a group from the registry.
    pub fn unregister(&self, name: &str) -> Option<Arc<CacheGroup>> {
        self.groups.remove(name).map(|(_, g)| g)
    }

    /// Asks every group with an eviction callback to drop `fraction` of its
    /// entries. Groups are trimmed concurrently. Returns the total removed.
    ///
    /// Must not be called while holding a lock a callback might take.
    pub fn request_eviction(&self, fraction: f64) -> usize {
        let fraction = fraction.clamp(0.0, 1.0);
        let targets: Vec<Arc<CacheGroup>> = self
            .groups
            .iter()
            .filter(|g| g.evict.is_some())
            .map(|g| g.value().clone())
            .collect();

        let removed = match targets.as_slice() {
            [] => 0,
            [group] => group.evict(fraction),
            groups => std::thread::scope(|scope| {
                let handles: Vec<_> = groups
                    .iter()
                    .map(|group| scope.spawn(move || group.evict(fraction)))
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or(0))
                    .sum()
            }),
        };

        debug!(groups = targets.len(), fraction, removed, "ledger eviction requested");
        removed
    }

    /// Resets every group's counters.
    pub fn clear(&self) {
        for group in self.groups.iter() {
            group.clear();
        }
    }

    /// Usage of every group, sorted by name.
    pub fn snapshot(&self) -> Vec<GroupSnapshot> {
        let mut groups: Vec<_> = self.groups.iter().map(|g| g.snapshot()).collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }
}
