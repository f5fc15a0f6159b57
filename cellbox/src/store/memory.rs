//! In-memory tier bookkeeping.
//!
//! All fields are mutated under the store's single lock. Entries live in an
//! unbounded [`LruCache`]; the byte budget and kind caps decide what leaves,
//! the cache only keeps the order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use cellbox_core::{CellKey, Kind};
use lru::LruCache;
use tokio::time::Instant;

use crate::ledger::CacheGroup;

/// An artifact held in memory.
#[derive(Debug)]
pub(super) struct Stored<A> {
    pub(super) artifact: A,
    pub(super) size: usize,
    /// Admission time; drives the insert grace window.
    pub(super) inserted_at: Instant,
    /// When the artifact was produced. Earlier than `inserted_at` for
    /// artifacts promoted from the persistent tier.
    pub(super) produced_at: Instant,
    pub(super) last_access: Option<Instant>,
}

/// Grace windows making fresh entries immune to capacity eviction.
#[derive(Debug, Clone, Copy)]
pub(super) struct Grace {
    pub(super) insert: Duration,
    pub(super) access: Duration,
}

impl Grace {
    fn protects<A>(&self, entry: &Stored<A>, now: Instant) -> bool {
        now.saturating_duration_since(entry.inserted_at) < self.insert
            || entry
                .last_access
                .is_some_and(|at| now.saturating_duration_since(at) < self.access)
    }
}

/// Eviction counters by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionCounts {
    /// LRU evictions to fit a new entry in the byte budget.
    pub capacity: u64,
    /// Evictions by the bounded cleanup above the aggressive ratio.
    pub aggressive: u64,
    /// Evictions enforcing a kind's entry cap.
    pub kind_cap: u64,
    /// Evictions by the emergency watchdog.
    pub emergency: u64,
}

impl EvictionCounts {
    /// Sum over all reasons.
    pub fn total(&self) -> u64 {
        self.capacity + self.aggressive + self.kind_cap + self.emergency
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) enum Reason {
    Capacity,
    Aggressive,
    KindCap,
    Emergency,
}

impl Reason {
    fn label(self) -> &'static str {
        match self {
            Reason::Capacity => "capacity",
            Reason::Aggressive => "aggressive",
            Reason::KindCap => "kind_cap",
            Reason::Emergency => "emergency",
        }
    }
}

#[derive(Debug)]
pub(super) struct StoreState<A> {
    entries: LruCache<CellKey, Stored<A>>,
    per_kind: HashMap<Kind, usize>,
    groups: HashMap<Kind, Arc<CacheGroup>>,
    total_bytes: usize,
    pub(super) last_emergency: Option<Instant>,
    pub(super) evictions: EvictionCounts,
}

impl<A> Default for StoreState<A> {
    fn default() -> Self {
        Self {
            entries: LruCache::unbounded(),
            per_kind: HashMap::new(),
            groups: HashMap::new(),
            total_bytes: 0,
            last_emergency: None,
            evictions: EvictionCounts::default(),
        }
    }
}

impl<A> StoreState<A> {
    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(super) fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub(super) fn kind_len(&self, kind: &Kind) -> usize {
        self.per_kind.get(kind).copied().unwrap_or(0)
    }

    /// Production time of the entry, without touching its recency.
    pub(super) fn produced_at(&self, key: &CellKey) -> Option<Instant> {
        self.entries.peek(key).map(|entry| entry.produced_at)
    }

    pub(super) fn contains(&self, key: &CellKey) -> bool {
        self.entries.contains(key)
    }

    /// Returns the entry and marks it most recently used.
    pub(super) fn touch(&mut self, key: &CellKey, now: Instant) -> Option<&Stored<A>> {
        let entry = self.entries.get_mut(key)?;
        entry.last_access = Some(now);
        if let Some(group) = self.groups.get(key.kind()) {
            group.record_access();
        }
        Some(&*entry)
    }

    pub(super) fn insert(
        &mut self,
        key: CellKey,
        artifact: A,
        size: usize,
        now: Instant,
        produced_at: Instant,
        group: Arc<CacheGroup>,
    ) {
        self.remove(&key);
        *self.per_kind.entry(key.kind().clone()).or_default() += 1;
        self.total_bytes += size;
        group.record_put(Some(size));
        self.groups.entry(key.kind().clone()).or_insert(group);
        self.entries.put(
            key,
            Stored {
                artifact,
                size,
                inserted_at: now,
                produced_at: produced_at.min(now),
                last_access: None,
            },
        );
    }

    pub(super) fn remove(&mut self, key: &CellKey) -> Option<Stored<A>> {
        let entry = self.entries.pop(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        if let Some(count) = self.per_kind.get_mut(key.kind()) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_kind.remove(key.kind());
            }
        }
        if let Some(group) = self.groups.get(key.kind()) {
            group.record_remove(Some(entry.size));
        }
        Some(entry)
    }

    /// Drops every entry and resets the groups this store feeds.
    pub(super) fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.per_kind.clear();
        self.total_bytes = 0;
        for group in self.groups.values() {
            group.clear();
        }
        removed
    }

    /// Number of entries outside both grace windows.
    pub(super) fn unprotected_len(&self, grace: Grace, now: Instant) -> usize {
        self.entries
            .iter()
            .filter(|(_, entry)| !grace.protects(*entry, now))
            .count()
    }

    /// Walks entries oldest-access-first, skipping grace-protected ones and,
    /// if `kind` is set, entries of other kinds. Stops as soon as `enough`
    /// returns true for the bytes and count selected so far, or after
    /// `limit` victims.
    fn select_victims(
        &self,
        grace: Grace,
        now: Instant,
        kind: Option<&Kind>,
        limit: usize,
        mut enough: impl FnMut(usize, usize) -> bool,
    ) -> Vec<CellKey> {
        let mut victims = Vec::new();
        let mut freed = 0;
        // Least recently used first.
        for (key, entry) in self.entries.iter().rev() {
            if victims.len() >= limit || enough(freed, victims.len()) {
                break;
            }
            if kind.is_some_and(|kind| key.kind() != kind) {
                continue;
            }
            if grace.protects(entry, now) {
                continue;
            }
            freed += entry.size;
            victims.push(key.clone());
        }
        victims
    }

    fn evict(&mut self, victims: Vec<CellKey>, reason: Reason) -> usize {
        let mut removed = 0;
        for key in victims {
            if self.remove(&key).is_some() {
                removed += 1;
            }
        }
        let counter = match reason {
            Reason::Capacity => &mut self.evictions.capacity,
            Reason::Aggressive => &mut self.evictions.aggressive,
            Reason::KindCap => &mut self.evictions.kind_cap,
            Reason::Emergency => &mut self.evictions.emergency,
        };
        *counter += removed as u64;
        crate::metrics::record_evictions(reason.label(), removed);
        removed
    }

    /// Evicts up to `limit` unprotected entries, oldest first, until total
    /// bytes are at or below `target`.
    pub(super) fn shrink_to(
        &mut self,
        target: usize,
        grace: Grace,
        now: Instant,
        limit: usize,
        reason: Reason,
    ) -> usize {
        let excess = self.total_bytes.saturating_sub(target);
        if excess == 0 {
            return 0;
        }
        let victims = self.select_victims(grace, now, None, limit, |freed, _| freed >= excess);
        self.evict(victims, reason)
    }

    /// Evicts unprotected entries of `kind` until fewer than `max_entries`
    /// remain.
    pub(super) fn make_room_in_kind(
        &mut self,
        kind: &Kind,
        max_entries: usize,
        grace: Grace,
        now: Instant,
    ) -> usize {
        let excess = (self.kind_len(kind) + 1).saturating_sub(max_entries);
        if excess == 0 {
            return 0;
        }
        let victims =
            self.select_victims(grace, now, Some(kind), excess, |_, count| count >= excess);
        self.evict(victims, Reason::KindCap)
    }

    /// Evicts `fraction` of the unprotected entries, oldest first.
    pub(super) fn evict_fraction(&mut self, fraction: f64, grace: Grace, now: Instant) -> usize {
        let target = (self.unprotected_len(grace, now) as f64 * fraction).ceil() as usize;
        if target == 0 {
            return 0;
        }
        let victims = self.select_victims(grace, now, None, target, |_, count| count >= target);
        self.evict(victims, Reason::Emergency)
    }

    /// Removes every entry matching `predicate`. Returns the removed keys.
    pub(super) fn remove_where(
        &mut self,
        mut predicate: impl FnMut(&CellKey) -> bool,
    ) -> Vec<CellKey> {
        let keys: Vec<CellKey> = self
            .entries
            .iter()
            .map(|(key, _)| key)
            .filter(|key| predicate(*key))
            .cloned()
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys
    }
}
