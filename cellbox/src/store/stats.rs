use std::fmt;

use super::memory::EvictionCounts;

/// Point-in-time summary of a [`TieredStore`](super::TieredStore).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    /// Entries held in memory.
    pub entries: usize,
    /// Estimated bytes held in memory.
    pub bytes: usize,
    /// Byte budget after applying host pressure.
    pub effective_budget: usize,
    /// Configured byte budget.
    pub nominal_budget: usize,
    /// In-memory hits.
    pub memory_hits: u64,
    /// Lookups that missed memory.
    pub memory_misses: u64,
    /// Misses served from the persistent tier.
    pub disk_hits: u64,
    /// Misses the persistent tier did not hold either.
    pub disk_misses: u64,
    /// Puts that ended up in memory.
    pub admitted: u64,
    /// Puts refused by the accelerator gate.
    pub gate_rejections: u64,
    /// Puts refused for lack of evictable room.
    pub budget_rejections: u64,
    /// Evictions by reason.
    pub evictions: EvictionCounts,
    /// Emergency evictions run.
    pub emergencies: u64,
    /// Persisted entries discarded as corrupt.
    pub corrupt_entries: u64,
    /// Failed persistent-tier operations.
    pub disk_errors: u64,
}

impl StoreStats {
    /// Fraction of lookups served by either tier.
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.memory_hits + self.memory_misses;
        if lookups == 0 {
            return 0.0;
        }
        (self.memory_hits + self.disk_hits) as f64 / lookups as f64
    }
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entries={} bytes={}/{} (nominal {}) hits={} disk_hits={} misses={} \
             hit_ratio={:.1}% rejected={}+{} evicted={} (capacity={} aggressive={} \
             kind_cap={} emergency={}) corrupt={} disk_errors={}",
            self.entries,
            self.bytes,
            self.effective_budget,
            self.nominal_budget,
            self.memory_hits,
            self.disk_hits,
            self.disk_misses,
            self.hit_ratio() * 100.0,
            self.gate_rejections,
            self.budget_rejections,
            self.evictions.total(),
            self.evictions.capacity,
            self.evictions.aggressive,
            self.evictions.kind_cap,
            self.evictions.emergency,
            self.corrupt_entries,
            self.disk_errors,
        )
    }
}
