//! Metrics declaration and recording helpers.
//!
//! With the `metrics` feature enabled, the engine reports through the
//! [`metrics`](https://docs.rs/metrics) facade. Without it every helper
//! below is an inlined no-op the compiler removes.
//!
//! ## Naming Pattern
//!
//! All metrics follow `cellbox_{component}_{event}`:
//!
//! - `cellbox_memo_*` - memoization cache lookups, claims and failures
//! - `cellbox_batch_*` - batch dispatches and task failures
//! - `cellbox_limiter_*` - current concurrency limit
//! - `cellbox_store_*` - tiered store occupancy, evictions and disk I/O

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
lazy_static! {
    /// Track number of memo lookups that found a fresh artifact.
    pub static ref MEMO_HITS: &'static str = {
        metrics::describe_counter!(
            "cellbox_memo_hits_total",
            "Total number of memo lookups that found a fresh artifact."
        );
        "cellbox_memo_hits_total"
    };
    /// Track number of memo lookups that missed.
    pub static ref MEMO_MISSES: &'static str = {
        metrics::describe_counter!(
            "cellbox_memo_misses_total",
            "Total number of memo lookups that missed."
        );
        "cellbox_memo_misses_total"
    };
    /// Track number of in-flight claims installed.
    pub static ref MEMO_CLAIMS: &'static str = {
        metrics::describe_counter!(
            "cellbox_memo_claims_total",
            "Total number of in-flight claims installed."
        );
        "cellbox_memo_claims_total"
    };
    /// Track number of requests coalesced onto an existing claim.
    pub static ref MEMO_COALESCED: &'static str = {
        metrics::describe_counter!(
            "cellbox_memo_coalesced_total",
            "Total number of requests coalesced onto an existing claim."
        );
        "cellbox_memo_coalesced_total"
    };
    /// Track number of producer failures.
    pub static ref MEMO_FAILURES: &'static str = {
        metrics::describe_counter!(
            "cellbox_memo_failures_total",
            "Total number of producer failures."
        );
        "cellbox_memo_failures_total"
    };

    /// Track number of batches dispatched.
    pub static ref BATCH_DISPATCHES: &'static str = {
        metrics::describe_counter!(
            "cellbox_batch_dispatches_total",
            "Total number of batches dispatched."
        );
        "cellbox_batch_dispatches_total"
    };
    /// Histogram of dispatched batch sizes.
    pub static ref BATCH_SIZE: &'static str = {
        metrics::describe_histogram!(
            "cellbox_batch_size",
            "Number of items in each dispatched batch."
        );
        "cellbox_batch_size"
    };
    /// Track number of failed batch tasks.
    pub static ref BATCH_TASK_FAILURES: &'static str = {
        metrics::describe_counter!(
            "cellbox_batch_task_failures_total",
            "Total number of failed batch tasks."
        );
        "cellbox_batch_task_failures_total"
    };

    /// Gauge of the current concurrency limit.
    pub static ref LIMITER_LIMIT: &'static str = {
        metrics::describe_gauge!(
            "cellbox_limiter_limit",
            "Current number of concurrently permitted producer invocations."
        );
        "cellbox_limiter_limit"
    };

    /// Gauge of bytes held by the in-memory tier.
    pub static ref STORE_BYTES: &'static str = {
        metrics::describe_gauge!(
            "cellbox_store_bytes",
            metrics::Unit::Bytes,
            "Estimated bytes held by the in-memory tier."
        );
        "cellbox_store_bytes"
    };
    /// Gauge of entries held by the in-memory tier.
    pub static ref STORE_ENTRIES: &'static str = {
        metrics::describe_gauge!(
            "cellbox_store_entries",
            "Entries held by the in-memory tier."
        );
        "cellbox_store_entries"
    };
    /// Track number of evicted entries.
    pub static ref STORE_EVICTIONS: &'static str = {
        metrics::describe_counter!(
            "cellbox_store_evictions_total",
            "Total number of entries evicted from the in-memory tier."
        );
        "cellbox_store_evictions_total"
    };
    /// Track number of persistent-tier reads.
    pub static ref STORE_DISK_READS: &'static str = {
        metrics::describe_counter!(
            "cellbox_store_disk_reads_total",
            "Total number of persistent-tier reads."
        );
        "cellbox_store_disk_reads_total"
    };
    /// Track number of persistent-tier writes.
    pub static ref STORE_DISK_WRITES: &'static str = {
        metrics::describe_counter!(
            "cellbox_store_disk_writes_total",
            "Total number of persistent-tier writes."
        );
        "cellbox_store_disk_writes_total"
    };
    /// Track number of persistent-tier errors.
    pub static ref STORE_DISK_ERRORS: &'static str = {
        metrics::describe_counter!(
            "cellbox_store_disk_errors_total",
            "Total number of failed persistent-tier operations."
        );
        "cellbox_store_disk_errors_total"
    };
}

/// Outcome of a memo lookup or claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoEvent {
    /// A fresh artifact was returned.
    Hit,
    /// No usable artifact.
    Miss,
    /// A new claim was installed.
    Claim,
    /// The request joined an existing claim.
    Coalesced,
    /// The producer failed.
    Failure,
}

/// Record one memo event for `kind`.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_memo(kind: &str, event: MemoEvent) {
    let name = match event {
        MemoEvent::Hit => *MEMO_HITS,
        MemoEvent::Miss => *MEMO_MISSES,
        MemoEvent::Claim => *MEMO_CLAIMS,
        MemoEvent::Coalesced => *MEMO_COALESCED,
        MemoEvent::Failure => *MEMO_FAILURES,
    };
    metrics::counter!(name, "kind" => kind.to_string()).increment(1);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_memo(_kind: &str, _event: MemoEvent) {}

/// Record a dispatched batch. `trigger` is `"threshold"`, `"deferred"`,
/// `"kind"` or `"all"`.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_dispatch(trigger: &'static str, items: usize) {
    metrics::counter!(*BATCH_DISPATCHES, "trigger" => trigger).increment(1);
    metrics::histogram!(*BATCH_SIZE, "trigger" => trigger).record(items as f64);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_dispatch(_trigger: &'static str, _items: usize) {}

/// Record a failed batch task.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_task_failure(kind: &str) {
    metrics::counter!(*BATCH_TASK_FAILURES, "kind" => kind.to_string()).increment(1);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_task_failure(_kind: &str) {}

/// Record the current concurrency limit.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_limit(limit: usize) {
    metrics::gauge!(*LIMITER_LIMIT).set(limit as f64);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_limit(_limit: usize) {}

/// Record in-memory tier occupancy.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_occupancy(entries: usize, bytes: usize) {
    metrics::gauge!(*STORE_ENTRIES).set(entries as f64);
    metrics::gauge!(*STORE_BYTES).set(bytes as f64);
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_occupancy(_entries: usize, _bytes: usize) {}

/// Record evictions. `reason` is `"capacity"`, `"aggressive"`,
/// `"kind_cap"` or `"emergency"`.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_evictions(reason: &'static str, count: usize) {
    if count > 0 {
        metrics::counter!(*STORE_EVICTIONS, "reason" => reason).increment(count as u64);
    }
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_evictions(_reason: &'static str, _count: usize) {}

/// Record one persistent-tier operation. `op` is `"read"`, `"write"` or
/// `"remove"`.
#[cfg(feature = "metrics")]
#[inline]
pub fn record_disk(op: &'static str, success: bool) {
    let name = match op {
        "read" => *STORE_DISK_READS,
        _ => *STORE_DISK_WRITES,
    };
    metrics::counter!(name, "op" => op).increment(1);
    if !success {
        metrics::counter!(*STORE_DISK_ERRORS, "op" => op).increment(1);
    }
}

/// No-op version when metrics feature is disabled.
#[cfg(not(feature = "metrics"))]
#[inline]
pub fn record_disk(_op: &'static str, _success: bool) {}
