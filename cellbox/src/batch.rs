//! Batch dispatch queue.
//!
//! Producer work is not spawned one request at a time. [`BatchQueue`]
//! collects submitted tasks per producer context and releases them in
//! batches:
//!
//! - **Threshold flush** - once a context has accumulated the adaptive
//!   threshold, its batch is drained and dispatched inside the `enqueue`
//!   call itself.
//! - **Deferred flush** - otherwise a single delayed flush is scheduled that
//!   dispatches every context with pending items once `flush_delay` elapses.
//!   At most one deferred flush is scheduled at a time.
//! - **Explicit flush** - [`BatchQueue::flush_kind`] and
//!   [`BatchQueue::flush_all`] dispatch immediately.
//!
//! Every dispatched item runs as its own task behind the
//! [`AdaptiveLimiter`]. A failing task is logged with its key and never
//! affects its siblings.
//!
//! The threshold follows host load: an idle host lets up to `max_threshold`
//! items accumulate, a loaded host forces batches out earlier so no pending
//! item waits long.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use cellbox_core::{CellKey, ContextId, HostFeedback, Kind};
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tracing::{Instrument, debug, info_span, warn};

use crate::config::{BatchConfig, LimiterConfig};
use crate::error::DispatchError;
use crate::limiter::AdaptiveLimiter;
use crate::metrics;

/// One unit of deferred work.
pub type BatchTask = BoxFuture<'static, Result<(), DispatchError>>;

/// What happened to an enqueued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The context reached its threshold; this many items were dispatched.
    Dispatched(usize),
    /// The task waits for a later flush.
    Pending,
}

/// Counters of a [`BatchQueue`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Items currently waiting.
    pub pending: usize,
    /// Items ever enqueued.
    pub enqueued: u64,
    /// Batches dispatched because a context reached its threshold.
    pub threshold_flushes: u64,
    /// Deferred flushes that found work to dispatch.
    pub deferred_flushes: u64,
    /// Items handed to the execution layer.
    pub dispatched: u64,
    /// Dispatched items that finished, successfully or not.
    pub completed: u64,
    /// Dispatched items that failed.
    pub failed: u64,
}

struct PendingItem {
    key: CellKey,
    task: BatchTask,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    threshold_flushes: AtomicU64,
    deferred_flushes: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

struct BatchInner {
    config: BatchConfig,
    load_high_ms: f64,
    load_elevated_ms: f64,
    limiter: AdaptiveLimiter,
    feedback: Arc<dyn HostFeedback>,
    runtime: Handle,
    pending: Mutex<HashMap<ContextId, Vec<PendingItem>>>,
    pending_len: AtomicUsize,
    flush_scheduled: AtomicBool,
    counters: Counters,
}

/// Per-context batching front of the execution layer.
///
/// Cloning is cheap; clones share the same queue.
#[derive(Clone)]
pub struct BatchQueue {
    inner: Arc<BatchInner>,
}

impl std::fmt::Debug for BatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchQueue")
            .field("config", &self.inner.config)
            .field("pending", &self.inner.pending_len)
            .finish()
    }
}

impl BatchQueue {
    /// Creates a queue dispatching onto `runtime` through `limiter`.
    ///
    /// The load thresholds of `limiter_config` also drive the adaptive
    /// flush threshold.
    pub fn new(
        config: BatchConfig,
        limiter_config: &LimiterConfig,
        limiter: AdaptiveLimiter,
        feedback: Arc<dyn HostFeedback>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                config,
                load_high_ms: limiter_config.load_high_ms,
                load_elevated_ms: limiter_config.load_elevated_ms,
                limiter,
                feedback,
                runtime,
                pending: Mutex::new(HashMap::new()),
                pending_len: AtomicUsize::new(0),
                flush_scheduled: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    /// Current flush threshold per context.
    pub fn threshold(&self) -> usize {
        flush_threshold(
            &self.inner.config,
            self.inner.load_high_ms,
            self.inner.load_elevated_ms,
            self.inner.feedback.smoothed_tick_ms(),
            self.inner.pending_len.load(Ordering::Acquire),
        )
    }

    /// Adds `task` for `key` to the batch of `context`.
    ///
    /// Never blocks on the task. Safe to call from threads outside the
    /// runtime.
    pub fn enqueue(&self, context: ContextId, key: CellKey, task: BatchTask) -> Enqueued {
        self.inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        let threshold = self.threshold();

        let ready = {
            let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let items = pending.entry(context).or_default();
            items.push(PendingItem { key, task });
            self.inner.pending_len.fetch_add(1, Ordering::AcqRel);

            if items.len() >= threshold {
                let batch = std::mem::take(items);
                pending.remove(&context);
                self.inner.pending_len.fetch_sub(batch.len(), Ordering::AcqRel);
                Some(batch)
            } else {
                None
            }
        };

        match ready {
            Some(batch) => {
                let count = batch.len();
                self.inner
                    .counters
                    .threshold_flushes
                    .fetch_add(1, Ordering::Relaxed);
                debug!(%context, count, threshold, "batch threshold reached");
                self.dispatch("threshold", batch);
                Enqueued::Dispatched(count)
            }
            None => {
                self.schedule_deferred_flush();
                Enqueued::Pending
            }
        }
    }

    fn schedule_deferred_flush(&self) {
        if self.inner.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let queue = self.clone();
        let deadline = tokio::time::Instant::now() + self.inner.config.flush_delay;
        self.inner.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            queue.inner.flush_scheduled.store(false, Ordering::Release);
            let flushed = queue.drain(|_| true);
            if !flushed.is_empty() {
                queue
                    .inner
                    .counters
                    .deferred_flushes
                    .fetch_add(1, Ordering::Relaxed);
                for batch in flushed {
                    queue.dispatch("deferred", batch);
                }
            }
        });
    }

    /// Dispatches every pending item of `kind` across all contexts.
    /// Returns the number of items dispatched.
    pub fn flush_kind(&self, kind: &Kind) -> usize {
        let batches = self.drain(|item| item.key.kind() == kind);
        let count = batches.iter().map(Vec::len).sum();
        for batch in batches {
            self.dispatch("kind", batch);
        }
        count
    }

    /// Dispatches every pending item. Returns the number of items
    /// dispatched.
    pub fn flush_all(&self) -> usize {
        let batches = self.drain(|_| true);
        let count = batches.iter().map(Vec::len).sum();
        for batch in batches {
            self.dispatch("all", batch);
        }
        count
    }

    /// Removes matching items, grouped by context.
    fn drain(&self, mut select: impl FnMut(&PendingItem) -> bool) -> Vec<Vec<PendingItem>> {
        let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut batches = Vec::new();
        pending.retain(|_, items| {
            let (taken, kept): (Vec<_>, Vec<_>) = items.drain(..).partition(|item| select(item));
            *items = kept;
            if !taken.is_empty() {
                batches.push(taken);
            }
            !items.is_empty()
        });
        let drained: usize = batches.iter().map(Vec::len).sum();
        self.inner.pending_len.fetch_sub(drained, Ordering::AcqRel);
        batches
    }

    fn dispatch(&self, trigger: &'static str, batch: Vec<PendingItem>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        metrics::record_dispatch(trigger, count);
        self.inner.limiter.maybe_retune(
            self.inner.pending_len.load(Ordering::Acquire) + count,
            self.inner.config.max_threshold,
        );
        debug!(trigger, count, "dispatching batch");

        for PendingItem { key, task } in batch {
            self.inner.counters.dispatched.fetch_add(1, Ordering::Relaxed);
            let inner = self.inner.clone();
            let span = info_span!("cellbox.dispatch", kind = %key.kind(), key = %key);

            self.inner.runtime.spawn(
                async move {
                    let result = match inner.limiter.enter().await {
                        Some(permit) => {
                            let result = task.await;
                            permit.release();
                            result
                        }
                        None => Err(DispatchError::LimiterClosed),
                    };
                    if let Err(error) = result {
                        inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                        metrics::record_task_failure(key.kind().as_str());
                        warn!(%key, %error, "batch task failed");
                    }
                    inner.counters.completed.fetch_add(1, Ordering::Relaxed);
                }
                .instrument(span),
            );
        }
    }

    /// Counters and current backlog.
    pub fn stats(&self) -> BatchStats {
        let counters = &self.inner.counters;
        BatchStats {
            pending: self.inner.pending_len.load(Ordering::Acquire),
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            threshold_flushes: counters.threshold_flushes.load(Ordering::Relaxed),
            deferred_flushes: counters.deferred_flushes.load(Ordering::Relaxed),
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
        }
    }
}

fn flush_threshold(
    config: &BatchConfig,
    load_high_ms: f64,
    load_elevated_ms: f64,
    load_ms: f64,
    backlog: usize,
) -> usize {
    let base = if load_ms >= load_high_ms {
        config.min_threshold
    } else if load_ms >= load_elevated_ms {
        (config.min_threshold + config.max_threshold) / 2
    } else {
        config.max_threshold
    };
    let threshold = if backlog >= config.max_threshold * 2 {
        base / 2
    } else {
        base
    };
    threshold.max(config.min_threshold).max(1)
}
