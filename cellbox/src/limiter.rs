//! Adaptive concurrency limiter.
//!
//! [`AdaptiveLimiter`] is the admission gate in front of producer functions.
//! It hands out [`Permit`]s from a semaphore whose size follows live host
//! feedback:
//!
//! 1. **Host load** - at or above `load_high_ms` the limit drops to the
//!    floor; at or above `load_elevated_ms` it is capped at `elevated_cap`;
//!    otherwise the ceiling applies.
//! 2. **Producer duration** - an exponentially weighted average of producer
//!    wall-clock time; slow work lowers the limit.
//! 3. **Backlog** - a deep pending queue on a calm host raises the limit by
//!    one step, a shallow queue lowers it by one step.
//!
//! The three suggestions are combined by taking their minimum, then clamped
//! into `[floor, ceiling]`. Retuning happens at most once per
//! `retune_cooldown`. An override limit bypasses tuning entirely.
//!
//! Changing the limit never disturbs permits already handed out: shrinking
//! takes idle permits out of the semaphore immediately and absorbs the rest
//! as held permits are released.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cellbox_core::HostFeedback;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::config::{LimiterConfig, MAX_CONCURRENCY};
use crate::metrics;

/// Slot in the limiter. Dropping it releases the slot.
#[derive(Debug)]
#[must_use = "dropping a permit releases its slot immediately"]
pub struct Permit {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<LimiterInner>,
}

impl Permit {
    /// Releases the slot. Equivalent to dropping the permit.
    pub fn release(self) {}
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.inner.in_use.fetch_sub(1, Ordering::AcqRel);
        let Some(permit) = self.permit.take() else {
            return;
        };
        // Pay down outstanding shrink debt instead of returning the slot.
        let absorbed = self
            .inner
            .debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| debt.checked_sub(1))
            .is_ok();
        if absorbed {
            permit.forget();
        }
    }
}

/// Point-in-time view of the limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterSnapshot {
    /// Currently permitted concurrent holders.
    pub limit: usize,
    /// Permits currently held.
    pub in_use: usize,
    /// Smoothed producer duration, if any sample was recorded.
    pub avg_work_ms: Option<f64>,
    /// Whether an override bypasses auto-tuning.
    pub overridden: bool,
}

#[derive(Debug)]
struct TuneState {
    avg_work_ms: Option<f64>,
    last_retune: Option<Instant>,
    override_limit: Option<usize>,
}

struct LimiterInner {
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
    debt: AtomicUsize,
    in_use: AtomicUsize,
    closed: AtomicBool,
    ceiling: usize,
    config: LimiterConfig,
    feedback: Arc<dyn HostFeedback>,
    tune: Mutex<TuneState>,
}

impl std::fmt::Debug for LimiterInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterInner")
            .field("limit", &self.limit)
            .field("in_use", &self.in_use)
            .field("ceiling", &self.ceiling)
            .finish()
    }
}

/// Feedback-controlled admission gate for producer invocations.
///
/// Cloning is cheap; clones share the same slots.
#[derive(Clone, Debug)]
pub struct AdaptiveLimiter {
    inner: Arc<LimiterInner>,
}

impl AdaptiveLimiter {
    /// Creates a limiter starting at the ceiling (or the override, if set).
    pub fn new(config: LimiterConfig, feedback: Arc<dyn HostFeedback>) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_CONCURRENCY);
        Self::with_parallelism(config, feedback, parallelism)
    }

    /// Creates a limiter whose hard ceiling is `parallelism` instead of the
    /// machine's available parallelism.
    pub fn with_parallelism(
        config: LimiterConfig,
        feedback: Arc<dyn HostFeedback>,
        parallelism: usize,
    ) -> Self {
        let hard_ceiling = parallelism.clamp(1, MAX_CONCURRENCY);
        let ceiling = config.resolved_ceiling(hard_ceiling);
        let initial = config
            .override_limit
            .unwrap_or(ceiling)
            .clamp(config.floor.max(1).min(ceiling), ceiling);
        metrics::record_limit(initial);

        Self {
            inner: Arc::new(LimiterInner {
                semaphore: Arc::new(Semaphore::new(initial)),
                limit: AtomicUsize::new(initial),
                debt: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                ceiling,
                tune: Mutex::new(TuneState {
                    avg_work_ms: None,
                    last_retune: None,
                    override_limit: config.override_limit,
                }),
                config,
                feedback,
            }),
        }
    }

    /// Waits for a slot. Returns `None` once the limiter is closed.
    pub async fn enter(&self) -> Option<Permit> {
        let permit = self.inner.semaphore.clone().acquire_owned().await.ok()?;
        Some(self.wrap(permit))
    }

    /// Takes a slot if one is free right now.
    pub fn try_enter(&self) -> Option<Permit> {
        let permit = self.inner.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.wrap(permit))
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> Permit {
        self.inner.in_use.fetch_add(1, Ordering::AcqRel);
        Permit {
            permit: Some(permit),
            inner: self.inner.clone(),
        }
    }

    /// Current limit.
    pub fn limit(&self) -> usize {
        self.inner.limit.load(Ordering::Acquire)
    }

    /// Highest limit this limiter will ever choose.
    pub fn ceiling(&self) -> usize {
        self.inner.ceiling
    }

    /// Sets the limit, clamped into `[1, ceiling]`. Takes effect for future
    /// acquisitions; held permits stay valid.
    pub fn set_limit(&self, limit: usize) -> usize {
        let mut tune = self.inner.tune.lock().unwrap_or_else(PoisonError::into_inner);
        self.apply_limit(&mut tune, limit)
    }

    /// Fixes the limit (`Some`) or returns to auto-tuning (`None`).
    pub fn set_override(&self, limit: Option<usize>) {
        let mut tune = self.inner.tune.lock().unwrap_or_else(PoisonError::into_inner);
        tune.override_limit = limit.map(|l| l.clamp(1, self.inner.ceiling));
        if let Some(limit) = tune.override_limit {
            self.apply_limit(&mut tune, limit);
        }
    }

    fn apply_limit(&self, _tune: &mut TuneState, limit: usize) -> usize {
        let limit = limit.clamp(1, self.inner.ceiling);
        let previous = self.inner.limit.swap(limit, Ordering::AcqRel);

        if limit > previous {
            let mut grow = limit - previous;
            // Cancel pending shrink debt before adding fresh permits.
            while grow > 0 {
                let debt = self.inner.debt.load(Ordering::Acquire);
                if debt == 0 {
                    break;
                }
                let paid = debt.min(grow);
                if self
                    .inner
                    .debt
                    .compare_exchange(debt, debt - paid, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    grow -= paid;
                }
            }
            if grow > 0 {
                self.inner.semaphore.add_permits(grow);
            }
        } else if limit < previous {
            let shrink = previous - limit;
            let forgotten = self.inner.semaphore.forget_permits(shrink);
            if forgotten < shrink {
                self.inner.debt.fetch_add(shrink - forgotten, Ordering::AcqRel);
            }
        }

        if limit != previous {
            debug!(previous, limit, "concurrency limit changed");
            metrics::record_limit(limit);
        }
        limit
    }

    /// Feeds one producer wall-clock sample into the moving average.
    pub fn record_duration(&self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1000.0;
        let decay = self.inner.config.duration_decay;
        let mut tune = self.inner.tune.lock().unwrap_or_else(PoisonError::into_inner);
        tune.avg_work_ms = Some(match tune.avg_work_ms {
            Some(avg) => avg + (sample - avg) * decay,
            None => sample,
        });
    }

    /// Retunes the limit from host load, producer duration and `backlog`
    /// (pending items) relative to `flush_threshold`. Does nothing during
    /// the cooldown or while overridden. Returns the new limit when a retune
    /// ran.
    pub fn maybe_retune(&self, backlog: usize, flush_threshold: usize) -> Option<usize> {
        let now = Instant::now();
        let mut tune = self.inner.tune.lock().unwrap_or_else(PoisonError::into_inner);

        if tune.override_limit.is_some() {
            return None;
        }
        if let Some(last) = tune.last_retune
            && now.duration_since(last) < self.inner.config.retune_cooldown
        {
            return None;
        }
        tune.last_retune = Some(now);

        let suggested = suggest_limit(
            &self.inner.config,
            self.inner.ceiling,
            Signals {
                current: self.limit(),
                load_ms: self.inner.feedback.smoothed_tick_ms(),
                avg_work_ms: tune.avg_work_ms,
                backlog,
                flush_threshold,
            },
        );
        Some(self.apply_limit(&mut tune, suggested))
    }

    /// Point-in-time view of the limiter.
    pub fn snapshot(&self) -> LimiterSnapshot {
        let tune = self.inner.tune.lock().unwrap_or_else(PoisonError::into_inner);
        LimiterSnapshot {
            limit: self.limit(),
            in_use: self.inner.in_use.load(Ordering::Acquire),
            avg_work_ms: tune.avg_work_ms,
            overridden: tune.override_limit.is_some(),
        }
    }

    /// Refuses all future acquisitions. Held permits stay valid.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.semaphore.close();
        }
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy)]
struct Signals {
    current: usize,
    load_ms: f64,
    avg_work_ms: Option<f64>,
    backlog: usize,
    flush_threshold: usize,
}

fn suggest_limit(config: &LimiterConfig, ceiling: usize, signals: Signals) -> usize {
    let floor = config.floor.max(1).min(ceiling);

    let by_load = if signals.load_ms >= config.load_high_ms {
        floor
    } else if signals.load_ms >= config.load_elevated_ms {
        config.elevated_cap.min(ceiling)
    } else {
        ceiling
    };

    let by_work = match signals.avg_work_ms {
        Some(avg) if avg >= config.slow_work_ms => (ceiling / 4).max(1),
        Some(avg) if avg >= config.moderate_work_ms => (ceiling / 2).max(1),
        _ => ceiling,
    };

    let threshold = signals.flush_threshold.max(1);
    let by_backlog = if signals.backlog >= threshold * 2 && signals.load_ms < config.load_elevated_ms
    {
        signals.current + 1
    } else if signals.backlog < threshold / 2 {
        signals.current.saturating_sub(1)
    } else {
        signals.current
    };

    by_load.min(by_work).min(by_backlog).clamp(floor, ceiling)
}
