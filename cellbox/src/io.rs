//! Bounded background pool for persistent-tier I/O.
//!
//! Disk reads and writes never run on the caller's thread. [`IoPool`] spawns
//! them on the engine's runtime, caps how many touch the persistent tier at
//! once, and counts unfinished operations so tests can wait for the queue
//! to drain.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use smol_str::SmolStr;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{Instrument, info_span};

/// Identifies one spawned I/O task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IoTaskKey {
    /// Kind of the task (`"write"`, `"remove"`, ...).
    pub kind: SmolStr,
    /// Unique identifier within the pool.
    pub id: u64,
}

#[derive(Debug)]
struct IoPoolInner {
    runtime: Handle,
    permits: Arc<Semaphore>,
    active: AtomicUsize,
    key_counter: AtomicU64,
}

/// Decrements the active count when a task finishes or is dropped unrun.
struct ActiveGuard(Arc<IoPoolInner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Background executor for persistent-tier operations.
///
/// Cloning is cheap; clones share the same queue and permits.
#[derive(Clone, Debug)]
pub struct IoPool {
    inner: Arc<IoPoolInner>,
}

impl IoPool {
    /// Creates a pool running at most `concurrency` operations at once on
    /// `runtime`.
    pub fn new(runtime: Handle, concurrency: usize) -> Self {
        Self {
            inner: Arc::new(IoPoolInner {
                runtime,
                permits: Arc::new(Semaphore::new(concurrency.max(1))),
                active: AtomicUsize::new(0),
                key_counter: AtomicU64::new(0),
            }),
        }
    }

    fn next_key(&self, kind: impl Into<SmolStr>) -> IoTaskKey {
        let id = self.inner.key_counter.fetch_add(1, Ordering::Relaxed);
        IoTaskKey {
            kind: kind.into(),
            id,
        }
    }

    /// Spawns a fire-and-forget operation. It starts once a permit is free.
    ///
    /// Safe to call from threads outside the runtime.
    pub fn spawn<F>(&self, kind: impl Into<SmolStr>, task: F) -> IoTaskKey
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = self.next_key(kind);
        let span = info_span!("io_task", kind = %key.kind, id = key.id);
        let permits = self.inner.permits.clone();

        // Counted before the task exists so it can never be observed idle.
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        let guard = ActiveGuard(self.inner.clone());
        self.inner.runtime.spawn(
            async move {
                let _guard = guard;
                let _permit = permits.acquire_owned().await.ok();
                task.await;
            }
            .instrument(span),
        );
        key
    }

    /// Number of spawned operations not yet finished.
    pub fn active_task_count(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Waits until every spawned operation has finished.
    pub async fn wait_idle(&self) {
        while self.active_task_count() > 0 {
            tokio::task::yield_now().await;
        }
    }
}
