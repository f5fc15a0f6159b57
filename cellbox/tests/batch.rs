mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cellbox::batch::BatchTask;
use cellbox::{
    AdaptiveLimiter, BatchConfig, BatchQueue, ContextId, DispatchError, Enqueued, HostFeedback,
    IdleHost, Kind, LimiterConfig, ManualFeedback,
};
use common::{eventually, key_in, settle};
use futures::FutureExt;
use tokio::runtime::Handle;

fn queue(feedback: Arc<dyn HostFeedback>) -> BatchQueue {
    let config = BatchConfig {
        min_threshold: 4,
        max_threshold: 8,
        flush_delay: Duration::from_millis(40),
    };
    let limiter =
        AdaptiveLimiter::with_parallelism(LimiterConfig::default(), feedback.clone(), 4);
    BatchQueue::new(
        config,
        &LimiterConfig::default(),
        limiter,
        feedback,
        Handle::current(),
    )
}

fn counting(counter: &Arc<AtomicUsize>) -> BatchTask {
    let counter = counter.clone();
    async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    .boxed()
}

#[tokio::test(start_paused = true)]
async fn reaching_threshold_dispatches_inline() {
    let queue = queue(Arc::new(IdleHost));
    let context = ContextId::fresh();
    let runs = Arc::new(AtomicUsize::new(0));

    for x in 0..7 {
        let outcome = queue.enqueue(context, key_in(context, "heightmap", x, 0), counting(&runs));
        assert_eq!(outcome, Enqueued::Pending);
    }
    let outcome = queue.enqueue(context, key_in(context, "heightmap", 7, 0), counting(&runs));
    assert_eq!(outcome, Enqueued::Dispatched(8));

    settle(|| queue.stats().completed == 8).await;
    assert_eq!(runs.load(Ordering::SeqCst), 8);

    // The deferred flush scheduled by the first item finds nothing left.
    tokio::time::advance(Duration::from_millis(50)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    let stats = queue.stats();
    assert_eq!(stats.threshold_flushes, 1);
    assert_eq!(stats.deferred_flushes, 0);
    assert_eq!(stats.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn deferred_flush_runs_after_delay() {
    let queue = queue(Arc::new(IdleHost));
    let context = ContextId::fresh();
    let runs = Arc::new(AtomicUsize::new(0));

    for x in 0..3 {
        queue.enqueue(context, key_in(context, "heightmap", x, 0), counting(&runs));
    }

    tokio::time::advance(Duration::from_millis(39)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(queue.stats().dispatched, 0, "flushed before the delay");

    tokio::time::advance(Duration::from_millis(2)).await;
    settle(|| queue.stats().completed == 3).await;

    let stats = queue.stats();
    assert_eq!(stats.deferred_flushes, 1);
    assert_eq!(stats.threshold_flushes, 0);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn host_load_lowers_threshold() {
    let feedback = Arc::new(ManualFeedback::new());
    let queue = queue(feedback.clone());
    assert_eq!(queue.threshold(), 8);

    feedback.set_tick_ms(45.0);
    assert_eq!(queue.threshold(), 6);

    feedback.set_tick_ms(60.0);
    assert_eq!(queue.threshold(), 4);

    let context = ContextId::fresh();
    let runs = Arc::new(AtomicUsize::new(0));
    for x in 0..3 {
        queue.enqueue(context, key_in(context, "noise", x, 0), counting(&runs));
    }
    let outcome = queue.enqueue(context, key_in(context, "noise", 3, 0), counting(&runs));
    assert_eq!(outcome, Enqueued::Dispatched(4));
}

#[tokio::test(start_paused = true)]
async fn deep_backlog_halves_threshold() {
    let queue = queue(Arc::new(IdleHost));
    let runs = Arc::new(AtomicUsize::new(0));
    let contexts: Vec<_> = (0..4).map(|_| ContextId::fresh()).collect();

    for context in &contexts {
        for x in 0..4 {
            let outcome =
                queue.enqueue(*context, key_in(*context, "heightmap", x, 0), counting(&runs));
            assert_eq!(outcome, Enqueued::Pending);
        }
    }
    assert_eq!(queue.stats().pending, 16);
    assert_eq!(queue.threshold(), 4);

    let first = contexts[0];
    let outcome = queue.enqueue(first, key_in(first, "heightmap", 4, 0), counting(&runs));
    assert_eq!(outcome, Enqueued::Dispatched(5));
}

#[tokio::test(start_paused = true)]
async fn flush_kind_leaves_other_kinds_pending() {
    let queue = queue(Arc::new(IdleHost));
    let context = ContextId::fresh();
    let runs = Arc::new(AtomicUsize::new(0));

    for x in 0..2 {
        queue.enqueue(context, key_in(context, "heightmap", x, 0), counting(&runs));
        queue.enqueue(context, key_in(context, "noise", x, 0), counting(&runs));
    }

    assert_eq!(queue.flush_kind(&Kind::new("heightmap")), 2);
    assert_eq!(queue.stats().pending, 2);

    assert_eq!(queue.flush_all(), 2);
    assert_eq!(queue.stats().pending, 0);

    settle(|| queue.stats().completed == 4).await;
    assert_eq!(runs.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn failing_task_does_not_affect_siblings() {
    let queue = queue(Arc::new(IdleHost));
    let context = ContextId::fresh();
    let runs = Arc::new(AtomicUsize::new(0));

    queue.enqueue(context, key_in(context, "heightmap", 0, 0), counting(&runs));
    let failing_key = key_in(context, "heightmap", 1, 0);
    let key = failing_key.clone();
    queue.enqueue(
        context,
        failing_key,
        async move {
            Err(DispatchError::Producer {
                key,
                source: "boom".into(),
            })
        }
        .boxed(),
    );
    queue.enqueue(context, key_in(context, "heightmap", 2, 0), counting(&runs));

    assert_eq!(queue.flush_all(), 3);
    settle(|| queue.stats().completed == 3).await;

    let stats = queue.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn enqueue_from_non_runtime_thread() {
    let queue = queue(Arc::new(IdleHost));
    let runs = Arc::new(AtomicUsize::new(0));

    let handle = {
        let queue = queue.clone();
        let runs = runs.clone();
        std::thread::spawn(move || {
            let context = ContextId::fresh();
            queue.enqueue(context, key_in(context, "heightmap", 0, 0), counting(&runs))
        })
    };
    assert_eq!(handle.join().unwrap(), Enqueued::Pending);

    eventually(|| queue.stats().completed == 1).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
