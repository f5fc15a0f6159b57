//! Engine facade wiring the components together.

use std::sync::Arc;

use cellbox_backend::PersistentStore;
use cellbox_core::{
    AcceleratorGate, Artifact, CellKey, ContextId, Coord, HostFeedback, IdleHost, Kind,
    ProducerContext,
};
use tokio::runtime::Handle;
use tracing::info;

use crate::batch::{BatchQueue, BatchStats};
use crate::config::EngineConfig;
use crate::error::{BuildError, ProducerError};
use crate::ledger::BudgetLedger;
use crate::limiter::{AdaptiveLimiter, LimiterSnapshot};
use crate::memo::{AlternateProducer, EntryState, MemoCache, MemoStats, Requested};
use crate::store::{StoreStats, TieredStore};

/// Stats of every engine component.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Memoization cache.
    pub memo: MemoStats,
    /// Batch queue.
    pub batch: BatchStats,
    /// Concurrency limiter.
    pub limiter: LimiterSnapshot,
    /// Tiered store.
    pub store: StoreStats,
}

/// Adaptive keyed compute cache for artifacts of type `A` produced from
/// contexts of type `C`.
///
/// ```no_run
/// use std::sync::Arc;
/// use cellbox::{CellKey, ContextId, Engine, Namespace, ProducerContext, Requested};
///
/// struct World {
///     id: ContextId,
/// }
///
/// impl ProducerContext for World {
///     fn context_id(&self) -> ContextId {
///         self.id
///     }
///     fn namespace(&self) -> Namespace {
///         Namespace::new("overworld")
///     }
/// }
///
/// # async fn run() -> Result<(), cellbox::BuildError> {
/// let engine: Engine<World, Vec<u8>> = Engine::builder().build()?;
/// let world = Arc::new(World { id: ContextId::fresh() });
/// let key = CellKey::new("heightmap", world.id, world.coord(3, -7));
///
/// if engine.get_if_ready(&key).is_none() {
///     let requested = engine.request_async(&world, key, |_, key| {
///         Ok(vec![key.coord().x() as u8; 256])
///     });
///     assert_eq!(requested, Requested::Scheduled);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Engine<C, A> {
    memo: MemoCache<C, A>,
    batch: BatchQueue,
    store: TieredStore<A>,
    limiter: AdaptiveLimiter,
    ledger: BudgetLedger,
}

impl<C, A> Clone for Engine<C, A> {
    fn clone(&self) -> Self {
        Self {
            memo: self.memo.clone(),
            batch: self.batch.clone(),
            store: self.store.clone(),
            limiter: self.limiter.clone(),
            ledger: self.ledger.clone(),
        }
    }
}

impl<C, A> std::fmt::Debug for Engine<C, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("memo", &self.memo)
            .field("batch", &self.batch)
            .field("store", &self.store)
            .field("limiter", &self.limiter)
            .finish()
    }
}

impl<C, A> Engine<C, A>
where
    C: ProducerContext,
    A: Artifact,
{
    /// Starts building an engine.
    pub fn builder() -> EngineBuilder<C, A> {
        EngineBuilder::default()
    }

    /// See [`MemoCache::get_if_ready`].
    pub fn get_if_ready(&self, key: &CellKey) -> Option<A> {
        self.memo.get_if_ready(key)
    }

    /// See [`MemoCache::request_async`].
    pub fn request_async<P>(&self, context: &Arc<C>, key: CellKey, producer: P) -> Requested<A>
    where
        P: Fn(&C, &CellKey) -> Result<A, ProducerError> + Send + Sync + 'static,
    {
        self.memo.request_async(context, key, producer)
    }

    /// See [`MemoCache::request_sync`].
    pub fn request_sync<P>(&self, context: &Arc<C>, key: CellKey, producer: P) -> Option<A>
    where
        P: Fn(&C, &CellKey) -> Result<A, ProducerError> + Send + Sync + 'static,
    {
        self.memo.request_sync(context, key, producer)
    }

    /// See [`MemoCache::state`].
    pub fn state(&self, key: &CellKey) -> EntryState {
        self.memo.state(key)
    }

    /// See [`MemoCache::invalidate`].
    pub fn invalidate(&self, key: &CellKey) -> bool {
        self.memo.invalidate(key)
    }

    /// See [`MemoCache::invalidate_area`].
    pub fn invalidate_area(&self, context: ContextId, origin: &Coord, width: u32, depth: u32) -> usize {
        self.memo.invalidate_area(context, origin, width, depth)
    }

    /// See [`MemoCache::forget_context`].
    pub fn forget_context(&self, context: ContextId) -> usize {
        self.memo.forget_context(context)
    }

    /// See [`BatchQueue::flush_kind`].
    pub fn flush_kind(&self, kind: &Kind) -> usize {
        self.batch.flush_kind(kind)
    }

    /// See [`BatchQueue::flush_all`].
    pub fn flush_all(&self) -> usize {
        self.batch.flush_all()
    }

    /// Memoization cache.
    pub fn memo(&self) -> &MemoCache<C, A> {
        &self.memo
    }

    /// Batch queue.
    pub fn batch(&self) -> &BatchQueue {
        &self.batch
    }

    /// Tiered store.
    pub fn store(&self) -> &TieredStore<A> {
        &self.store
    }

    /// Concurrency limiter.
    pub fn limiter(&self) -> &AdaptiveLimiter {
        &self.limiter
    }

    /// Budget ledger shared with external cache groups.
    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    /// Stats of every component.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            memo: self.memo.stats(),
            batch: self.batch.stats(),
            limiter: self.limiter.snapshot(),
            store: self.store.stats_summary(),
        }
    }

    /// Dispatches every pending batch once, then drops all in-memory state.
    ///
    /// Persistent-tier operations already queued keep running; this does not
    /// wait for them. Results of tasks dispatched here are discarded.
    pub fn shutdown(&self) {
        let flushed = self.batch.flush_all();
        self.memo.clear();
        let dropped = self.store.clear_all();
        self.ledger.clear();
        info!(flushed, dropped, "cellbox engine shut down");
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder<C, A> {
    config: EngineConfig,
    feedback: Arc<dyn HostFeedback>,
    gate: Option<Arc<dyn AcceleratorGate>>,
    persistent: Option<Arc<dyn PersistentStore>>,
    alternate: Option<Arc<dyn AlternateProducer<C, A>>>,
    ledger: BudgetLedger,
    runtime: Option<Handle>,
    parallelism: Option<usize>,
}

impl<C, A> Default for EngineBuilder<C, A> {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            feedback: Arc::new(IdleHost),
            gate: None,
            persistent: None,
            alternate: None,
            ledger: BudgetLedger::new(),
            runtime: None,
            parallelism: None,
        }
    }
}

impl<C, A> EngineBuilder<C, A>
where
    C: ProducerContext,
    A: Artifact,
{
    /// Engine configuration. It is clamped again on build.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Host load and memory signals.
    pub fn feedback(mut self, feedback: Arc<dyn HostFeedback>) -> Self {
        self.feedback = feedback;
        self
    }

    /// Accelerator capacity check consulted before in-memory admission.
    pub fn gate(mut self, gate: Arc<dyn AcceleratorGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Persistent tier behind the in-memory store.
    pub fn persistent(mut self, store: impl PersistentStore + 'static) -> Self {
        self.persistent = Some(Arc::new(store));
        self
    }

    /// Source consulted before the producer on the async path.
    pub fn alternate(mut self, alternate: Arc<dyn AlternateProducer<C, A>>) -> Self {
        self.alternate = Some(alternate);
        self
    }

    /// Ledger shared with other caches of the application.
    pub fn ledger(mut self, ledger: BudgetLedger) -> Self {
        self.ledger = ledger;
        self
    }

    /// Runtime for producer tasks, batch flushes and persistent I/O.
    /// Defaults to the current runtime.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Hard ceiling for the concurrency limiter instead of the machine's
    /// available parallelism.
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    /// Builds the engine.
    pub fn build(self) -> Result<Engine<C, A>, BuildError> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()?,
        };
        let config = self.config.clamped();

        let limiter = match self.parallelism {
            Some(parallelism) => AdaptiveLimiter::with_parallelism(
                config.limiter.clone(),
                self.feedback.clone(),
                parallelism,
            ),
            None => AdaptiveLimiter::new(config.limiter.clone(), self.feedback.clone()),
        };

        let mut store = TieredStore::builder()
            .config(config.clone())
            .feedback(self.feedback.clone())
            .ledger(self.ledger.clone())
            .runtime(runtime.clone());
        if let Some(gate) = self.gate {
            store = store.gate(gate);
        }
        if let Some(persistent) = self.persistent {
            store = store.persistent(persistent);
        }
        let store = store.build()?;

        let batch = BatchQueue::new(
            config.batch.clone(),
            &config.limiter,
            limiter.clone(),
            self.feedback,
            runtime,
        );
        let memo = MemoCache::new(
            config,
            store.clone(),
            batch.clone(),
            limiter.clone(),
            self.alternate,
        );

        Ok(Engine {
            memo,
            batch,
            store,
            limiter,
            ledger: self.ledger,
        })
    }
}
