#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

/// Per-kind batching of producer tasks with adaptive flush thresholds.
pub mod batch;
/// Engine configuration with clamped defaults.
pub mod config;
/// The engine facade and its builder.
pub mod engine;
/// Error types.
pub mod error;
/// Bounded background pool for persistent-tier I/O.
pub mod io;
/// Shared budget ledger for cooperating caches.
pub mod ledger;
/// Adaptive concurrency limiter.
pub mod limiter;
/// Memoization cache with at-most-one in-flight computation per key.
pub mod memo;
/// Metrics recording helpers.
pub mod metrics;
/// Tiered in-memory and persistent artifact store.
pub mod store;

pub use batch::{BatchQueue, BatchStats, Enqueued};
pub use config::{
    BatchConfig, EngineConfig, EngineConfigBuilder, KindPolicy, LimiterConfig, MemoConfig,
    StoreConfig,
};
pub use engine::{Engine, EngineBuilder, EngineStats};
pub use error::{BuildError, ConfigError, DispatchError, ProducerError};
pub use io::IoPool;
pub use ledger::{BudgetLedger, CacheGroup, GroupSnapshot};
pub use limiter::{AdaptiveLimiter, LimiterSnapshot, Permit};
pub use memo::{AlternateProducer, EntryState, MemoCache, MemoStats, Requested};
pub use store::{StoreStats, TieredStore, TieredStoreBuilder};

pub use cellbox_backend::{ArtifactFormat, DiskKey, PersistentStore};
pub use cellbox_core::{
    AcceleratorGate, Admission, Artifact, CellKey, ContextId, Coord, HostFeedback, IdleHost, Kind,
    ManualFeedback, Namespace, ProducerContext,
};
