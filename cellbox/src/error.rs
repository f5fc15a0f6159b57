//! Error types for the engine.

use cellbox_core::CellKey;
use thiserror::Error;

/// Error returned by a producer function.
///
/// The engine treats every producer error the same way: the key is marked
/// failed and retried after the configured backoff.
pub type ProducerError = Box<dyn std::error::Error + Send + Sync>;

/// Failure of one dispatched batch task.
///
/// Dispatch failures are contained to their own task: they are logged with
/// the key and never abort sibling tasks.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The producer function returned an error.
    #[error("producer failed for {key}: {source}")]
    Producer {
        /// Key being produced.
        key: CellKey,
        /// Error returned by the producer.
        source: ProducerError,
    },

    /// The producer panicked or its blocking task was cancelled.
    #[error("producer task for {key} did not complete: {source}")]
    Join {
        /// Key being produced.
        key: CellKey,
        /// Join failure.
        source: tokio::task::JoinError,
    },

    /// The concurrency limiter was shut down before the task got a slot.
    #[error("concurrency limiter closed")]
    LimiterClosed,
}

/// Error loading a configuration document.
///
/// Out-of-range values are clamped, never reported; only documents that do
/// not parse at all produce this error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document is not valid configuration JSON.
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Error building an engine component.
#[derive(Debug, Error)]
pub enum BuildError {
    /// No runtime handle was supplied and the caller is not inside a tokio
    /// runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}
