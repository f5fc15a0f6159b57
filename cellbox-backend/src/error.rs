//! Error types for persistent-tier operations.

use thiserror::Error;

/// Error type for persistent-tier operations.
///
/// None of these ever reach the in-memory path: the engine logs them and
/// treats the operation as a miss.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Internal store error, state or computation error.
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),

    /// Reading or writing the underlying medium failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Serializing or deserializing an artifact failed.
    #[error(transparent)]
    Format(#[from] FormatError),
}

impl StoreError {
    /// Wraps any error as [`StoreError::Internal`].
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(Box::new(err))
    }
}

/// Error type for artifact encoding.
#[derive(Debug, Error)]
pub enum FormatError {
    /// Encoding an artifact failed.
    #[error("failed to serialize artifact: {0}")]
    Serialize(Box<dyn std::error::Error + Send + Sync>),

    /// Decoding bytes failed.
    #[error("failed to deserialize artifact: {0}")]
    Deserialize(Box<dyn std::error::Error + Send + Sync>),

    /// The bytes decoded but do not describe a valid entry.
    #[error("corrupt persisted entry: {0}")]
    Corrupt(String),
}
