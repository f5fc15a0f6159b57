use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cellbox_core::Raw;

use crate::{DeleteStatus, DiskKey, StoreError, StoreLabel};

/// Result type for persistent-tier operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Disk-resident key-value store backing the in-memory tier.
///
/// Implementations only move opaque blobs; encoding is done by the caller
/// with [`ArtifactFormat`](crate::format::ArtifactFormat). Every method is
/// best-effort: the engine logs failures and treats them as misses.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Reads the blob stored under `key`.
    async fn read(&self, key: &DiskKey) -> StoreResult<Option<Raw>>;

    /// Stores `value` under `key`, replacing any previous blob. `ttl` is the
    /// store's own time-to-live for the entry, if it supports one.
    async fn write(&self, key: &DiskKey, value: Raw, ttl: Option<Duration>) -> StoreResult<()>;

    /// Deletes the blob stored under `key`.
    async fn remove(&self, key: &DiskKey) -> StoreResult<DeleteStatus>;

    /// Identifies this store in logs and stats.
    fn label(&self) -> StoreLabel {
        StoreLabel::new_static("store")
    }
}

#[async_trait]
impl PersistentStore for Box<dyn PersistentStore> {
    async fn read(&self, key: &DiskKey) -> StoreResult<Option<Raw>> {
        (**self).read(key).await
    }

    async fn write(&self, key: &DiskKey, value: Raw, ttl: Option<Duration>) -> StoreResult<()> {
        (**self).write(key, value, ttl).await
    }

    async fn remove(&self, key: &DiskKey) -> StoreResult<DeleteStatus> {
        (**self).remove(key).await
    }

    fn label(&self) -> StoreLabel {
        (**self).label()
    }
}

#[async_trait]
impl PersistentStore for Arc<dyn PersistentStore> {
    async fn read(&self, key: &DiskKey) -> StoreResult<Option<Raw>> {
        (**self).read(key).await
    }

    async fn write(&self, key: &DiskKey, value: Raw, ttl: Option<Duration>) -> StoreResult<()> {
        (**self).write(key, value, ttl).await
    }

    async fn remove(&self, key: &DiskKey) -> StoreResult<DeleteStatus> {
        (**self).remove(key).await
    }

    fn label(&self) -> StoreLabel {
        (**self).label()
    }
}
