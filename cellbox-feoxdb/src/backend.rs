use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use cellbox_backend::{DeleteStatus, DiskKey, PersistentStore, StoreError, StoreLabel, StoreResult};
use cellbox_core::Raw;
use feoxdb::{FeoxError, FeoxStore};
use tracing::debug;

use crate::FeOxDbError;

/// Disk-based persistent tier using FeOxDB.
///
/// Use this when artifacts must survive restarts or do not fit the
/// in-memory budget. Entries carry a per-key TTL so the disk tier expires
/// independently of the memory tier.
///
/// ```no_run
/// use cellbox_feoxdb::FeOxDbStore;
///
/// let store = FeOxDbStore::builder()
///     .path("/var/cache/worldgen")
///     .max_file_size(10 * 1024 * 1024 * 1024)  // 10 GB
///     .max_memory(256 * 1024 * 1024)           // 256 MB
///     .build()?;
/// # Ok::<(), cellbox_feoxdb::FeOxDbError>(())
/// ```
///
/// Cloning is cheap: clones share the same underlying database.
#[derive(Clone)]
pub struct FeOxDbStore {
    store: Arc<FeoxStore>,
    default_ttl: Option<Duration>,
    label: StoreLabel,
}

impl std::fmt::Debug for FeOxDbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeOxDbStore")
            .field("label", &self.label)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl FeOxDbStore {
    /// Starts building a new store.
    pub fn builder() -> FeOxDbStoreBuilder {
        FeOxDbStoreBuilder::default()
    }

    /// In-memory store for tests.
    ///
    /// Data is lost when dropped. Equivalent to `builder().build()`.
    pub fn in_memory() -> Result<Self, FeOxDbError> {
        Self::builder().build()
    }

    /// Forces pending writes to disk.
    ///
    /// FeOxDB buffers writes and flushes them periodically (~100ms). No-op
    /// in memory-only mode.
    pub fn flush(&self) {
        self.store.flush();
    }
}

/// Builder for [`FeOxDbStore`].
pub struct FeOxDbStoreBuilder {
    path: Option<PathBuf>,
    max_file_size: Option<u64>,
    max_memory: Option<usize>,
    default_ttl: Option<Duration>,
    label: StoreLabel,
}

impl Default for FeOxDbStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            max_file_size: None,
            max_memory: None,
            default_ttl: None,
            label: StoreLabel::new_static("feoxdb"),
        }
    }
}

impl FeOxDbStoreBuilder {
    /// Enables persistent storage at the given path.
    ///
    /// Without this, data lives only in memory and is lost on restart.
    /// If path is a directory, creates `cells.db` inside it.
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Pre-allocates disk space and caps maximum storage.
    ///
    /// Writes fail once the file is full; the engine logs the failure and
    /// keeps serving from memory. Ignored in memory-only mode.
    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = Some(bytes);
        self
    }

    /// Limits RAM used by the store itself.
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = Some(bytes);
        self
    }

    /// TTL applied to writes that do not carry their own.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Identifies this store in logs and stats.
    pub fn label(mut self, label: impl Into<StoreLabel>) -> Self {
        self.label = label.into();
        self
    }

    /// Opens the store.
    ///
    /// Fails if the database file can't be opened or created.
    pub fn build(self) -> Result<FeOxDbStore, FeOxDbError> {
        if self.max_file_size == Some(0) {
            return Err(FeOxDbError::InvalidConfig(
                "max_file_size must be greater than zero".to_owned(),
            ));
        }

        let mut builder = FeoxStore::builder().enable_ttl(true);

        if let Some(mut path) = self.path {
            if path.is_dir() {
                path.push("cells.db");
            }
            let path_str = path.to_string_lossy().to_string();
            builder = builder.device_path(path_str);
        }

        if let Some(file_size) = self.max_file_size {
            builder = builder.file_size(file_size);
        }

        if let Some(memory) = self.max_memory {
            builder = builder.max_memory(memory);
        }

        let store = builder.build()?;

        Ok(FeOxDbStore {
            store: Arc::new(store),
            default_ttl: self.default_ttl,
            label: self.label,
        })
    }
}

/// FeOxDB expires at whole-second granularity; never round a live TTL down
/// to zero.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl PersistentStore for FeOxDbStore {
    async fn read(&self, key: &DiskKey) -> StoreResult<Option<Raw>> {
        let store = self.store.clone();
        let key_bytes = key.as_bytes().to_vec();

        tokio::task::spawn_blocking(move || match store.get(&key_bytes) {
            Ok(encoded) => Ok(Some(Raw::from(encoded))),
            Err(FeoxError::KeyNotFound) => Ok(None),
            Err(e) => Err(StoreError::internal(e)),
        })
        .await
        .map_err(StoreError::internal)?
    }

    async fn write(&self, key: &DiskKey, value: Raw, ttl: Option<Duration>) -> StoreResult<()> {
        let store = self.store.clone();
        let key_bytes = key.as_bytes().to_vec();
        let ttl = ttl.or(self.default_ttl);

        tokio::task::spawn_blocking(move || {
            ttl.map(ttl_secs)
                .map(|secs| store.insert_with_ttl(&key_bytes, &value, secs))
                .unwrap_or_else(|| store.insert(&key_bytes, &value))
                .map_err(StoreError::internal)?;
            Ok(())
        })
        .await
        .map_err(StoreError::internal)?
    }

    async fn remove(&self, key: &DiskKey) -> StoreResult<DeleteStatus> {
        let store = self.store.clone();
        let key_bytes = key.as_bytes().to_vec();
        let label = self.label.clone();

        tokio::task::spawn_blocking(move || {
            if !store.contains_key(&key_bytes) {
                return Ok(DeleteStatus::Missing);
            }
            store.delete(&key_bytes).map_err(StoreError::internal)?;
            debug!(store = %label, "deleted persisted entry");
            Ok(DeleteStatus::Deleted(1))
        })
        .await
        .map_err(StoreError::internal)?
    }

    fn label(&self) -> StoreLabel {
        self.label.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellbox_core::{CellKey, ContextId, Coord};
    use tempfile::TempDir;

    fn disk_key(x: i32) -> DiskKey {
        DiskKey::from_cell(&CellKey::new(
            "heightmap",
            ContextId::from_raw(1),
            Coord::new("overworld", x, 0),
        ))
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let store = FeOxDbStore::builder().path(temp_dir.path()).build().unwrap();

        store
            .write(&disk_key(1), Raw::from_static(b"cell"), Some(Duration::from_secs(3600)))
            .await
            .unwrap();

        let result = store.read(&disk_key(1)).await.unwrap();
        assert_eq!(result.as_deref(), Some(&b"cell"[..]));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = FeOxDbStore::in_memory().unwrap();

        store
            .write(&disk_key(2), Raw::from_static(b"cell"), None)
            .await
            .unwrap();

        let status = store.remove(&disk_key(2)).await.unwrap();
        assert_eq!(status, DeleteStatus::Deleted(1));
        assert!(store.read(&disk_key(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let store = FeOxDbStore::in_memory().unwrap();
        let status = store.remove(&disk_key(3)).await.unwrap();
        assert_eq!(status, DeleteStatus::Missing);
    }

    #[tokio::test]
    async fn test_read_nonexistent() {
        let store = FeOxDbStore::in_memory().unwrap();
        assert!(store.read(&disk_key(4)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clone_shares_store() {
        let store1 = FeOxDbStore::in_memory().unwrap();
        let store2 = store1.clone();

        store1
            .write(&disk_key(5), Raw::from_static(b"shared"), None)
            .await
            .unwrap();

        let result = store2.read(&disk_key(5)).await.unwrap();
        assert_eq!(result.as_deref(), Some(&b"shared"[..]));
    }

    #[tokio::test]
    async fn test_flush_persists_data() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("cells.db");

        {
            let store = FeOxDbStore::builder().path(temp_dir.path()).build().unwrap();
            store
                .write(&disk_key(6), Raw::from_static(b"persist"), None)
                .await
                .unwrap();
            store.flush();
        }

        let store = FeOxDbStore::builder().path(&db_path).build().unwrap();
        let result = store.read(&disk_key(6)).await.unwrap();
        assert_eq!(result.as_deref(), Some(&b"persist"[..]));
    }

    #[test]
    fn test_zero_file_size_is_rejected() {
        let result = FeOxDbStore::builder().max_file_size(0).build();
        assert!(matches!(result, Err(FeOxDbError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_with_label() {
        let store = FeOxDbStore::builder().label("disk").build().unwrap();
        assert_eq!(store.label().as_str(), "disk");
    }

    #[test]
    fn sub_second_ttl_rounds_up() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(90)), 90);
    }
}
