//! File-backed record store with compare-and-swap updates

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::record::{Record, now_ms};

/// Errors from store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Version mismatch: expected {expected}, actual {actual}")]
    VersionMismatch { expected: u64, actual: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// File-backed store. One subdirectory per collection, one JSON file per
/// record. Cheap to clone; clones share the lock table.
#[derive(Clone)]
pub struct Store {
    root: PathBuf,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl Store {
    /// Open (or create) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        debug!(root = %root.display(), "Store::open: called");
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a new record. Fails if the id is already present.
    pub async fn create<T: Record>(&self, record: &T) -> Result<(), StoreError> {
        debug!(id = %record.id(), collection = T::collection_name(), "Store::create: called");
        let lock = self.id_lock::<T>(record.id()).await;
        let _guard = lock.lock().await;

        let path = self.record_path::<T>(record.id());
        if path.exists() {
            return Err(StoreError::AlreadyExists(record.id().to_string()));
        }

        let mut fresh = record.clone();
        fresh.touch(now_ms());
        self.write_atomic(&path, &fresh).await
    }

    /// Read a record by id
    pub async fn read<T: Record>(&self, id: &str) -> Result<T, StoreError> {
        let path = self.record_path::<T>(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// List all records in a collection. Ordering unspecified.
    pub async fn list<T: Record>(&self) -> Result<Vec<T>, StoreError> {
        let dir = self.collection_dir::<T>();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A half-written file should not take down the whole scan
                    warn!(path = %path.display(), error = %e, "Skipping unreadable record");
                }
            }
        }
        Ok(records)
    }

    /// Compare-and-swap update.
    ///
    /// Loads the record, verifies `expected_version` against the stored
    /// version, applies `mutator` to a copy, bumps the version by 1, and
    /// persists. The per-id lock is held for the whole window, so exactly
    /// one of any set of concurrent callers with the same expectation wins.
    pub async fn update_cas<T, F>(&self, id: &str, expected_version: u64, mutator: F) -> Result<T, StoreError>
    where
        T: Record,
        F: FnOnce(&mut T),
    {
        debug!(%id, expected_version, collection = T::collection_name(), "Store::update_cas: called");
        let lock = self.id_lock::<T>(id).await;
        let _guard = lock.lock().await;

        let current: T = self.read(id).await?;
        if current.version() != expected_version {
            debug!(%id, actual = current.version(), "Store::update_cas: version mismatch");
            return Err(StoreError::VersionMismatch {
                expected: expected_version,
                actual: current.version(),
            });
        }

        let mut next = current.clone();
        mutator(&mut next);
        next.set_version(expected_version + 1);
        next.touch(now_ms());

        let path = self.record_path::<T>(id);
        self.write_atomic(&path, &next).await?;
        Ok(next)
    }

    /// Delete a record by id
    pub async fn delete<T: Record>(&self, id: &str) -> Result<(), StoreError> {
        debug!(%id, collection = T::collection_name(), "Store::delete: called");
        let lock = self.id_lock::<T>(id).await;
        let _guard = lock.lock().await;

        let path = self.record_path::<T>(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Staged write: temp file in the same directory, fsync, atomic rename
    async fn write_atomic<T: Record>(&self, path: &Path, record: &T) -> Result<(), StoreError> {
        let dir = path.parent().expect("record path has a parent");
        tokio::fs::create_dir_all(dir).await?;

        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &json).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn collection_dir<T: Record>(&self) -> PathBuf {
        self.root.join(T::collection_name())
    }

    fn record_path<T: Record>(&self, id: &str) -> PathBuf {
        self.collection_dir::<T>().join(format!("{}.json", id))
    }

    async fn id_lock<T: Record>(&self, id: &str) -> Arc<Mutex<()>> {
        let key = format!("{}/{}", T::collection_name(), id);
        let mut locks = self.locks.lock().await;
        locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}
