//! Durable storage of batch and batch order snapshots.
//!
//! [`BlobPersistence`] is the byte-oriented adapter contract; the typed
//! [`SnapshotStore`] encodes snapshots as JSON under a per-type key prefix.
//! Snapshots that no longer decode are logged and skipped, while adapter I/O
//! failures always propagate.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{error, warn};
use uuid::Uuid;

use super::model::{Batch, BatchOrder};
use crate::error::PersistenceError;

#[async_trait]
pub trait BlobPersistence: Send + Sync {
    async fn put_blob(&self, key: &str, blob: Vec<u8>) -> Result<(), PersistenceError>;

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;

    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>, PersistenceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobPersistence for InMemoryBlobStore {
    async fn put_blob(&self, key: &str, blob: Vec<u8>) -> Result<(), PersistenceError> {
        self.blobs.write().await.insert(key.to_string(), blob);
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>, PersistenceError> {
        Ok(self
            .blobs
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, blob)| blob.clone())
            .collect())
    }
}

/// Stores each blob as one file in a directory.
#[derive(Debug, Clone)]
pub struct DirectoryBlobStore {
    root: PathBuf,
}

impl DirectoryBlobStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn file_name(key: &str) -> String {
        key.replace([':', '/', '\\'], "_")
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.blob", Self::file_name(key)))
    }
}

#[async_trait]
impl BlobPersistence for DirectoryBlobStore {
    async fn put_blob(&self, key: &str, blob: Vec<u8>) -> Result<(), PersistenceError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, blob).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>, PersistenceError> {
        let prefix = Self::file_name(prefix);
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&prefix) && name.ends_with(".blob") {
                names.push(entry.path());
            }
        }
        names.sort();

        let mut blobs = Vec::with_capacity(names.len());
        for path in names {
            blobs.push(tokio::fs::read(path).await?);
        }
        Ok(blobs)
    }
}

/// A snapshot type stored under its own key prefix.
pub trait Snapshot: Serialize + DeserializeOwned + Send + Sync {
    const PREFIX: &'static str;
    const KIND: &'static str;
}

impl Snapshot for Batch {
    const PREFIX: &'static str = "batch:";
    const KIND: &'static str = "batch";
}

impl Snapshot for BatchOrder {
    const PREFIX: &'static str = "order:";
    const KIND: &'static str = "batch order";
}

pub struct SnapshotStore<T> {
    blobs: Arc<dyn BlobPersistence>,
    _marker: PhantomData<fn() -> T>,
}

pub type BatchStore = SnapshotStore<Batch>;
pub type BatchOrderStore = SnapshotStore<BatchOrder>;

impl<T> Clone for SnapshotStore<T> {
    fn clone(&self) -> Self {
        Self {
            blobs: Arc::clone(&self.blobs),
            _marker: PhantomData,
        }
    }
}

impl<T: Snapshot> SnapshotStore<T> {
    pub fn new(blobs: Arc<dyn BlobPersistence>) -> Self {
        Self {
            blobs,
            _marker: PhantomData,
        }
    }

    fn key(id: Uuid) -> String {
        format!("{}{id}", T::PREFIX)
    }

    fn decode(key: &str, blob: &[u8]) -> Result<T, PersistenceError> {
        serde_json::from_slice(blob).map_err(|source| PersistenceError::Corrupt {
            key: key.to_string(),
            source,
        })
    }

    pub async fn save(&self, id: Uuid, snapshot: &T) -> Result<(), PersistenceError> {
        let blob = serde_json::to_vec(snapshot).map_err(PersistenceError::Encode)?;
        self.blobs.put_blob(&Self::key(id), blob).await.inspect_err(|e| {
            error!(kind = T::KIND, %id, error = %e, "cannot save snapshot");
        })
    }

    pub async fn find(&self, id: Uuid) -> Result<Option<T>, PersistenceError> {
        let key = Self::key(id);
        let Some(blob) = self.blobs.get_blob(&key).await? else {
            return Ok(None);
        };
        match Self::decode(&key, &blob) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!(kind = T::KIND, error = %e, "stored snapshot could not be parsed");
                Ok(None)
            }
        }
    }

    pub async fn find_all(&self) -> Result<Vec<T>, PersistenceError> {
        let blobs = self.blobs.find_by_prefix(T::PREFIX).await?;
        Ok(blobs
            .iter()
            .filter_map(|blob| match Self::decode(T::PREFIX, blob) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(kind = T::KIND, error = %e, "skipping corrupt snapshot");
                    None
                }
            })
            .collect())
    }
}
