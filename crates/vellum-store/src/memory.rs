//! In-memory blob store
//!
//! Useful for tests and for embedding a store with no filesystem behind
//! it. Because it exposes no local files and no path strategy, copies
//! out of it exercise the generic streaming path of the destination
//! store.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::blob::{BlobStream, BlobWriteContext};
use crate::digest::{KeySource, WriteObserver};
use crate::error::StoreError;
use crate::path::validate_key;
use crate::FileStore;

/// A blob store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct InMemoryFileStore {
    blobs: DashMap<String, Bytes>,
}

impl InMemoryFileStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Whether a blob exists under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.blobs.contains_key(key)
    }
}

#[async_trait]
impl FileStore for InMemoryFileStore {
    async fn write_file(
        &self,
        ctx: &mut BlobWriteContext,
        mut observer: Option<&mut (dyn WriteObserver + '_)>,
        key: &KeySource,
    ) -> Result<String, StoreError> {
        let mut stream = ctx.open_stream().await?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;
        if let Some(observer) = observer.as_mut() {
            observer.write(&data);
            observer.flush();
        }

        let key = key.resolve(observer.as_deref())?;
        validate_key(&key)?;
        debug!(key = %key, size = data.len(), "stored blob in memory");
        self.blobs.insert(key.clone(), Bytes::from(data));
        Ok(key)
    }

    async fn copy_file(
        &self,
        _key: &str,
        _source: &dyn FileStore,
        _source_key: &str,
        _move_source: bool,
        _atomic: bool,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Unsupported("copy_file on in-memory store"))
    }

    async fn get_local_file(&self, _key: &str) -> Result<Option<PathBuf>, StoreError> {
        Ok(None)
    }

    async fn get_stream(&self, key: &str) -> Result<Option<BlobStream>, StoreError> {
        match self.blobs.get(key) {
            Some(data) => Ok(Some(Box::new(Cursor::new(data.clone())))),
            None => Ok(None),
        }
    }

    async fn read_file_to(&self, key: &str, dest: &Path) -> Result<bool, StoreError> {
        // Clone the bytes out before awaiting; map guards must not be
        // held across await points.
        let data = match self.blobs.get(key) {
            Some(data) => data.clone(),
            None => return Ok(false),
        };
        tokio::fs::write(dest, &data).await?;
        Ok(true)
    }

    async fn delete_file(&self, key: &str) -> Result<(), StoreError> {
        let _ = self.blobs.remove(key);
        Ok(())
    }
}
