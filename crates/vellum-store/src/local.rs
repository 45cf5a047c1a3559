//! Filesystem-backed blob store
//!
//! [`LocalFileStore`] keeps each blob as one file under a
//! [`PathStrategy`]. Writes stream into a temp file on the same volume
//! and publish with an atomic rename, so readers never observe a
//! partially-written blob and a failed write leaves nothing under the
//! final key.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, instrument, warn};

use crate::blob::{BlobStream, BlobWriteContext};
use crate::digest::{KeySource, WriteObserver};
use crate::error::StoreError;
use crate::path::PathStrategy;
use crate::FileStore;

const MIN_BUF_SIZE: usize = 8 * 1024;
const MAX_BUF_SIZE: usize = 64 * 1024;

/// A blob store over a local directory.
#[derive(Debug)]
pub struct LocalFileStore {
    paths: PathStrategy,
}

impl LocalFileStore {
    /// Create a store over the given key→path mapping
    pub fn new(paths: PathStrategy) -> Self {
        Self { paths }
    }

    /// The store's key→path mapping
    pub fn paths(&self) -> &PathStrategy {
        &self.paths
    }

    /// Pick a transfer buffer size from the blob's size hint, between
    /// 8 KiB and 64 KiB.
    fn buffer_size_for(size_hint: Option<u64>) -> usize {
        match size_hint {
            None | Some(0) => MAX_BUF_SIZE,
            Some(size) => (size as usize).clamp(MIN_BUF_SIZE, MAX_BUF_SIZE),
        }
    }

    /// Stream the write context's bytes into `dest`, feeding each chunk
    /// to the observer and flushing it after the last one. Returns the
    /// byte count.
    pub(crate) async fn transfer(
        ctx: &BlobWriteContext,
        dest: &Path,
        mut observer: Option<&mut (dyn WriteObserver + '_)>,
    ) -> Result<u64, StoreError> {
        let mut stream = ctx.open_stream().await?;
        let mut out = tokio::fs::File::create(dest).await?;
        let mut buf = vec![0u8; Self::buffer_size_for(ctx.size_hint().await)];
        let mut total = 0u64;

        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).await?;
            if let Some(observer) = observer.as_mut() {
                observer.write(&buf[..n]);
            }
            total += n as u64;
        }
        if let Some(observer) = observer.as_mut() {
            observer.flush();
        }

        out.flush().await?;
        out.sync_all().await?;
        Ok(total)
    }

    async fn copy_local(
        &self,
        dest: &Path,
        src: &Path,
        move_source: bool,
        atomic: bool,
    ) -> Result<bool, StoreError> {
        match tokio::fs::metadata(src).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if move_source {
            // Same-volume moves are a single rename; fall back to
            // copy-then-delete across volumes.
            match tokio::fs::rename(src, dest).await {
                Ok(()) => return Ok(true),
                Err(e) => {
                    debug!(error = %e, "rename failed, falling back to copy");
                }
            }
        }

        if atomic {
            let tmp = self.paths.create_temp_file().await?;
            let copied = tokio::fs::copy(src, &tmp).await;
            match copied {
                Ok(_) => self.paths.atomic_move(&tmp, dest).await?,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(e.into());
                }
            }
        } else {
            tokio::fs::copy(src, dest).await?;
        }

        if move_source {
            let _ = tokio::fs::remove_file(src).await;
        }
        Ok(true)
    }

    async fn copy_generic(
        &self,
        dest: &Path,
        source: &dyn FileStore,
        source_key: &str,
        move_source: bool,
        atomic: bool,
    ) -> Result<bool, StoreError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = if atomic {
            Some(self.paths.create_temp_file().await?)
        } else {
            None
        };
        let read_to: &Path = match &tmp {
            Some(tmp) => tmp,
            None => dest,
        };

        let found = match source.get_local_file(source_key).await? {
            Some(local) => match tokio::fs::copy(&local, read_to).await {
                Ok(_) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => {
                    if let Some(tmp) = &tmp {
                        let _ = tokio::fs::remove_file(tmp).await;
                    }
                    return Err(e.into());
                }
            },
            None => source.read_file_to(source_key, read_to).await?,
        };

        if !found {
            if let Some(tmp) = &tmp {
                let _ = tokio::fs::remove_file(tmp).await;
            }
            return Ok(false);
        }
        if let Some(tmp) = &tmp {
            self.paths.atomic_move(tmp, dest).await?;
        }
        if move_source {
            source.delete_file(source_key).await?;
        }
        Ok(true)
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    #[instrument(skip_all, fields(root = %self.paths.root().display()))]
    async fn write_file(
        &self,
        ctx: &mut BlobWriteContext,
        mut observer: Option<&mut (dyn WriteObserver + '_)>,
        key: &KeySource,
    ) -> Result<String, StoreError> {
        let tmp = self.paths.create_temp_file().await?;
        let result = async {
            let size = Self::transfer(ctx, &tmp, observer.as_deref_mut()).await?;
            let key = key.resolve(observer.as_deref())?;
            let dest = self.paths.path_for_key(&key)?;
            self.paths.atomic_move(&tmp, &dest).await?;
            debug!(key = %key, size, "stored blob");
            Ok(key)
        }
        .await;

        // The temp file is gone on success; only failed writes leave one.
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %e, "failed to remove temp file");
            }
        }
        result
    }

    async fn copy_file(
        &self,
        key: &str,
        source: &dyn FileStore,
        source_key: &str,
        move_source: bool,
        atomic: bool,
    ) -> Result<bool, StoreError> {
        let dest = self.paths.path_for_key(key)?;
        match source.path_strategy() {
            Some(src_paths) => {
                let src = src_paths.path_for_key(source_key)?;
                self.copy_local(&dest, &src, move_source, atomic).await
            }
            None => {
                self.copy_generic(&dest, source, source_key, move_source, atomic)
                    .await
            }
        }
    }

    async fn get_local_file(&self, key: &str) -> Result<Option<PathBuf>, StoreError> {
        let path = self.paths.path_for_key(key)?;
        if tokio::fs::try_exists(&path).await? {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }

    async fn get_stream(&self, key: &str) -> Result<Option<BlobStream>, StoreError> {
        let path = self.paths.path_for_key(key)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_file_to(&self, key: &str, dest: &Path) -> Result<bool, StoreError> {
        let path = self.paths.path_for_key(key)?;
        match tokio::fs::copy(&path, dest).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, key: &str) -> Result<(), StoreError> {
        let path = self.paths.path_for_key(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                error!(key = %key, error = %e, "failed to delete blob file");
            }
        }
        Ok(())
    }

    fn path_strategy(&self) -> Option<&PathStrategy> {
        Some(&self.paths)
    }
}
