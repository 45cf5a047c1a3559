//! # Vellum Store
//!
//! Layered blob storage for the Vellum document management system.
//!
//! ## Features
//!
//! - **Pluggable stores**: every layer implements the [`FileStore`] trait,
//!   so local disk, caching and transactional behavior compose freely
//! - **Atomic local writes**: [`LocalFileStore`] streams to a temp file on
//!   the store's volume and publishes with a single rename
//! - **Content-addressed keys**: a [`DigestWriter`] observes the write
//!   stream and derives the blob key from its digest in one pass
//! - **Bounded caching**: [`CachingFileStore`] keeps hot blobs in a local
//!   LRU file cache in front of a slower backing store
//! - **Transactional staging**: [`TransactionalFileStore`] stages writes
//!   in a transient store and moves them to the permanent store on commit,
//!   detecting concurrent updates to the same key
//!
//! ## Example
//!
//! ```no_run
//! use vellum_store::{
//!     Blob, BlobContext, DigestAlgorithm, FileStore, LocalFileStore, PathStrategy, WriteMode,
//! };
//!
//! # async fn example() -> Result<(), vellum_store::StoreError> {
//! let store = LocalFileStore::new(PathStrategy::sharded("/data/blobs", 2));
//!
//! let ctx = BlobContext::new(Blob::from_bytes(&b"hello"[..]), "default");
//! let key = store
//!     .write_blob(ctx, WriteMode::Digest(DigestAlgorithm::Sha256))
//!     .await?;
//!
//! let found = store.get_stream(&key).await?.is_some();
//! assert!(found);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;

pub mod blob;
pub mod cache;
pub mod digest;
pub mod error;
pub mod local;
pub mod memory;
pub mod path;
pub mod transact;

pub use blob::{Blob, BlobContext, BlobStream, BlobWriteContext, MAIN_BLOB_XPATH};
pub use cache::{CacheConfig, CachingFileStore};
pub use digest::{DigestAlgorithm, DigestWriter, KeySource, WriteObserver};
pub use error::StoreError;
pub use local::LocalFileStore;
pub use memory::InMemoryFileStore;
pub use path::PathStrategy;
pub use transact::{
    CommitReport, TransactionLifecycle, TransactionScope, TransactionalFileStore, TxId,
};

/// How a store derives blob keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Keys name document records; one mutable blob per document
    Record,
    /// Keys are content digests; blobs are immutable and deduplicated
    Digest(DigestAlgorithm),
}

/// A keyed blob store.
///
/// Implementations store immutable byte payloads under string keys. The
/// low-level operations (`write_file`, `get_stream`, ...) move bytes; the
/// provided [`write_blob`](FileStore::write_blob) and
/// [`delete_blob`](FileStore::delete_blob) methods layer the key policy
/// ([`WriteMode`]) on top.
///
/// `delete_file` is best-effort: I/O failures are logged and swallowed so
/// that cleanup paths never mask the error that triggered them. It still
/// returns a `Result` because some layers must surface contract
/// violations, a concurrent update in a transactional store for one.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Write a blob's bytes under a key.
    ///
    /// Streams the bytes from `ctx`, feeding every chunk to `observer`
    /// (when given) and flushing it after the last one, then resolves the
    /// final key from `key` and publishes the bytes under it. Returns the
    /// resolved key. A failed write leaves no artifact under the final
    /// key.
    async fn write_file(
        &self,
        ctx: &mut BlobWriteContext,
        observer: Option<&mut (dyn WriteObserver + '_)>,
        key: &KeySource,
    ) -> Result<String, StoreError>;

    /// Copy (or move) a blob from another store into this one.
    ///
    /// Returns `Ok(false)` when `source_key` does not exist in `source`.
    /// With `move_source` the source blob is deleted once the copy is
    /// complete; with `atomic` the blob never appears under `key` in a
    /// partially-written state.
    async fn copy_file(
        &self,
        key: &str,
        source: &dyn FileStore,
        source_key: &str,
        move_source: bool,
        atomic: bool,
    ) -> Result<bool, StoreError>;

    /// The local file holding the blob, when this store keeps blobs as
    /// directly readable files. `Ok(None)` when the blob is absent or the
    /// store has no local files.
    async fn get_local_file(&self, key: &str) -> Result<Option<PathBuf>, StoreError>;

    /// A stream over the blob's bytes, or `Ok(None)` when absent.
    async fn get_stream(&self, key: &str) -> Result<Option<BlobStream>, StoreError>;

    /// Copy the blob's bytes to a local destination file.
    ///
    /// Returns `Ok(false)` when the blob is absent.
    async fn read_file_to(&self, key: &str, dest: &Path) -> Result<bool, StoreError>;

    /// Delete the blob under `key`, best-effort. Deleting an absent key
    /// is not an error.
    async fn delete_file(&self, key: &str) -> Result<(), StoreError>;

    /// Write a blob, deriving its key per `mode`.
    ///
    /// In [`WriteMode::Record`] the key names the document record
    /// (see [`record_key`](FileStore::record_key)) and the context must
    /// target the main `content` xpath. In [`WriteMode::Digest`] the key
    /// is the hex content digest computed while streaming.
    async fn write_blob(&self, ctx: BlobContext, mode: WriteMode) -> Result<String, StoreError> {
        match mode {
            WriteMode::Record => {
                check_main_xpath(&ctx)?;
                let key = self.record_key(&ctx)?;
                let mut write = BlobWriteContext::new(ctx);
                self.write_file(&mut write, None, &KeySource::Fixed(key))
                    .await
            }
            WriteMode::Digest(algorithm) => {
                let mut write = BlobWriteContext::new(ctx);
                let mut observer = DigestWriter::new(algorithm);
                self.write_file(&mut write, Some(&mut observer), &KeySource::FromObserver)
                    .await
            }
        }
    }

    /// Delete the record-mode blob for a document.
    async fn delete_blob(&self, ctx: &BlobContext) -> Result<(), StoreError> {
        check_main_xpath(ctx)?;
        let key = self.record_key(ctx)?;
        self.delete_file(&key).await
    }

    /// The record-mode key for a document context. Defaults to the
    /// document id.
    fn record_key(&self, ctx: &BlobContext) -> Result<String, StoreError> {
        ctx.doc_id.clone().ok_or(StoreError::MissingDocId)
    }

    /// The key→path mapping, when this store is directly backed by a
    /// filesystem directory. Lets a copy between two such stores use
    /// filesystem renames instead of streaming.
    fn path_strategy(&self) -> Option<&PathStrategy> {
        None
    }
}

fn check_main_xpath(ctx: &BlobContext) -> Result<(), StoreError> {
    match ctx.xpath.as_deref() {
        Some(MAIN_BLOB_XPATH) => Ok(()),
        other => Err(StoreError::InvalidXpath(
            other.unwrap_or_default().to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filestore_is_object_safe() {
        fn assert_object_safe(_: &dyn FileStore) {}
        let _ = assert_object_safe;
    }

    #[test]
    fn test_main_xpath_check() {
        let ctx = BlobContext::for_document(Blob::from_bytes(&b"x"[..]), "default", "doc-1");
        assert!(check_main_xpath(&ctx).is_ok());

        let ctx = ctx.with_xpath("files/0/file");
        assert!(matches!(
            check_main_xpath(&ctx),
            Err(StoreError::InvalidXpath(_))
        ));

        // An absent xpath is rejected too; only the main content slot
        // takes record-mode blobs.
        let ctx = BlobContext::new(Blob::from_bytes(&b"x"[..]), "default");
        assert!(matches!(
            check_main_xpath(&ctx),
            Err(StoreError::InvalidXpath(_))
        ));
    }
}
