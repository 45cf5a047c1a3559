//! Transactional blob store layer
//!
//! [`TransactionalFileStore`] pairs a transient store (fast, same-host)
//! with a permanent store. Writes made through a [`TransactionScope`] are
//! staged in the transient store and only moved to the permanent store
//! when the transaction commits; a rollback drops them. Reads through the
//! scope see the transaction's own staged writes and deletes first, then
//! fall through to the permanent store.
//!
//! Two live transactions may not touch the same key: the first write or
//! delete of a key claims it for its transaction, and a second
//! transaction touching the same key gets
//! [`StoreError::ConcurrentUpdate`] immediately rather than at commit.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error, info, instrument};

use crate::blob::{BlobStream, BlobWriteContext};
use crate::digest::{KeySource, WriteObserver};
use crate::error::StoreError;
use crate::path::{random_key, validate_key};
use crate::FileStore;

/// Identifier of one transaction on a [`TransactionalFileStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxId(u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// What a transaction has staged for a key.
#[derive(Debug, Clone)]
enum Staged {
    /// A write, held in the transient store under this key
    Write(String),
    /// A pending delete
    Delete,
}

#[derive(Debug, Default)]
struct TxState {
    staged: Mutex<HashMap<String, Staged>>,
}

/// Outcome of a commit.
///
/// Committing is best-effort per key: once the transaction has decided to
/// commit, a key whose transfer to the permanent store fails is reported
/// here rather than aborting the rest.
#[derive(Debug, Default)]
pub struct CommitReport {
    /// Keys whose staged transient file had disappeared
    pub missing: Vec<String>,
    /// Keys whose transfer to the permanent store failed
    pub failed: Vec<(String, StoreError)>,
}

impl CommitReport {
    /// Whether every staged key made it to the permanent store
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.failed.is_empty()
    }
}

/// Transaction completion hooks.
///
/// A host transaction coordinator drives these when the surrounding
/// transaction completes. [`TransactionalFileStore`] implements them;
/// its inherent [`commit`](TransactionalFileStore::commit) and
/// [`rollback`](TransactionalFileStore::rollback) call straight through
/// for callers managing transactions themselves.
#[async_trait]
pub trait TransactionLifecycle: Send + Sync {
    /// The transaction decided to commit; publish its staged work.
    async fn on_commit(&self, tx: TxId) -> CommitReport;

    /// The transaction rolled back; discard its staged work.
    async fn on_rollback(&self, tx: TxId);
}

/// A store that stages writes per transaction before publishing them.
pub struct TransactionalFileStore {
    transient: Arc<dyn FileStore>,
    permanent: Arc<dyn FileStore>,
    transactions: DashMap<TxId, Arc<TxState>>,
    active_keys: DashMap<String, TxId>,
    next_tx: AtomicU64,
}

impl TransactionalFileStore {
    /// Create a transactional layer over a transient and a permanent
    /// store.
    pub fn new(transient: Arc<dyn FileStore>, permanent: Arc<dyn FileStore>) -> Self {
        Self {
            transient,
            permanent,
            transactions: DashMap::new(),
            active_keys: DashMap::new(),
            next_tx: AtomicU64::new(1),
        }
    }

    /// The permanent store behind this layer
    pub fn permanent(&self) -> &Arc<dyn FileStore> {
        &self.permanent
    }

    /// Start a transaction
    pub fn begin(&self) -> TxId {
        let tx = TxId(self.next_tx.fetch_add(1, Ordering::Relaxed));
        self.transactions.insert(tx, Arc::new(TxState::default()));
        debug!(tx = %tx, "transaction started");
        tx
    }

    /// The store as seen from inside the given transaction
    pub fn scoped(&self, tx: TxId) -> TransactionScope<'_> {
        TransactionScope { store: self, tx }
    }

    /// Commit the transaction, publishing staged writes and deletes to
    /// the permanent store. Committing an unknown or empty transaction
    /// is a no-op with a clean report.
    pub async fn commit(&self, tx: TxId) -> CommitReport {
        self.on_commit(tx).await
    }

    /// Roll back the transaction, discarding its staged work.
    pub async fn rollback(&self, tx: TxId) {
        self.on_rollback(tx).await;
    }

    /// Claim `key` for `tx`, failing when another live transaction
    /// already holds it.
    fn claim_key(&self, key: &str, tx: TxId) -> Result<(), StoreError> {
        match self.active_keys.entry(key.to_string()) {
            Entry::Occupied(entry) if *entry.get() != tx => {
                Err(StoreError::ConcurrentUpdate(key.to_string()))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(entry) => {
                entry.insert(tx);
                Ok(())
            }
        }
    }

    fn release_key(&self, key: &str, tx: TxId) {
        self.active_keys.remove_if(key, |_, owner| *owner == tx);
    }

    /// Record what `tx` staged for `key`, dropping any transient file
    /// the new entry supersedes.
    async fn stage(&self, tx: TxId, key: &str, entry: Staged) {
        let state = self.transactions.entry(tx).or_default().clone();
        let previous = {
            let mut staged = state.staged.lock().unwrap();
            staged.insert(key.to_string(), entry)
        };
        if let Some(Staged::Write(old)) = previous {
            let _ = self.transient.delete_file(&old).await;
        }
    }

    fn staged_for(&self, tx: TxId, key: &str) -> Option<Staged> {
        let state = self.transactions.get(&tx)?;
        let staged = state.staged.lock().unwrap();
        staged.get(key).cloned()
    }
}

#[async_trait]
impl TransactionLifecycle for TransactionalFileStore {
    #[instrument(skip(self))]
    async fn on_commit(&self, tx: TxId) -> CommitReport {
        let Some((_, state)) = self.transactions.remove(&tx) else {
            return CommitReport::default();
        };
        let staged: Vec<(String, Staged)> = state.staged.lock().unwrap().drain().collect();
        let mut report = CommitReport::default();

        for (key, entry) in staged {
            match entry {
                Staged::Delete => {
                    if let Err(e) = self.permanent.delete_file(&key).await {
                        error!(tx = %tx, key = %key, error = %e, "commit-time delete failed");
                        report.failed.push((key.clone(), e));
                    }
                }
                Staged::Write(transient_key) => {
                    match self
                        .permanent
                        .copy_file(&key, self.transient.as_ref(), &transient_key, true, true)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            error!(tx = %tx, key = %key, "staged file missing at commit");
                            report.missing.push(key.clone());
                        }
                        Err(e) => {
                            error!(tx = %tx, key = %key, error = %e, "commit-time copy failed");
                            report.failed.push((key.clone(), e));
                        }
                    }
                }
            }
            self.release_key(&key, tx);
        }
        info!(tx = %tx, clean = report.is_clean(), "transaction committed");
        report
    }

    #[instrument(skip(self))]
    async fn on_rollback(&self, tx: TxId) {
        let Some((_, state)) = self.transactions.remove(&tx) else {
            return;
        };
        let staged: Vec<(String, Staged)> = state.staged.lock().unwrap().drain().collect();
        for (key, entry) in staged {
            if let Staged::Write(transient_key) = entry {
                let _ = self.transient.delete_file(&transient_key).await;
            }
            self.release_key(&key, tx);
        }
        info!(tx = %tx, "transaction rolled back");
    }
}

/// Outside a transaction the store reads and writes the permanent store
/// directly.
#[async_trait]
impl FileStore for TransactionalFileStore {
    async fn write_file(
        &self,
        ctx: &mut BlobWriteContext,
        observer: Option<&mut (dyn WriteObserver + '_)>,
        key: &KeySource,
    ) -> Result<String, StoreError> {
        self.permanent.write_file(ctx, observer, key).await
    }

    async fn copy_file(
        &self,
        _key: &str,
        _source: &dyn FileStore,
        _source_key: &str,
        _move_source: bool,
        _atomic: bool,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Unsupported("copy_file on transactional store"))
    }

    async fn get_local_file(&self, key: &str) -> Result<Option<PathBuf>, StoreError> {
        self.permanent.get_local_file(key).await
    }

    async fn get_stream(&self, key: &str) -> Result<Option<BlobStream>, StoreError> {
        self.permanent.get_stream(key).await
    }

    async fn read_file_to(&self, key: &str, dest: &Path) -> Result<bool, StoreError> {
        self.permanent.read_file_to(key, dest).await
    }

    async fn delete_file(&self, key: &str) -> Result<(), StoreError> {
        self.permanent.delete_file(key).await
    }
}

/// A [`TransactionalFileStore`] as seen from inside one transaction.
pub struct TransactionScope<'a> {
    store: &'a TransactionalFileStore,
    tx: TxId,
}

impl TransactionScope<'_> {
    /// The transaction this scope belongs to
    pub fn tx(&self) -> TxId {
        self.tx
    }
}

#[async_trait]
impl FileStore for TransactionScope<'_> {
    async fn write_file(
        &self,
        ctx: &mut BlobWriteContext,
        mut observer: Option<&mut (dyn WriteObserver + '_)>,
        key: &KeySource,
    ) -> Result<String, StoreError> {
        // Stage into the transient store under a private key first; the
        // final key is only known after the stream has been observed.
        let staging_key = random_key();
        let transient_key = self
            .store
            .transient
            .write_file(ctx, observer.as_deref_mut(), &KeySource::Fixed(staging_key))
            .await?;
        let resolved = key.resolve(observer.as_deref()).and_then(|key| {
            validate_key(&key)?;
            Ok(key)
        });
        let key = match resolved {
            // A staged file must not outlive a failed write.
            Err(e) => {
                let _ = self.store.transient.delete_file(&transient_key).await;
                return Err(e);
            }
            Ok(key) => key,
        };

        if let Err(e) = self.store.claim_key(&key, self.tx) {
            let _ = self.store.transient.delete_file(&transient_key).await;
            return Err(e);
        }
        self.store
            .stage(self.tx, &key, Staged::Write(transient_key))
            .await;
        debug!(tx = %self.tx, key = %key, "staged write");
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
        Err(StoreError::Unsupported("copy_file on transaction scope"))
    }

    async fn get_local_file(&self, key: &str) -> Result<Option<PathBuf>, StoreError> {
        match self.store.staged_for(self.tx, key) {
            Some(Staged::Delete) => Ok(None),
            Some(Staged::Write(transient_key)) => {
                let file = self.store.transient.get_local_file(&transient_key).await?;
                if file.is_none() {
                    error!(tx = %self.tx, key = %key, "staged file missing");
                }
                Ok(file)
            }
            None => self.store.permanent.get_local_file(key).await,
        }
    }

    async fn get_stream(&self, key: &str) -> Result<Option<BlobStream>, StoreError> {
        match self.store.staged_for(self.tx, key) {
            Some(Staged::Delete) => Ok(None),
            Some(Staged::Write(transient_key)) => {
                let stream = self.store.transient.get_stream(&transient_key).await?;
                if stream.is_none() {
                    error!(tx = %self.tx, key = %key, "staged file missing");
                }
                Ok(stream)
            }
            None => self.store.permanent.get_stream(key).await,
        }
    }

    async fn read_file_to(&self, key: &str, dest: &Path) -> Result<bool, StoreError> {
        match self.store.staged_for(self.tx, key) {
            Some(Staged::Delete) => Ok(false),
            Some(Staged::Write(transient_key)) => {
                let found = self
                    .store
                    .transient
                    .read_file_to(&transient_key, dest)
                    .await?;
                if !found {
                    error!(tx = %self.tx, key = %key, "staged file missing");
                }
                Ok(found)
            }
            None => self.store.permanent.read_file_to(key, dest).await,
        }
    }

    /// Stages a delete marker; the permanent blob is only removed when
    /// the transaction commits.
    async fn delete_file(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.store.claim_key(key, self.tx)?;
        self.store.stage(self.tx, key, Staged::Delete).await;
        debug!(tx = %self.tx, key = %key, "staged delete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{Blob, BlobContext};
    use crate::local::LocalFileStore;
    use crate::path::{PathStrategy, TEMP_DIR_NAME};
    use tokio::io::AsyncReadExt;

    fn tx_store(dir: &Path) -> TransactionalFileStore {
        let transient = LocalFileStore::new(PathStrategy::flat(dir.join("transient")));
        let permanent = LocalFileStore::new(PathStrategy::sharded(dir.join("permanent"), 2));
        TransactionalFileStore::new(Arc::new(transient), Arc::new(permanent))
    }

    fn write_ctx(data: &'static [u8]) -> BlobWriteContext {
        BlobWriteContext::new(BlobContext::new(Blob::from_bytes(data), "default"))
    }

    async fn read_all(stream: Option<BlobStream>) -> Option<Vec<u8>> {
        let mut stream = stream?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        Some(buf)
    }

    async fn write(scope: &dyn FileStore, key: &str, data: &'static [u8]) {
        let mut ctx = write_ctx(data);
        scope
            .write_file(&mut ctx, None, &KeySource::Fixed(key.to_string()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_writes_invisible_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = tx_store(dir.path());

        let tx = store.begin();
        write(&store.scoped(tx), "doc-1", b"draft").await;

        // Visible inside the transaction, not outside.
        let scoped = store.scoped(tx);
        assert_eq!(
            read_all(scoped.get_stream("doc-1").await.unwrap()).await,
            Some(b"draft".to_vec())
        );
        assert!(store.get_stream("doc-1").await.unwrap().is_none());

        let report = store.commit(tx).await;
        assert!(report.is_clean());
        assert_eq!(
            read_all(store.get_stream("doc-1").await.unwrap()).await,
            Some(b"draft".to_vec())
        );
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = tx_store(dir.path());

        let tx = store.begin();
        write(&store.scoped(tx), "doc-1", b"draft").await;
        store.rollback(tx).await;

        assert!(store.get_stream("doc-1").await.unwrap().is_none());
        // The key is released for the next transaction.
        let tx2 = store.begin();
        write(&store.scoped(tx2), "doc-1", b"second").await;
        assert!(store.commit(tx2).await.is_clean());
    }

    #[tokio::test]
    async fn test_concurrent_update_detected() {
        let dir = tempfile::tempdir().unwrap();
        let store = tx_store(dir.path());

        let tx1 = store.begin();
        let tx2 = store.begin();
        write(&store.scoped(tx1), "doc-1", b"one").await;

        let mut ctx = write_ctx(b"two");
        let result = store
            .scoped(tx2)
            .write_file(&mut ctx, None, &KeySource::Fixed("doc-1".to_string()))
            .await;
        assert!(matches!(result, Err(StoreError::ConcurrentUpdate(_))));

        // Once tx1 completes, tx2 can claim the key.
        assert!(store.commit(tx1).await.is_clean());
        write(&store.scoped(tx2), "doc-1", b"two").await;
        assert!(store.commit(tx2).await.is_clean());
        assert_eq!(
            read_all(store.get_stream("doc-1").await.unwrap()).await,
            Some(b"two".to_vec())
        );
    }

    #[tokio::test]
    async fn test_staged_delete_masks_permanent_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = tx_store(dir.path());
        write(&store, "doc-1", b"published").await;

        let tx = store.begin();
        let scoped = store.scoped(tx);
        scoped.delete_file("doc-1").await.unwrap();

        // Masked inside the transaction, still live outside.
        assert!(scoped.get_stream("doc-1").await.unwrap().is_none());
        assert!(scoped.get_local_file("doc-1").await.unwrap().is_none());
        assert!(store.get_stream("doc-1").await.unwrap().is_some());

        assert!(store.commit(tx).await.is_clean());
        assert!(store.get_stream("doc-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_tx_rewrite_replaces_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = tx_store(dir.path());

        let tx = store.begin();
        let scoped = store.scoped(tx);
        write(&scoped, "doc-1", b"first").await;
        write(&scoped, "doc-1", b"second").await;

        assert_eq!(
            read_all(scoped.get_stream("doc-1").await.unwrap()).await,
            Some(b"second".to_vec())
        );
        assert!(store.commit(tx).await.is_clean());
        assert_eq!(
            read_all(store.get_stream("doc-1").await.unwrap()).await,
            Some(b"second".to_vec())
        );
    }

    #[tokio::test]
    async fn test_failed_staged_write_cleans_transient_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = tx_store(dir.path());

        let tx = store.begin();
        let scoped = store.scoped(tx);

        let mut ctx = write_ctx(b"orphan");
        let result = scoped
            .write_file(&mut ctx, None, &KeySource::Fixed("bad/key".to_string()))
            .await;
        assert!(matches!(result, Err(StoreError::InvalidKey(_))));

        let mut ctx = write_ctx(b"orphan");
        let result = scoped.write_file(&mut ctx, None, &KeySource::FromObserver).await;
        assert!(matches!(result, Err(StoreError::MissingKey)));

        // Nothing stays behind in the transient store.
        let mut entries = tokio::fs::read_dir(dir.path().join("transient")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert_eq!(entry.file_name(), TEMP_DIR_NAME);
        }
        store.rollback(tx).await;
    }

    #[tokio::test]
    async fn test_commit_reports_missing_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = tx_store(dir.path());

        let tx = store.begin();
        write(&store.scoped(tx), "doc-1", b"draft").await;

        // Sabotage the transient store behind the transaction's back.
        let staged = match store.staged_for(tx, "doc-1").unwrap() {
            Staged::Write(transient_key) => transient_key,
            Staged::Delete => unreachable!(),
        };
        store.transient.delete_file(&staged).await.unwrap();

        let report = store.commit(tx).await;
        assert_eq!(report.missing, vec!["doc-1".to_string()]);
        assert!(!report.is_clean());
        assert!(store.get_stream("doc-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_of_unknown_transaction_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = tx_store(dir.path());

        let tx = store.begin();
        assert!(store.commit(tx).await.is_clean());
        // A second completion of the same transaction has nothing to do.
        assert!(store.commit(tx).await.is_clean());
        store.rollback(tx).await;
    }

    #[tokio::test]
    async fn test_reads_fall_through_to_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let store = tx_store(dir.path());
        write(&store, "doc-1", b"published").await;

        let tx = store.begin();
        let scoped = store.scoped(tx);
        assert_eq!(
            read_all(scoped.get_stream("doc-1").await.unwrap()).await,
            Some(b"published".to_vec())
        );

        let dest = dir.path().join("out.bin");
        assert!(scoped.read_file_to("doc-1", &dest).await.unwrap());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"published");
        store.rollback(tx).await;
    }
}
