//! Blob data and write-request contexts
//!
//! A [`Blob`] is a source of bytes to store, either already in memory or
//! sitting in a local file. [`BlobContext`] bundles the blob with the
//! document identity it is being written for, and [`BlobWriteContext`]
//! carries that bundle through a write, letting intermediate store layers
//! substitute an already-materialized local file for the original byte
//! source.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::error::StoreError;

/// The only xpath at which record-mode stores accept blobs.
pub const MAIN_BLOB_XPATH: &str = "content";

/// A readable stream of blob bytes.
pub type BlobStream = Box<dyn AsyncRead + Send + Unpin>;

/// A source of blob bytes.
#[derive(Debug, Clone)]
pub enum Blob {
    /// Bytes already in memory
    Bytes(Bytes),
    /// Bytes in a local file
    File(PathBuf),
}

impl Blob {
    /// Create a blob from in-memory bytes
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::Bytes(data.into())
    }

    /// Create a blob backed by a local file
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    /// Open a fresh stream over the blob's bytes
    pub async fn open(&self) -> Result<BlobStream, StoreError> {
        match self {
            Self::Bytes(data) => Ok(Box::new(Cursor::new(data.clone()))),
            Self::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::new(file))
            }
        }
    }

    /// Size of the blob in bytes, if cheaply known
    pub async fn size_hint(&self) -> Option<u64> {
        match self {
            Self::Bytes(data) => Some(data.len() as u64),
            Self::File(path) => tokio::fs::metadata(path).await.ok().map(|m| m.len()),
        }
    }
}

/// Identity of a blob write: which document, in which repository, at which
/// xpath the blob is being attached.
#[derive(Debug, Clone)]
pub struct BlobContext {
    /// The blob to store
    pub blob: Blob,
    /// Repository name
    pub repository: String,
    /// Document id, when the write is attached to a document
    pub doc_id: Option<String>,
    /// Version series id, when the document is versioned
    pub version_series_id: Option<String>,
    /// Property xpath the blob lives at
    pub xpath: Option<String>,
}

impl BlobContext {
    /// Context for a blob with no document attached
    pub fn new(blob: Blob, repository: impl Into<String>) -> Self {
        Self {
            blob,
            repository: repository.into(),
            doc_id: None,
            version_series_id: None,
            xpath: None,
        }
    }

    /// Context for a blob attached to a document's main content
    pub fn for_document(
        blob: Blob,
        repository: impl Into<String>,
        doc_id: impl Into<String>,
    ) -> Self {
        Self {
            blob,
            repository: repository.into(),
            doc_id: Some(doc_id.into()),
            version_series_id: None,
            xpath: Some(MAIN_BLOB_XPATH.to_string()),
        }
    }

    /// Set the property xpath
    pub fn with_xpath(mut self, xpath: impl Into<String>) -> Self {
        self.xpath = Some(xpath.into());
        self
    }

    /// Set the version series id
    pub fn with_version_series(mut self, id: impl Into<String>) -> Self {
        self.version_series_id = Some(id.into());
        self
    }
}

/// A blob write in flight.
///
/// Wraps the [`BlobContext`] and optionally a local file that holds the
/// blob's bytes. When a store layer has already written the bytes to disk
/// (a caching layer staging into its cache, say), it records the file here
/// so that layers below read from that file instead of re-consuming the
/// original source.
#[derive(Debug)]
pub struct BlobWriteContext {
    context: BlobContext,
    file: Option<PathBuf>,
}

impl BlobWriteContext {
    /// Start a write for the given context
    pub fn new(context: BlobContext) -> Self {
        Self {
            context,
            file: None,
        }
    }

    /// The identity bundle for this write
    pub fn blob_context(&self) -> &BlobContext {
        &self.context
    }

    /// The local file holding the bytes, if a layer has materialized one
    pub fn local_file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Record a local file holding the blob's bytes
    pub fn set_local_file(&mut self, path: impl Into<PathBuf>) {
        self.file = Some(path.into());
    }

    /// Open a stream over the bytes to write.
    ///
    /// Reads from the materialized local file when one is set, otherwise
    /// from the original blob.
    pub async fn open_stream(&self) -> Result<BlobStream, StoreError> {
        match &self.file {
            Some(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::new(file))
            }
            None => self.context.blob.open().await,
        }
    }

    /// Size of the bytes to write, if cheaply known
    pub async fn size_hint(&self) -> Option<u64> {
        match &self.file {
            Some(path) => tokio::fs::metadata(path).await.ok().map(|m| m.len()),
            None => self.context.blob.size_hint().await,
        }
    }
}
