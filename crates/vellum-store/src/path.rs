//! Key-to-path mapping for filesystem-backed stores
//!
//! A [`PathStrategy`] maps blob keys to paths under a root directory,
//! either flat or sharded into subdirectories by key prefix so that large
//! stores do not accumulate millions of entries in one directory. It also
//! hands out temp files in a `tmp/` area on the same volume, so a finished
//! temp file can be published under its final path with one atomic rename.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::StoreError;

/// Directory under the root reserved for in-progress temp files.
pub const TEMP_DIR_NAME: &str = "tmp";

/// Bytes of key prefix consumed per shard directory level.
const SHARD_WIDTH: usize = 2;

/// Maps blob keys to filesystem paths under a root directory.
#[derive(Debug, Clone)]
pub struct PathStrategy {
    root: PathBuf,
    depth: u8,
}

impl PathStrategy {
    /// All blobs directly under the root
    pub fn flat(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            depth: 0,
        }
    }

    /// Blobs sharded into `depth` levels of two-character subdirectories
    pub fn sharded(root: impl Into<PathBuf>, depth: u8) -> Self {
        Self {
            root: root.into(),
            depth,
        }
    }

    /// The root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path a blob with the given key is stored at
    pub fn path_for_key(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        let mut path = self.root.clone();
        let mut rest = key;
        for _ in 0..self.depth {
            // Keys shorter than the shard depth just stop sharding early.
            let Some((prefix, tail)) = split_prefix(rest, SHARD_WIDTH) else {
                break;
            };
            path.push(prefix);
            rest = tail;
        }
        path.push(key);
        Ok(path)
    }

    /// Create a fresh empty temp file in the store's `tmp/` area.
    ///
    /// The temp directory lives on the same volume as the blobs, so a
    /// rename from a temp file to its final path is atomic.
    pub async fn create_temp_file(&self) -> Result<PathBuf, StoreError> {
        let tmp_dir = self.root.join(TEMP_DIR_NAME);
        tokio::fs::create_dir_all(&tmp_dir).await?;

        loop {
            let path = tmp_dir.join(format!("{}.tmp", random_key()));
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => {
                    debug!(path = %path.display(), "created temp file");
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Atomically move a finished file to its final destination,
    /// creating parent shard directories as needed.
    pub async fn atomic_move(&self, src: &Path, dest: &Path) -> Result<(), StoreError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(src, dest).await?;
        Ok(())
    }
}

/// Split off a prefix of up to `width` bytes on a char boundary.
fn split_prefix(s: &str, width: usize) -> Option<(&str, &str)> {
    if s.is_empty() {
        return None;
    }
    let mut end = 0;
    for (i, c) in s.char_indices() {
        if i >= width {
            break;
        }
        end = i + c.len_utf8();
    }
    Some(s.split_at(end))
}

/// Reject keys that could escape the store root or collide with the
/// temp area.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty()
        || key == "."
        || key == ".."
        || key == TEMP_DIR_NAME
        || key.contains(['/', '\\', '\0'])
    {
        return Err(StoreError::invalid_key(key));
    }
    Ok(())
}

/// A random hex key for temp files and staging entries.
pub(crate) fn random_key() -> String {
    format!("{:016x}", rand::random::<u64>())
}
