//! Content digests and write observation
//!
//! Digest-mode stores derive a blob's key from its content. The
//! [`DigestWriter`] observer hashes the bytes as they stream through a
//! write, so the store never needs a second pass over the data, and the
//! final key is read back from the observer once the stream is flushed.

use std::fmt;
use std::str::FromStr;

use sha2::Digest as _;

use crate::error::StoreError;

/// Digest algorithms a store can derive keys with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    /// SHA-256, the default
    #[default]
    Sha256,
    /// SHA-512
    Sha512,
    /// BLAKE3
    Blake3,
}

impl FromStr for DigestAlgorithm {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha-256" | "sha256" => Ok(Self::Sha256),
            "sha-512" | "sha512" => Ok(Self::Sha512),
            "blake3" => Ok(Self::Blake3),
            _ => Err(StoreError::UnknownDigest(s.to_string())),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sha256 => "SHA-256",
            Self::Sha512 => "SHA-512",
            Self::Blake3 => "BLAKE3",
        };
        f.write_str(name)
    }
}

/// Observes the bytes of a blob write as they stream to storage.
///
/// `write` is called for every chunk in order, `flush` exactly once after
/// the last chunk. An observer that derives a key from the content reports
/// it from [`key`](WriteObserver::key) after `flush`.
pub trait WriteObserver: Send {
    /// Observe one chunk of the stream
    fn write(&mut self, chunk: &[u8]);

    /// The stream is complete; finalize any derived state
    fn flush(&mut self);

    /// The key derived from the observed content, once flushed
    fn key(&self) -> Option<String> {
        None
    }
}

enum DigestState {
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl DigestState {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => Self::Sha256(sha2::Sha256::new()),
            DigestAlgorithm::Sha512 => Self::Sha512(sha2::Sha512::new()),
            DigestAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(chunk),
            Self::Sha512(h) => h.update(chunk),
            Self::Blake3(h) => {
                h.update(chunk);
            }
        }
    }

    fn finalize(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

/// A [`WriteObserver`] that computes a hex-encoded content digest.
pub struct DigestWriter {
    state: Option<DigestState>,
    digest: Option<String>,
}

impl DigestWriter {
    /// Start a digest over an empty stream
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            state: Some(DigestState::new(algorithm)),
            digest: None,
        }
    }

    /// The hex digest, available after `flush`
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }
}

impl WriteObserver for DigestWriter {
    fn write(&mut self, chunk: &[u8]) {
        if let Some(state) = self.state.as_mut() {
            state.update(chunk);
        }
    }

    fn flush(&mut self) {
        if let Some(state) = self.state.take() {
            self.digest = Some(state.finalize());
        }
    }

    fn key(&self) -> Option<String> {
        self.digest.clone()
    }
}

/// Where a write gets its final key from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// The key is known up front
    Fixed(String),
    /// The key is derived by the write observer from the streamed content
    FromObserver,
}

impl KeySource {
    /// Resolve the final key once the stream has been flushed
    pub fn resolve(&self, observer: Option<&dyn WriteObserver>) -> Result<String, StoreError> {
        match self {
            Self::Fixed(key) => Ok(key.clone()),
            Self::FromObserver => observer
                .and_then(|o| o.key())
                .ok_or(StoreError::MissingKey),
        }
    }
}
