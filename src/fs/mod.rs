//! Byte-level I/O seam.
//!
//! Everything the engine persists (snapshots, manifests, data files, spill
//! files) goes through [`FileIO`]. The trait is object safe so tables can be
//! wired to any store; [`memory::InMemoryFileIO`] backs unit tests and
//! [`tokio::TokioFileIO`] backs local disk.

pub mod memory;
#[cfg(any(feature = "tokio", test))]
pub mod tokio;

use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

/// Identifier for generated files (data files, manifests, spills).
pub type FileId = Ulid;

/// Generate a fresh [`FileId`].
pub fn generate_file_id() -> FileId {
    Ulid::new()
}

/// A slash-separated storage path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Path(String);

impl Path {
    /// Build a path from a string.
    pub fn new(raw: impl Into<String>) -> Self {
        Path(raw.into().trim_end_matches('/').to_string())
    }

    /// Append one path segment.
    pub fn child(&self, segment: impl AsRef<str>) -> Path {
        if self.0.is_empty() {
            Path(segment.as_ref().to_string())
        } else {
            Path(format!("{}/{}", self.0, segment.as_ref()))
        }
    }

    /// The raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Path {
    fn from(raw: &str) -> Self {
        Path::new(raw)
    }
}

impl From<String> for Path {
    fn from(raw: String) -> Self {
        Path::new(raw)
    }
}

/// Structured I/O failure.
#[derive(Debug, Error)]
pub enum IoError {
    /// The path does not exist.
    #[error("file not found: {path}")]
    NotFound {
        /// Missing path.
        path: String,
    },
    /// `open_output` with `overwrite = false` hit an existing file. Commit
    /// publication relies on this to detect identifier conflicts.
    #[error("file already exists: {path}")]
    AlreadyExists {
        /// Conflicting path.
        path: String,
    },
    /// Underlying store failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IoError {
    /// True when the error is [`IoError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, IoError::NotFound { .. })
    }

    /// True when the error is [`IoError::AlreadyExists`].
    pub fn is_already_exists(&self) -> bool {
        matches!(self, IoError::AlreadyExists { .. })
    }
}

/// Object-safe byte-level file store.
#[async_trait]
pub trait FileIO: Send + Sync + 'static {
    /// Read the entire object at `path`.
    async fn open_input(&self, path: &Path) -> Result<Vec<u8>, IoError>;

    /// Write `payload` as the entire object at `path`. With
    /// `overwrite = false` the write is create-new: an existing object fails
    /// with [`IoError::AlreadyExists`] and the stored content is untouched.
    async fn open_output(&self, path: &Path, payload: &[u8], overwrite: bool)
        -> Result<(), IoError>;

    /// List the objects directly under `dir`. A missing directory lists as
    /// empty.
    async fn list(&self, dir: &Path) -> Result<Vec<Path>, IoError>;

    /// Delete the object at `path`. Deleting a missing object is a no-op.
    async fn delete(&self, path: &Path) -> Result<(), IoError>;

    /// True when an object exists at `path`.
    async fn exists(&self, path: &Path) -> Result<bool, IoError>;
}
