//! On-disk data file layer: metadata, the format seam and the key-value
//! reader factory.

pub mod format;
pub mod meta;
pub mod reader;

use thiserror::Error;

use crate::{
    fs::{IoError, Path},
    partition::Partition,
};

/// Error raised anywhere on a reader pipeline. Propagated eagerly: no partial
/// results are emitted past a failure.
#[derive(Debug, Error)]
pub enum ReadError {
    /// Caller misuse of the split read surface.
    #[error("invalid split: {0}")]
    InvalidSplit(String),
    /// Store failure.
    #[error(transparent)]
    Io(#[from] IoError),
    /// Corrupt file content.
    #[error("decode error in {path}: {source}")]
    Decode {
        /// Offending file.
        path: String,
        /// Parser failure.
        #[source]
        source: serde_json::Error,
    },
    /// Corrupt deletion vector content.
    #[error("deletion vector error for {path}: {message}")]
    DeletionVector {
        /// Offending data file.
        path: String,
        /// What went wrong.
        message: String,
    },
}

/// Resolves data file names to full paths within one (partition, bucket).
#[derive(Clone)]
pub struct DataFilePathFactory {
    bucket_dir: Path,
}

impl DataFilePathFactory {
    /// Bind to a table root, partition and bucket.
    pub fn new(table_path: &Path, partition: &Partition, bucket: i32) -> Self {
        let mut dir = table_path.clone();
        if !partition.is_empty() {
            dir = dir.child(partition.to_path());
        }
        DataFilePathFactory {
            bucket_dir: dir.child(format!("bucket-{bucket}")),
        }
    }

    /// Directory holding the bucket's data files.
    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    /// Full path of a data file.
    pub fn to_path(&self, file_name: &str) -> Path {
        self.bucket_dir.child(file_name)
    }
}
