//! Units of read work.

use serde::{Deserialize, Serialize};

use crate::{deletion::DeletionFile, ondisk::meta::DataFileMeta, partition::Partition};

/// Bucket id of splits whose bucketing is postponed to read time; such splits
/// bypass merging.
pub const POSTPONE_BUCKET: i32 = -2;

/// One (partition, bucket) worth of files to read together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSplit {
    /// Partition tuple.
    pub partition: Partition,
    /// Bucket id, or [`POSTPONE_BUCKET`].
    pub bucket: i32,
    /// Data files to read.
    pub data_files: Vec<DataFileMeta>,
    /// Deletion files parallel to `data_files`; `None` entries mean no
    /// tombstones for that file.
    pub deletion_files: Option<Vec<Option<DeletionFile>>>,
    /// Files from before a changelog boundary. Only meaningful to streaming
    /// consumers; the merge path rejects splits carrying any.
    pub before_files: Vec<DataFileMeta>,
    /// Streaming read marker.
    pub is_streaming: bool,
}

impl DataSplit {
    /// Batch split over `data_files`.
    pub fn new(partition: Partition, bucket: i32, data_files: Vec<DataFileMeta>) -> Self {
        DataSplit {
            partition,
            bucket,
            data_files,
            deletion_files: None,
            before_files: Vec::new(),
            is_streaming: false,
        }
    }

    /// Attach deletion files.
    pub fn with_deletion_files(mut self, deletion_files: Vec<Option<DeletionFile>>) -> Self {
        self.deletion_files = Some(deletion_files);
        self
    }

    /// Mark as a streaming split.
    pub fn streaming(mut self) -> Self {
        self.is_streaming = true;
        self
    }

    /// Total row count across data files.
    pub fn row_count(&self) -> u64 {
        self.data_files.iter().map(|f| f.row_count).sum()
    }
}
