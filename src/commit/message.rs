//! Commit messages: what a writer hands to the commit coordinator.

use serde::{Deserialize, Serialize};

use crate::{ondisk::meta::DataFileMeta, partition::Partition};

/// New data produced by a writer since its last prepare.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataIncrement {
    /// Freshly sealed data files.
    pub new_files: Vec<DataFileMeta>,
    /// Files logically deleted by the writer.
    pub deleted_files: Vec<DataFileMeta>,
    /// Changelog files produced alongside the data.
    pub changelog_files: Vec<DataFileMeta>,
}

impl DataIncrement {
    /// True when the increment carries nothing.
    pub fn is_empty(&self) -> bool {
        self.new_files.is_empty() && self.deleted_files.is_empty() && self.changelog_files.is_empty()
    }
}

/// Compaction result bundled with a commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactIncrement {
    /// Files consumed by the compaction.
    pub compact_before: Vec<DataFileMeta>,
    /// Files produced by the compaction.
    pub compact_after: Vec<DataFileMeta>,
    /// Changelog files produced by the compaction.
    pub changelog_files: Vec<DataFileMeta>,
}

impl CompactIncrement {
    /// True when the increment carries nothing.
    pub fn is_empty(&self) -> bool {
        self.compact_before.is_empty()
            && self.compact_after.is_empty()
            && self.changelog_files.is_empty()
    }
}

/// One (partition, bucket) worth of prepared changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitMessage {
    /// Target partition.
    pub partition: Partition,
    /// Target bucket.
    pub bucket: i32,
    /// Bucket count of the writing layout.
    pub total_buckets: i32,
    /// New data.
    pub data_increment: DataIncrement,
    /// Compaction changes.
    pub compact_increment: CompactIncrement,
}

impl CommitMessage {
    /// Message carrying only new data files.
    pub fn for_new_files(
        partition: Partition,
        bucket: i32,
        total_buckets: i32,
        new_files: Vec<DataFileMeta>,
    ) -> Self {
        CommitMessage {
            partition,
            bucket,
            total_buckets,
            data_increment: DataIncrement {
                new_files,
                ..DataIncrement::default()
            },
            compact_increment: CompactIncrement::default(),
        }
    }

    /// True when the message carries nothing.
    pub fn is_empty(&self) -> bool {
        self.data_increment.is_empty() && self.compact_increment.is_empty()
    }
}
