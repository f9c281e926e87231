//! Merge-tree structures: sorted runs, the interval planner and merge
//! functions.

pub mod interval;
pub mod mergefn;

use std::cmp::Ordering;

use crate::{ondisk::meta::DataFileMeta, record::RowComparator};

/// A key-ordered sequence of data files with strictly non-overlapping key
/// ranges: for consecutive files, `max_key(i) < min_key(i + 1)`.
#[derive(Debug, Clone)]
pub struct SortedRun {
    files: Vec<DataFileMeta>,
}

impl SortedRun {
    /// Run from files already known to be sorted and disjoint. The invariant
    /// is checked in debug builds.
    pub fn from_sorted(files: Vec<DataFileMeta>, comparator: &RowComparator) -> Self {
        let run = SortedRun { files };
        debug_assert!(run.is_valid(comparator), "overlapping files in sorted run");
        run
    }

    /// Run over a single file.
    pub fn from_single(file: DataFileMeta) -> Self {
        SortedRun { files: vec![file] }
    }

    /// Files in key order.
    pub fn files(&self) -> &[DataFileMeta] {
        &self.files
    }

    /// Consume into files.
    pub fn into_files(self) -> Vec<DataFileMeta> {
        self.files
    }

    /// Sum of file sizes.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.file_size).sum()
    }

    /// Check the non-overlap invariant.
    pub fn is_valid(&self, comparator: &RowComparator) -> bool {
        self.files.windows(2).all(|pair| {
            comparator(&pair[0].max_key, &pair[1].min_key) == Ordering::Less
        })
    }
}
