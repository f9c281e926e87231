//! Sealed data file metadata.

use serde::{Deserialize, Serialize};

use crate::record::{GenericRow, Value};

/// Per-field min/max/null statistics captured at write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    /// Field name.
    pub field: String,
    /// Minimum non-null value, if any row had one.
    pub min: Option<Value>,
    /// Maximum non-null value, if any row had one.
    pub max: Option<Value>,
    /// Null cell count.
    pub null_count: u64,
}

/// Describes one sealed on-disk data file. Files at level 0 may overlap in
/// key range; within a level >= 1 files are non-overlapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFileMeta {
    /// File name, unique within its bucket.
    pub file_name: String,
    /// File size in bytes.
    pub file_size: u64,
    /// Number of stored records.
    pub row_count: u64,
    /// Smallest key in the file.
    pub min_key: GenericRow,
    /// Largest key in the file.
    pub max_key: GenericRow,
    /// Smallest sequence number in the file.
    pub min_sequence: u64,
    /// Largest sequence number in the file.
    pub max_sequence: u64,
    /// LSM level.
    pub level: u32,
    /// Value field statistics.
    pub value_stats: Vec<FieldStats>,
    /// Epoch millis when the file was sealed.
    pub creation_time_millis: u64,
}

impl DataFileMeta {
    /// Distinct key count upper bound. Data files hold at most one record per
    /// key once compacted; level-0 files may repeat keys.
    pub fn key_count(&self) -> u64 {
        self.row_count
    }
}
