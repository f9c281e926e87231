//! Table configuration.
//!
//! Options flow by value through [`CoreOptions`]; every component receives
//! what it needs at construction time. String maps (the form catalogs store)
//! are parsed with [`CoreOptions::from_map`].

use std::{collections::HashMap, time::Duration};

use thiserror::Error;

/// `partition.expiration-time`: retention for partition values. Expiration is
/// enabled only when this is set.
pub const PARTITION_EXPIRATION_TIME: &str = "partition.expiration-time";
/// `partition.expiration-check-interval`: minimum gap between expire passes.
pub const PARTITION_EXPIRATION_CHECK_INTERVAL: &str = "partition.expiration-check-interval";
/// `partition.timestamp-formatter`: pattern for parsing partition timestamps.
pub const PARTITION_TIMESTAMP_FORMATTER: &str = "partition.timestamp-formatter";
/// `partition.timestamp-pattern`: template composing partition fields into
/// the formatter input.
pub const PARTITION_TIMESTAMP_PATTERN: &str = "partition.timestamp-pattern";
/// `partition.expiration-batch-size`: partitions dropped per commit.
pub const PARTITION_EXPIRATION_BATCH_SIZE: &str = "partition.expiration-batch-size";
/// `partition.expiration-max-num`: cap on partitions expired per pass.
pub const PARTITION_EXPIRATION_MAX_NUM: &str = "partition.expiration-max-num";
/// `metastore.partitioned-table`: propagate partition changes to the catalog.
pub const METASTORE_PARTITIONED_TABLE: &str = "metastore.partitioned-table";
/// `write-only`: writer skips compaction and background maintenance.
pub const WRITE_ONLY: &str = "write-only";
/// `sequence.field`: comma-separated value fields replacing the sequence
/// number for within-key ordering.
pub const SEQUENCE_FIELD: &str = "sequence.field";
/// `sequence.field.sort-order`: `ascending` (default) or `descending`.
pub const SEQUENCE_FIELD_SORT_ORDER: &str = "sequence.field.sort-order";
/// `bucket`: number of buckets per partition.
pub const BUCKET: &str = "bucket";
/// `merge-engine`: how records with the same key fold together.
pub const MERGE_ENGINE: &str = "merge-engine";
/// `commit.max-retries`: bound on identifier-conflict retries.
pub const COMMIT_MAX_RETRIES: &str = "commit.max-retries";
/// `sort-spill-threshold`: merge fan-in above which the sorter spills.
pub const SORT_SPILL_THRESHOLD: &str = "sort-spill-threshold";

/// Default timestamp formatter pattern.
pub const DEFAULT_TIMESTAMP_FORMATTER: &str = "yyyyMMdd";

/// Same-key folding strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeEngine {
    /// Keep the record with the highest sequence order.
    #[default]
    Deduplicate,
    /// Later non-null fields overwrite earlier ones.
    PartialUpdate,
}

/// Invalid or incompatible configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unparseable duration value.
    #[error("invalid duration for '{key}': '{value}'")]
    InvalidDuration {
        /// Offending key.
        key: &'static str,
        /// Offending value.
        value: String,
    },
    /// Unparseable or non-positive integer value.
    #[error("invalid positive integer for '{key}': '{value}'")]
    InvalidNumber {
        /// Offending key.
        key: &'static str,
        /// Offending value.
        value: String,
    },
    /// Value outside the accepted set.
    #[error("invalid value for '{key}': '{value}', expected one of {expected}")]
    InvalidValue {
        /// Offending key.
        key: &'static str,
        /// Offending value.
        value: String,
        /// Human-readable accepted set.
        expected: &'static str,
    },
    /// Partition expiration configured on a table without partition keys.
    #[error("Can not set 'partition.expiration-time' for non-partitioned table")]
    ExpirationOnNonPartitionedTable,
}

/// Parsed table options.
#[derive(Debug, Clone)]
pub struct CoreOptions {
    /// Retention for partition values; `None` disables expiration.
    pub partition_expiration_time: Option<Duration>,
    /// Minimum gap between expire passes. Zero means every call runs.
    pub partition_expiration_check_interval: Duration,
    /// Timestamp formatter pattern; `None` means [`DEFAULT_TIMESTAMP_FORMATTER`].
    pub partition_timestamp_formatter: Option<String>,
    /// Field-composition template; `None` means the first partition column.
    pub partition_timestamp_pattern: Option<String>,
    /// Partitions dropped per commit; `None` is unbounded.
    pub partition_expiration_batch_size: Option<usize>,
    /// Cap on partitions expired per pass; `None` is unbounded.
    pub partition_expiration_max_num: Option<usize>,
    /// Propagate partition changes to the external catalog.
    pub metastore_partitioned_table: bool,
    /// Writer skips compaction and background maintenance.
    pub write_only: bool,
    /// User-defined sequence fields.
    pub sequence_field: Vec<String>,
    /// Sequence order direction.
    pub sequence_field_sort_order_ascending: bool,
    /// Buckets per partition.
    pub bucket: usize,
    /// Same-key folding strategy.
    pub merge_engine: MergeEngine,
    /// Bound on identifier-conflict retries.
    pub commit_max_retries: usize,
    /// Merge fan-in above which the sorter spills through the io manager.
    pub sort_spill_threshold: usize,
    raw: HashMap<String, String>,
}

impl Default for CoreOptions {
    fn default() -> Self {
        CoreOptions {
            partition_expiration_time: None,
            partition_expiration_check_interval: Duration::from_secs(60 * 60),
            partition_timestamp_formatter: None,
            partition_timestamp_pattern: None,
            partition_expiration_batch_size: None,
            partition_expiration_max_num: None,
            metastore_partitioned_table: false,
            write_only: false,
            sequence_field: Vec::new(),
            sequence_field_sort_order_ascending: true,
            bucket: 1,
            merge_engine: MergeEngine::Deduplicate,
            commit_max_retries: 8,
            sort_spill_threshold: 64,
            raw: HashMap::new(),
        }
    }
}

impl CoreOptions {
    /// Parse from the string map a catalog stores with the table schema.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut options = CoreOptions {
            raw: map.clone(),
            ..CoreOptions::default()
        };

        if let Some(v) = map.get(PARTITION_EXPIRATION_TIME) {
            options.partition_expiration_time =
                Some(parse_duration(PARTITION_EXPIRATION_TIME, v)?);
        }
        if let Some(v) = map.get(PARTITION_EXPIRATION_CHECK_INTERVAL) {
            options.partition_expiration_check_interval =
                parse_duration(PARTITION_EXPIRATION_CHECK_INTERVAL, v)?;
        }
        if let Some(v) = map.get(PARTITION_TIMESTAMP_FORMATTER) {
            options.partition_timestamp_formatter = Some(v.clone());
        }
        if let Some(v) = map.get(PARTITION_TIMESTAMP_PATTERN) {
            options.partition_timestamp_pattern = Some(v.clone());
        }
        if let Some(v) = map.get(PARTITION_EXPIRATION_BATCH_SIZE) {
            options.partition_expiration_batch_size =
                Some(parse_positive(PARTITION_EXPIRATION_BATCH_SIZE, v)?);
        }
        if let Some(v) = map.get(PARTITION_EXPIRATION_MAX_NUM) {
            options.partition_expiration_max_num =
                Some(parse_positive(PARTITION_EXPIRATION_MAX_NUM, v)?);
        }
        if let Some(v) = map.get(METASTORE_PARTITIONED_TABLE) {
            options.metastore_partitioned_table = parse_bool(METASTORE_PARTITIONED_TABLE, v)?;
        }
        if let Some(v) = map.get(WRITE_ONLY) {
            options.write_only = parse_bool(WRITE_ONLY, v)?;
        }
        if let Some(v) = map.get(SEQUENCE_FIELD) {
            options.sequence_field = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = map.get(SEQUENCE_FIELD_SORT_ORDER) {
            options.sequence_field_sort_order_ascending = match v.as_str() {
                "ascending" => true,
                "descending" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: SEQUENCE_FIELD_SORT_ORDER,
                        value: v.clone(),
                        expected: "[ascending, descending]",
                    })
                }
            };
        }
        if let Some(v) = map.get(BUCKET) {
            options.bucket = parse_positive(BUCKET, v)?;
        }
        if let Some(v) = map.get(MERGE_ENGINE) {
            options.merge_engine = match v.as_str() {
                "deduplicate" => MergeEngine::Deduplicate,
                "partial-update" => MergeEngine::PartialUpdate,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: MERGE_ENGINE,
                        value: v.clone(),
                        expected: "[deduplicate, partial-update]",
                    })
                }
            };
        }
        if let Some(v) = map.get(COMMIT_MAX_RETRIES) {
            options.commit_max_retries = parse_positive(COMMIT_MAX_RETRIES, v)?;
        }
        if let Some(v) = map.get(SORT_SPILL_THRESHOLD) {
            options.sort_spill_threshold = parse_positive(SORT_SPILL_THRESHOLD, v)?;
        }

        Ok(options)
    }

    /// The raw map this was parsed from, with `overrides` applied. Used by
    /// `Table::copy`.
    pub fn to_map_with(&self, overrides: &HashMap<String, String>) -> HashMap<String, String> {
        let mut map = self.raw.clone();
        for (k, v) in overrides {
            map.insert(k.clone(), v.clone());
        }
        map
    }

    /// Effective timestamp formatter pattern.
    pub fn partition_timestamp_formatter_or_default(&self) -> &str {
        self.partition_timestamp_formatter
            .as_deref()
            .unwrap_or(DEFAULT_TIMESTAMP_FORMATTER)
    }
}

/// Parse durations in the `"<number> <unit>"` form catalogs use: `"1 h"`,
/// `"2 d"`, `"5 s"`, `"100 ms"`, `"30 min"`. The space is optional.
pub fn parse_duration(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let amount: u64 = digits.parse().map_err(|_| ConfigError::InvalidDuration {
        key,
        value: value.to_string(),
    })?;
    let millis = match unit.trim() {
        "ms" => 1,
        "s" | "sec" | "" => 1_000,
        "min" | "m" => 60 * 1_000,
        "h" => 60 * 60 * 1_000,
        "d" => 24 * 60 * 60 * 1_000,
        _ => {
            return Err(ConfigError::InvalidDuration {
                key,
                value: value.to_string(),
            })
        }
    };
    Ok(Duration::from_millis(amount * millis))
}

fn parse_positive(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidNumber {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            expected: "[true, false]",
        }),
    }
}
