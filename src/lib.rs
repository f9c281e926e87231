//! Partitioned, log-structured table storage core.
//!
//! `loess` implements the engine room of a snapshot-versioned table store:
//! - a snapshot registry with contiguous ids and gone/out-of-range lookup
//!   semantics,
//! - merge reads over interval-partitioned sorted runs with deletion vectors,
//!   predicate pushdown and projection adjustment,
//! - a partition-expiration controller that drops aged partitions in bounded
//!   OVERWRITE batches, and
//! - an optimistic commit coordinator with idempotent retry.
//!
//! Byte-level I/O, columnar codecs and catalog bindings stay outside: the
//! crate consumes them through the [`fs::FileIO`], [`ondisk::format::FileFormat`]
//! and [`partition::PartitionHandler`] seams.

/// Commit coordination.
pub mod commit;
/// Deletion vectors.
pub mod deletion;
/// Byte-level I/O seam.
pub mod fs;
/// Manifest lists.
pub mod manifest;
/// Sorted runs, interval planning, merge functions.
pub mod mergetree;
/// Data file metadata, format seam and reader factory.
pub mod ondisk;
/// Table configuration.
pub mod option;
/// Partition codec, catalog seam and expiration.
pub mod partition;
/// Predicate trees.
pub mod predicate;
/// Split read façade.
pub mod read;
/// Row and record model.
pub mod record;
/// Scan planning and startup scanners.
pub mod scan;
/// Table schema store.
pub mod schema;
/// Snapshot registry.
pub mod snapshot;
/// Spill-capable merge sorting.
pub mod sort;
/// Record stream plumbing.
pub mod stream;
/// Table assembly.
pub mod table;
/// Buffering writer.
pub mod write;

pub use commit::{CommitError, CommitMessage, CompactIncrement, DataIncrement, FileStoreCommit};
pub use deletion::{DeletionFile, DeletionVector, DeletionVectorFactory};
pub use fs::{FileIO, IoError, Path};
pub use option::{ConfigError, CoreOptions, MergeEngine};
pub use partition::{
    expire::{system_clock, Clock, PartitionExpire},
    Partition, PartitionHandler, PartitionStatistics,
};
pub use predicate::{Predicate, PredicateBuilder};
pub use read::{DataSplit, MergeFileSplitRead, POSTPONE_BUCKET};
pub use record::{
    DataField, DataType, GenericRow, KeyValue, RowKind, RowType, Value,
};
pub use schema::{Schema, SchemaManager, TableSchema};
pub use snapshot::{CommitKind, Snapshot, SnapshotManager};
pub use table::{FileStoreTable, TableCommit, TableError};
pub use write::TableWrite;
