//! Table assembly: wires options, schema, registry, readers, writers and the
//! expire controller together.

use std::{collections::HashMap, sync::Arc};

use thiserror::Error;

use crate::{
    commit::{CommitError, CommitMessage, FileStoreCommit},
    fs::{FileIO, Path},
    manifest::ManifestList,
    ondisk::{format::FileFormat, reader::KeyValueFileReaderFactoryBuilder, ReadError},
    option::{ConfigError, CoreOptions},
    partition::{
        expire::{system_clock, Clock, ExpireChecker, ExpireError, PartitionExpire},
        Partition, PartitionHandler, PartitionHandlerError, PartitionTimeExtractor,
    },
    read::MergeFileSplitRead,
    record::{default_key_comparator, RowComparator},
    scan::{ScanError, TableScan},
    schema::{SchemaError, TableSchema},
    snapshot::SnapshotManager,
    sort::MergeSorter,
    write::TableWrite,
};

/// Any failure surfaced through the table API.
#[derive(Debug, Error)]
pub enum TableError {
    /// Bad configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Commit failure.
    #[error(transparent)]
    Commit(#[from] CommitError),
    /// Expire pass failure.
    #[error(transparent)]
    Expire(#[from] ExpireError),
    /// Catalog notification failure.
    #[error(transparent)]
    Handler(#[from] PartitionHandlerError),
    /// Scan failure.
    #[error(transparent)]
    Scan(#[from] ScanError),
    /// Reader failure.
    #[error(transparent)]
    Read(#[from] ReadError),
    /// Schema store failure.
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// A bound table: schema, storage and configuration.
pub struct FileStoreTable {
    file_io: Arc<dyn FileIO>,
    path: Path,
    schema: TableSchema,
    options: CoreOptions,
    format: Arc<dyn FileFormat>,
    partition_handler: Option<Arc<dyn PartitionHandler>>,
    clock: Clock,
}

impl FileStoreTable {
    /// Bind a table. Options are parsed from the schema's raw map.
    pub fn new(
        file_io: Arc<dyn FileIO>,
        path: Path,
        schema: TableSchema,
        format: Arc<dyn FileFormat>,
    ) -> Result<Self, TableError> {
        let options = schema.core_options()?;
        Ok(FileStoreTable {
            file_io,
            path,
            schema,
            options,
            format,
            partition_handler: None,
            clock: system_clock(),
        })
    }

    /// Attach the catalog environment's partition handler. The table holds a
    /// non-owning capability; notification flows through it on demand.
    pub fn with_partition_handler(mut self, handler: Arc<dyn PartitionHandler>) -> Self {
        self.partition_handler = Some(handler);
        self
    }

    /// Replace the wall-clock source. Test hook.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// A copy of this table with `overrides` applied on top of its options.
    pub fn copy(&self, overrides: &HashMap<String, String>) -> Result<Self, TableError> {
        let mut schema = self.schema.clone();
        schema.options = self.options.to_map_with(overrides);
        let options = schema.core_options()?;
        Ok(FileStoreTable {
            file_io: self.file_io.clone(),
            path: self.path.clone(),
            schema,
            options,
            format: self.format.clone(),
            partition_handler: self.partition_handler.clone(),
            clock: self.clock.clone(),
        })
    }

    /// The table schema.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// The parsed options.
    pub fn options(&self) -> &CoreOptions {
        &self.options
    }

    /// The table's snapshot registry.
    pub fn snapshot_manager(&self) -> Arc<SnapshotManager> {
        Arc::new(SnapshotManager::new(self.file_io.clone(), self.path.clone()))
    }

    /// The table's manifest store.
    pub fn manifest_list(&self) -> Arc<ManifestList> {
        Arc::new(ManifestList::new(self.file_io.clone(), &self.path))
    }

    /// Key order for merge reads.
    pub fn key_comparator(&self) -> RowComparator {
        default_key_comparator()
    }

    fn time_extractor(&self) -> PartitionTimeExtractor {
        PartitionTimeExtractor::new(
            self.options.partition_timestamp_pattern.clone(),
            self.options.partition_timestamp_formatter_or_default(),
        )
    }

    fn expire_checker(&self) -> Option<ExpireChecker> {
        let expiration_time = self.options.partition_expiration_time?;
        if self.schema.partition_keys.is_empty() {
            return None;
        }
        Some(ExpireChecker::new(expiration_time, self.time_extractor()))
    }

    /// A fresh writer.
    pub fn new_write(&self) -> TableWrite {
        TableWrite::new(
            self.file_io.clone(),
            self.path.clone(),
            &self.schema,
            self.key_comparator(),
            self.options.bucket,
            self.clock.clone(),
        )
    }

    /// The narrow commit surface, write guard included.
    pub fn new_file_store_commit(&self, commit_user: &str) -> Arc<FileStoreCommit> {
        FileStoreCommit::new(
            self.snapshot_manager(),
            self.manifest_list(),
            self.schema.id,
            commit_user.to_string(),
            self.options.commit_max_retries,
            self.clock.clone(),
            self.expire_checker(),
        )
    }

    /// The expire controller, when expiration is configured on a partitioned
    /// table. `last_check` starts at the current clock reading.
    pub fn new_partition_expire(&self, commit_user: &str) -> Option<PartitionExpire> {
        let expiration_time = self.options.partition_expiration_time?;
        if self.schema.partition_keys.is_empty() {
            return None;
        }
        let handler = if self.options.metastore_partitioned_table {
            self.partition_handler.clone()
        } else {
            None
        };
        Some(PartitionExpire::new(
            expiration_time,
            self.options.partition_expiration_check_interval,
            self.time_extractor(),
            self.options.partition_expiration_batch_size,
            self.options.partition_expiration_max_num,
            self.snapshot_manager(),
            self.manifest_list(),
            self.new_file_store_commit(commit_user),
            handler,
            (self.clock)(),
        ))
    }

    /// The table-level commit surface: guards, publishes, notifies the
    /// catalog, and triggers expire passes unless the writer is write-only.
    pub fn new_commit(&self, commit_user: &str) -> TableCommit {
        let expire = if self.options.write_only {
            None
        } else {
            self.new_partition_expire(commit_user)
        };
        TableCommit {
            commit: self.new_file_store_commit(commit_user),
            expire,
            clock: self.clock.clone(),
            handler: if self.options.metastore_partitioned_table {
                self.partition_handler.clone()
            } else {
                None
            },
        }
    }

    /// A scan planner.
    pub fn new_scan(&self) -> TableScan {
        TableScan::new(self.snapshot_manager(), self.manifest_list())
    }

    /// A split reader.
    pub fn new_read(&self) -> MergeFileSplitRead {
        let builder = KeyValueFileReaderFactoryBuilder::new(
            self.file_io.clone(),
            self.format.clone(),
            self.path.clone(),
            &self.schema,
        );
        MergeFileSplitRead::new(
            self.schema.clone(),
            builder,
            self.key_comparator(),
            crate::mergetree::mergefn::merge_function_factory(self.options.merge_engine),
            MergeSorter::new(self.options.sort_spill_threshold),
            self.options.sequence_field.clone(),
            self.options.sequence_field_sort_order_ascending,
        )
    }
}

/// Writer-facing commit handle: publication plus post-commit maintenance.
pub struct TableCommit {
    commit: Arc<FileStoreCommit>,
    expire: Option<PartitionExpire>,
    clock: Clock,
    handler: Option<Arc<dyn PartitionHandler>>,
}

impl TableCommit {
    /// Publish `messages` at `identifier`, notify the catalog about new
    /// partitions, then run due maintenance.
    pub async fn commit(
        &mut self,
        identifier: u64,
        messages: Vec<CommitMessage>,
    ) -> Result<(), TableError> {
        self.commit.commit(identifier, &messages).await?;

        if let Some(handler) = &self.handler {
            let mut partitions: Vec<Partition> =
                messages.iter().map(|m| m.partition.clone()).collect();
            partitions.sort();
            partitions.dedup();
            if !partitions.is_empty() {
                handler.create_partitions(&partitions).await?;
            }
        }

        self.maybe_expire(identifier).await
    }

    /// Retry-safe commit of prepared messages; identifiers already in the
    /// snapshot log are skipped. Never trips the expired-partition guard.
    pub async fn filter_and_commit(
        &mut self,
        messages_by_identifier: &std::collections::BTreeMap<u64, Vec<CommitMessage>>,
    ) -> Result<usize, TableError> {
        let submitted = self.commit.filter_and_commit(messages_by_identifier).await?;
        if let Some(&identifier) = messages_by_identifier.keys().next_back() {
            self.maybe_expire(identifier).await?;
        }
        Ok(submitted)
    }

    async fn maybe_expire(&mut self, identifier: u64) -> Result<(), TableError> {
        if let Some(expire) = &mut self.expire {
            expire.expire((self.clock)(), identifier).await?;
        }
        Ok(())
    }

    /// The underlying coordinator.
    pub fn file_store_commit(&self) -> Arc<FileStoreCommit> {
        self.commit.clone()
    }
}
