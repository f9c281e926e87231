#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use loess::{
    fs::memory::InMemoryFileIO,
    ondisk::format::JsonLinesFormat,
    partition::{PartitionHandlerError, PartitionStatistics},
    Clock, DataField, DataType, FileStoreTable, GenericRow, Partition, PartitionHandler, Path,
    Schema, SchemaManager,
};
use std::sync::Mutex;

/// Records every catalog notification for assertions.
#[derive(Default)]
pub struct RecordingPartitionHandler {
    pub created: Mutex<Vec<Partition>>,
    pub dropped: Mutex<Vec<Partition>>,
}

impl RecordingPartitionHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dropped_values(&self, column: &str) -> Vec<String> {
        self.dropped
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| p.get(column).map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl PartitionHandler for RecordingPartitionHandler {
    async fn create_partitions(
        &self,
        partitions: &[Partition],
    ) -> Result<(), PartitionHandlerError> {
        self.created.lock().unwrap().extend_from_slice(partitions);
        Ok(())
    }

    async fn drop_partitions(
        &self,
        partitions: &[Partition],
    ) -> Result<(), PartitionHandlerError> {
        self.dropped.lock().unwrap().extend_from_slice(partitions);
        Ok(())
    }

    async fn alter_partitions(
        &self,
        _partitions: &[PartitionStatistics],
    ) -> Result<(), PartitionHandlerError> {
        Ok(())
    }

    async fn mark_done_partitions(
        &self,
        _partitions: &[Partition],
    ) -> Result<(), PartitionHandlerError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), PartitionHandlerError> {
        Ok(())
    }
}

/// Midnight on 2023-01-`day`.
pub fn date(day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2023, 1, day)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

/// A clock pinned to a fixed instant.
pub fn fixed_clock(at: NaiveDateTime) -> Clock {
    Arc::new(move || at)
}

pub fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Create the standard two-string-column table partitioned by `f0` with
/// primary key (f0, f1), like the expiration scenarios use.
pub async fn create_partitioned_table(table_options: &[(&str, &str)]) -> FileStoreTable {
    let io: Arc<dyn loess::FileIO> = Arc::new(InMemoryFileIO::new());
    let path = Path::new("warehouse/t");
    let manager = SchemaManager::new(io.clone(), path.clone());
    let schema = manager
        .create_table(Schema {
            fields: vec![
                DataField::new(0, "f0", DataType::String),
                DataField::new(1, "f1", DataType::String),
            ],
            partition_keys: vec!["f0".to_string()],
            primary_keys: vec!["f0".to_string(), "f1".to_string()],
            options: options(table_options),
        })
        .await
        .unwrap();
    FileStoreTable::new(io, path, schema, JsonLinesFormat::shared()).unwrap()
}

/// Write one (f0, f1) row and commit it at `identifier`.
pub async fn write_row(table: &FileStoreTable, identifier: u64, f0: &str, f1: &str) {
    let mut write = table.new_write();
    write.write(GenericRow::of([f0, f1]));
    let messages = write.prepare_commit().await.unwrap();
    let mut commit = table.new_commit("");
    commit.commit(identifier, messages).await.unwrap();
}

/// Read every row of the latest snapshot as `f0:f1` strings.
pub async fn read_all(table: &FileStoreTable) -> Vec<String> {
    let plan = table.new_scan().plan().await.unwrap();
    let mut out = Vec::new();
    for split in plan.splits {
        let read = table.new_read();
        let reader = read.create_reader(&split).await.unwrap();
        for kv in loess::stream::collect(reader).await.unwrap() {
            out.push(format!("{}:{}", kv.value.get(0), kv.value.get(1)));
        }
    }
    out.sort();
    out
}
