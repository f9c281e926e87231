//! Manifest lists: the file inventory behind each snapshot.
//!
//! A snapshot references two manifest lists: `base` (the full live file set
//! as of the previous snapshot) and `delta` (this snapshot's changes). The
//! live set of a snapshot is the base folded with the delta.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    fs::{generate_file_id, FileIO, Path},
    ondisk::meta::DataFileMeta,
    partition::Partition,
    snapshot::{Snapshot, SnapshotError},
};

/// Whether a manifest entry adds or removes a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    /// File added to the snapshot.
    #[serde(rename = "ADD")]
    Add,
    /// File removed from the snapshot.
    #[serde(rename = "DELETE")]
    Delete,
}

/// One file-level change record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Add or delete.
    pub kind: FileKind,
    /// Owning partition.
    pub partition: Partition,
    /// Owning bucket.
    pub bucket: i32,
    /// Bucket count of the writing layout.
    pub total_buckets: i32,
    /// File metadata.
    pub file: DataFileMeta,
}

/// Live file set aggregated per partition, used by the expire controller.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionEntry {
    /// Partition tuple.
    pub partition: Partition,
    /// Live record count.
    pub record_count: u64,
    /// Live file count.
    pub file_count: u64,
    /// Total live bytes.
    pub file_size_in_bytes: u64,
    /// Newest file creation time, epoch millis.
    pub last_file_creation_time: u64,
}

/// Reads and writes manifest list files under `<table>/manifest/`.
pub struct ManifestList {
    file_io: Arc<dyn FileIO>,
    manifest_dir: Path,
}

impl ManifestList {
    /// Bind to a table path.
    pub fn new(file_io: Arc<dyn FileIO>, table_path: &Path) -> Self {
        ManifestList {
            file_io,
            manifest_dir: table_path.child("manifest"),
        }
    }

    /// Persist `entries` as a new manifest list, returning its name.
    pub async fn write(&self, entries: &[ManifestEntry]) -> Result<String, SnapshotError> {
        let name = format!("manifest-list-{}", generate_file_id());
        let payload = serde_json::to_vec(entries)?;
        self.file_io
            .open_output(&self.manifest_dir.child(&name), &payload, false)
            .await?;
        Ok(name)
    }

    /// Read one manifest list by name.
    pub async fn read(&self, name: &str) -> Result<Vec<ManifestEntry>, SnapshotError> {
        let bytes = self
            .file_io
            .open_input(&self.manifest_dir.child(name))
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The live file set of `snapshot`: base folded with delta, deletes
    /// cancelling adds.
    pub async fn live_entries(
        &self,
        snapshot: &Snapshot,
    ) -> Result<Vec<ManifestEntry>, SnapshotError> {
        let mut entries = self.read(&snapshot.base_manifest_list).await?;
        entries.extend(self.read(&snapshot.delta_manifest_list).await?);
        Ok(fold_entries(entries))
    }

    /// Aggregate the live set of `snapshot` per partition.
    pub async fn partition_entries(
        &self,
        snapshot: &Snapshot,
    ) -> Result<Vec<PartitionEntry>, SnapshotError> {
        let live = self.live_entries(snapshot).await?;
        let mut by_partition: BTreeMap<Partition, PartitionEntry> = BTreeMap::new();
        for entry in live {
            let aggregated = by_partition
                .entry(entry.partition.clone())
                .or_insert_with(|| PartitionEntry {
                    partition: entry.partition.clone(),
                    record_count: 0,
                    file_count: 0,
                    file_size_in_bytes: 0,
                    last_file_creation_time: 0,
                });
            aggregated.record_count += entry.file.row_count;
            aggregated.file_count += 1;
            aggregated.file_size_in_bytes += entry.file.file_size;
            aggregated.last_file_creation_time = aggregated
                .last_file_creation_time
                .max(entry.file.creation_time_millis);
        }
        Ok(by_partition.into_values().collect())
    }
}

/// Fold add/delete entries into the surviving adds, preserving add order.
pub fn fold_entries(entries: Vec<ManifestEntry>) -> Vec<ManifestEntry> {
    let mut live: Vec<ManifestEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry.kind {
            FileKind::Add => live.push(entry),
            FileKind::Delete => {
                live.retain(|candidate| {
                    !(candidate.partition == entry.partition
                        && candidate.bucket == entry.bucket
                        && candidate.file.file_name == entry.file.file_name)
                });
            }
        }
    }
    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::GenericRow;

    fn file(name: &str, rows: u64) -> DataFileMeta {
        DataFileMeta {
            file_name: name.to_string(),
            file_size: rows * 10,
            row_count: rows,
            min_key: GenericRow::of(["a"]),
            max_key: GenericRow::of(["z"]),
            min_sequence: 0,
            max_sequence: rows,
            level: 0,
            value_stats: vec![],
            creation_time_millis: rows,
        }
    }

    fn add(partition: &str, name: &str, rows: u64) -> ManifestEntry {
        ManifestEntry {
            kind: FileKind::Add,
            partition: Partition::single("dt", partition),
            bucket: 0,
            total_buckets: 1,
            file: file(name, rows),
        }
    }

    fn delete(partition: &str, name: &str) -> ManifestEntry {
        ManifestEntry {
            kind: FileKind::Delete,
            ..add(partition, name, 0)
        }
    }

    #[test]
    fn deletes_cancel_adds() {
        let folded = fold_entries(vec![
            add("20230101", "f1", 1),
            add("20230103", "f2", 2),
            delete("20230101", "f1"),
        ]);
        assert_eq!(folded.len(), 1);
        assert_eq!(folded[0].file.file_name, "f2");
    }

    #[tokio::test]
    async fn partition_aggregation() {
        let io = Arc::new(crate::fs::memory::InMemoryFileIO::new());
        let list = ManifestList::new(io, &Path::new("t"));
        let base = list.write(&[]).await.unwrap();
        let delta = list
            .write(&[
                add("20230101", "f1", 5),
                add("20230101", "f2", 3),
                add("20230103", "f3", 2),
            ])
            .await
            .unwrap();
        let snapshot = Snapshot {
            id: 1,
            schema_id: 0,
            base_manifest_list: base,
            delta_manifest_list: delta,
            changelog_manifest_list: None,
            commit_user: "u".to_string(),
            commit_identifier: 0,
            commit_kind: crate::snapshot::CommitKind::Append,
            time_millis: 0,
        };

        let partitions = list.partition_entries(&snapshot).await.unwrap();
        assert_eq!(partitions.len(), 2);
        let first = &partitions[0];
        assert_eq!(first.partition.get("dt"), Some("20230101"));
        assert_eq!(first.record_count, 8);
        assert_eq!(first.file_count, 2);
    }
}
