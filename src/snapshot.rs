//! Snapshot registry: versioned metadata lookup.
//!
//! Snapshots are JSON documents under `<table>/snapshot/snapshot-<id>` with
//! `LATEST` and `EARLIEST` hint files. Ids are contiguous in
//! `[earliest, latest]`; a hole below `earliest` means the snapshot was
//! expired by retention, which surfaces as [`SnapshotError::SnapshotGone`].

use std::sync::Arc;

use futures_core::Stream;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::fs::{FileIO, IoError, Path};

/// What kind of change a snapshot published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitKind {
    /// New data appended by a writer.
    #[serde(rename = "APPEND")]
    Append,
    /// Files replaced by compaction.
    #[serde(rename = "COMPACT")]
    Compact,
    /// Content replaced, e.g. partition drops.
    #[serde(rename = "OVERWRITE")]
    Overwrite,
}

/// Versioned metadata pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id, contiguous from the earliest retained snapshot.
    pub id: u64,
    /// Schema the snapshot was written under.
    pub schema_id: u64,
    /// Manifest list holding the full file set as of the previous snapshot.
    pub base_manifest_list: String,
    /// Manifest list holding this snapshot's changes.
    pub delta_manifest_list: String,
    /// Manifest list of changelog files, when the commit produced one.
    pub changelog_manifest_list: Option<String>,
    /// Committing user, paired with `commit_identifier` for idempotent retry.
    pub commit_user: String,
    /// Writer-provided monotonic tag.
    pub commit_identifier: u64,
    /// Kind of change.
    pub commit_kind: CommitKind,
    /// Wall-clock commit time in epoch milliseconds.
    pub time_millis: u64,
}

/// Snapshot lookup and publication failures.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The id is inside `[earliest, latest]` but the file is missing: it was
    /// removed by snapshot expiration.
    #[error("snapshot {id} is gone, expired by snapshot retention")]
    SnapshotGone {
        /// Missing id.
        id: u64,
    },
    /// The id lies outside the available range.
    #[error(
        "snapshot {id} is out of available range [{earliest}, {latest}]"
    )]
    SnapshotOutOfRange {
        /// Requested id.
        id: u64,
        /// Earliest available id.
        earliest: u64,
        /// Latest available id.
        latest: u64,
    },
    /// No snapshot exists at all.
    #[error("there is currently no snapshot under {path}")]
    Empty {
        /// Table path.
        path: String,
    },
    /// Another writer published this id first.
    #[error("snapshot {id} was concurrently published by another writer")]
    Conflict {
        /// Contested id.
        id: u64,
    },
    /// Store failure.
    #[error(transparent)]
    Io(#[from] IoError),
    /// Corrupt snapshot file.
    #[error("snapshot decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

const LATEST_HINT: &str = "LATEST";
const EARLIEST_HINT: &str = "EARLIEST";

/// Read-mostly registry over the snapshot directory. Safe for concurrent
/// readers; the single-writer invariant is enforced by create-new publication.
pub struct SnapshotManager {
    file_io: Arc<dyn FileIO>,
    table_path: Path,
}

impl SnapshotManager {
    /// Bind to a table path.
    pub fn new(file_io: Arc<dyn FileIO>, table_path: Path) -> Self {
        SnapshotManager {
            file_io,
            table_path,
        }
    }

    /// The snapshot directory.
    pub fn snapshot_dir(&self) -> Path {
        self.table_path.child("snapshot")
    }

    fn snapshot_path(&self, id: u64) -> Path {
        self.snapshot_dir().child(format!("snapshot-{id}"))
    }

    /// Fetch a snapshot by id, classifying misses per the registry contract.
    pub async fn try_get(&self, id: u64) -> Result<Snapshot, SnapshotError> {
        match self.read_snapshot(id).await {
            Ok(snapshot) => Ok(snapshot),
            Err(SnapshotError::Io(e)) if e.is_not_found() => {
                let earliest = self.earliest_id().await?;
                let latest = self.latest_id().await?;
                match (earliest, latest) {
                    (Some(earliest), Some(latest)) if id >= earliest && id <= latest => {
                        Err(SnapshotError::SnapshotGone { id })
                    }
                    (Some(earliest), Some(latest)) => Err(SnapshotError::SnapshotOutOfRange {
                        id,
                        earliest,
                        latest,
                    }),
                    _ => Err(SnapshotError::Empty {
                        path: self.table_path.as_str().to_string(),
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn read_snapshot(&self, id: u64) -> Result<Snapshot, SnapshotError> {
        let bytes = self.file_io.open_input(&self.snapshot_path(id)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Earliest available snapshot id.
    pub async fn earliest_id(&self) -> Result<Option<u64>, SnapshotError> {
        if let Some(id) = self.read_hint(EARLIEST_HINT).await? {
            if self.file_io.exists(&self.snapshot_path(id)).await? {
                return Ok(Some(id));
            }
            warn!(hint = id, "stale EARLIEST hint, falling back to listing");
        }
        Ok(self.scan_ids().await?.map(|(earliest, _)| earliest))
    }

    /// Latest available snapshot id.
    pub async fn latest_id(&self) -> Result<Option<u64>, SnapshotError> {
        if let Some(id) = self.read_hint(LATEST_HINT).await? {
            // The hint may lag one commit behind; probe forward.
            if self.file_io.exists(&self.snapshot_path(id)).await? {
                let mut latest = id;
                while self.file_io.exists(&self.snapshot_path(latest + 1)).await? {
                    latest += 1;
                }
                return Ok(Some(latest));
            }
            warn!(hint = id, "stale LATEST hint, falling back to listing");
        }
        Ok(self.scan_ids().await?.map(|(_, latest)| latest))
    }

    /// Latest snapshot, if any exists.
    pub async fn latest(&self) -> Result<Option<Snapshot>, SnapshotError> {
        match self.latest_id().await? {
            Some(id) => Ok(Some(self.try_get(id).await?)),
            None => Ok(None),
        }
    }

    /// Lazily walk all available snapshots in id order.
    pub async fn iter_snapshots(
        &self,
    ) -> Result<impl Stream<Item = Result<Snapshot, SnapshotError>> + Send + '_, SnapshotError>
    {
        let earliest = self.earliest_id().await?;
        let latest = self.latest_id().await?;
        let range = match (earliest, latest) {
            (Some(earliest), Some(latest)) => earliest..=latest,
            _ => 1..=0,
        };
        Ok(stream::unfold(
            (self, range),
            |(manager, mut range)| async move {
                let id = range.next()?;
                Some((manager.try_get(id).await, (manager, range)))
            },
        ))
    }

    /// Publish `snapshot` with create-new semantics. A concurrent publication
    /// of the same id surfaces as [`SnapshotError::Conflict`]; the caller owns
    /// the retry loop.
    pub async fn publish(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let payload = serde_json::to_vec_pretty(snapshot)?;
        let path = self.snapshot_path(snapshot.id);
        match self.file_io.open_output(&path, &payload, false).await {
            Ok(()) => {}
            Err(e) if e.is_already_exists() => {
                return Err(SnapshotError::Conflict { id: snapshot.id })
            }
            Err(e) => return Err(e.into()),
        }
        self.write_hint(LATEST_HINT, snapshot.id).await?;
        if snapshot.id == 1 {
            self.write_hint(EARLIEST_HINT, 1).await?;
        }
        debug!(
            snapshot = snapshot.id,
            kind = ?snapshot.commit_kind,
            identifier = snapshot.commit_identifier,
            "published snapshot"
        );
        Ok(())
    }

    async fn read_hint(&self, name: &str) -> Result<Option<u64>, SnapshotError> {
        match self
            .file_io
            .open_input(&self.snapshot_dir().child(name))
            .await
        {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).trim().parse().ok()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_hint(&self, name: &str, id: u64) -> Result<(), SnapshotError> {
        self.file_io
            .open_output(
                &self.snapshot_dir().child(name),
                id.to_string().as_bytes(),
                true,
            )
            .await?;
        Ok(())
    }

    async fn scan_ids(&self) -> Result<Option<(u64, u64)>, SnapshotError> {
        let listed = self.file_io.list(&self.snapshot_dir()).await?;
        let ids: Vec<u64> = listed
            .iter()
            .filter_map(|p| p.file_name().strip_prefix("snapshot-")?.parse().ok())
            .collect();
        Ok(ids
            .iter()
            .min()
            .copied()
            .zip(ids.iter().max().copied()))
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::fs::memory::InMemoryFileIO;

    fn snapshot(id: u64, kind: CommitKind) -> Snapshot {
        Snapshot {
            id,
            schema_id: 0,
            base_manifest_list: format!("manifest-base-{id}"),
            delta_manifest_list: format!("manifest-delta-{id}"),
            changelog_manifest_list: None,
            commit_user: "test".to_string(),
            commit_identifier: id,
            commit_kind: kind,
            time_millis: id * 1_000,
        }
    }

    fn manager() -> SnapshotManager {
        SnapshotManager::new(Arc::new(InMemoryFileIO::new()), Path::new("t"))
    }

    #[tokio::test]
    async fn publish_and_lookup() {
        let manager = manager();
        manager.publish(&snapshot(1, CommitKind::Append)).await.unwrap();
        manager.publish(&snapshot(2, CommitKind::Overwrite)).await.unwrap();

        assert_eq!(manager.earliest_id().await.unwrap(), Some(1));
        assert_eq!(manager.latest_id().await.unwrap(), Some(2));
        let latest = manager.latest().await.unwrap().unwrap();
        assert_eq!(latest.commit_kind, CommitKind::Overwrite);
    }

    #[tokio::test]
    async fn duplicate_id_conflicts() {
        let manager = manager();
        manager.publish(&snapshot(1, CommitKind::Append)).await.unwrap();
        let err = manager
            .publish(&snapshot(1, CommitKind::Append))
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Conflict { id: 1 }));
    }

    #[tokio::test]
    async fn out_of_range_echoes_available_range() {
        let manager = manager();
        manager.publish(&snapshot(1, CommitKind::Append)).await.unwrap();
        manager.publish(&snapshot(2, CommitKind::Append)).await.unwrap();

        let err = manager.try_get(9).await.unwrap_err();
        match err {
            SnapshotError::SnapshotOutOfRange {
                id,
                earliest,
                latest,
            } => {
                assert_eq!((id, earliest, latest), (9, 1, 2));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn gap_inside_range_is_gone() {
        let manager = manager();
        // Simulate snapshot expiration having removed id 1 while hints and
        // later snapshots remain.
        manager.publish(&snapshot(1, CommitKind::Append)).await.unwrap();
        manager.publish(&snapshot(2, CommitKind::Append)).await.unwrap();
        manager.publish(&snapshot(3, CommitKind::Append)).await.unwrap();
        manager
            .file_io
            .delete(&manager.snapshot_path(2))
            .await
            .unwrap();

        let err = manager.try_get(2).await.unwrap_err();
        assert!(matches!(err, SnapshotError::SnapshotGone { id: 2 }));
    }

    #[tokio::test]
    async fn iter_walks_in_order() {
        let manager = manager();
        for id in 1..=3 {
            manager.publish(&snapshot(id, CommitKind::Append)).await.unwrap();
        }
        let stream = manager.iter_snapshots().await.unwrap();
        let ids: Vec<u64> = stream.map(|s| s.unwrap().id).collect().await;
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn empty_registry() {
        let manager = manager();
        assert!(manager.latest().await.unwrap().is_none());
        let err = manager.try_get(5).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Empty { .. }));
    }
}
