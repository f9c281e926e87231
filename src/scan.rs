//! Scan planning: from a snapshot to read splits, plus the startup-mode
//! scanners used by streaming consumers.

use std::{collections::BTreeMap, sync::Arc};

use thiserror::Error;
use tracing::debug;

use crate::{
    manifest::{ManifestEntry, ManifestList},
    partition::Partition,
    read::DataSplit,
    snapshot::{Snapshot, SnapshotError, SnapshotManager},
};

/// Which file set of a snapshot a plan covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// The full live file set.
    All,
    /// Only this snapshot's delta.
    Delta,
    /// Only this snapshot's changelog.
    Changelog,
}

/// A planned read: the snapshot it pins and the splits to hand out.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Pinned snapshot id, `None` for an empty table.
    pub snapshot_id: Option<u64>,
    /// Splits, one per (partition, bucket).
    pub splits: Vec<DataSplit>,
}

/// Scan failure.
#[derive(Debug, Error)]
pub enum ScanError {
    /// No snapshot satisfies the starting condition.
    #[error("there is currently no snapshot satisfying the scan condition: {0}")]
    NoSnapshot(String),
    /// Registry failure.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Plans reads over a table's snapshots.
pub struct TableScan {
    snapshot_manager: Arc<SnapshotManager>,
    manifest_list: Arc<ManifestList>,
}

impl TableScan {
    /// Bind to a table's registry and manifests.
    pub fn new(snapshot_manager: Arc<SnapshotManager>, manifest_list: Arc<ManifestList>) -> Self {
        TableScan {
            snapshot_manager,
            manifest_list,
        }
    }

    /// Plan a batch read of the latest snapshot.
    pub async fn plan(&self) -> Result<Plan, ScanError> {
        match self.snapshot_manager.latest().await? {
            None => Ok(Plan {
                snapshot_id: None,
                splits: Vec::new(),
            }),
            Some(snapshot) => self.plan_snapshot(&snapshot, ScanMode::All).await,
        }
    }

    /// Plan a read of one snapshot under `mode`. Delta and changelog plans
    /// produce streaming splits: their files may repeat keys and must not be
    /// merged.
    pub async fn plan_snapshot(
        &self,
        snapshot: &Snapshot,
        mode: ScanMode,
    ) -> Result<Plan, ScanError> {
        let entries = match mode {
            ScanMode::All => self.manifest_list.live_entries(snapshot).await?,
            ScanMode::Delta => self
                .manifest_list
                .read(&snapshot.delta_manifest_list)
                .await?
                .into_iter()
                .filter(|e| e.kind == crate::manifest::FileKind::Add)
                .collect(),
            ScanMode::Changelog => match &snapshot.changelog_manifest_list {
                Some(list) => self.manifest_list.read(list).await?,
                None => Vec::new(),
            },
        };
        let streaming = mode != ScanMode::All;
        Ok(Plan {
            snapshot_id: Some(snapshot.id),
            splits: group_into_splits(entries, streaming),
        })
    }
}

fn group_into_splits(entries: Vec<ManifestEntry>, streaming: bool) -> Vec<DataSplit> {
    let mut grouped: BTreeMap<(Partition, i32), Vec<crate::ondisk::meta::DataFileMeta>> =
        BTreeMap::new();
    for entry in entries {
        grouped
            .entry((entry.partition, entry.bucket))
            .or_default()
            .push(entry.file);
    }
    grouped
        .into_iter()
        .map(|((partition, bucket), files)| {
            let split = DataSplit::new(partition, bucket, files);
            if streaming {
                split.streaming()
            } else {
                split
            }
        })
        .collect()
}

/// Where a streaming read starts: the pinned snapshot and the mode for the
/// first plan.
#[derive(Debug, Clone)]
pub struct StartingContext {
    /// Starting snapshot.
    pub snapshot: Snapshot,
    /// Mode of the first scan.
    pub scan_mode: ScanMode,
}

/// Startup strategies, chosen by table configuration.
#[derive(Debug, Clone)]
pub enum StartingScanner {
    /// Pin an explicit snapshot id and read it whole.
    StaticFromSnapshot {
        /// Requested snapshot id.
        snapshot_id: u64,
    },
    /// Pin the newest snapshot committed at or before a timestamp.
    StaticFromTimestamp {
        /// Epoch millis upper bound.
        timestamp_millis: u64,
    },
    /// Pin whatever is latest.
    Latest,
}

impl StartingScanner {
    /// Resolve the starting snapshot against the registry. An explicit id
    /// outside the available range surfaces the range in the error.
    pub async fn scan(
        &self,
        snapshot_manager: &SnapshotManager,
    ) -> Result<StartingContext, ScanError> {
        match self {
            StartingScanner::StaticFromSnapshot { snapshot_id } => {
                let snapshot = snapshot_manager.try_get(*snapshot_id).await?;
                Ok(StartingContext {
                    snapshot,
                    scan_mode: ScanMode::All,
                })
            }
            StartingScanner::StaticFromTimestamp { timestamp_millis } => {
                let earliest = snapshot_manager.earliest_id().await?;
                let latest = snapshot_manager.latest_id().await?;
                let (Some(earliest), Some(latest)) = (earliest, latest) else {
                    return Err(ScanError::NoSnapshot("the table is empty".to_string()));
                };
                let mut picked = None;
                for id in (earliest..=latest).rev() {
                    let snapshot = snapshot_manager.try_get(id).await?;
                    if snapshot.time_millis <= *timestamp_millis {
                        picked = Some(snapshot);
                        break;
                    }
                }
                let snapshot = picked.ok_or_else(|| {
                    ScanError::NoSnapshot(format!(
                        "no snapshot committed at or before {timestamp_millis}"
                    ))
                })?;
                Ok(StartingContext {
                    snapshot,
                    scan_mode: ScanMode::All,
                })
            }
            StartingScanner::Latest => {
                let snapshot = snapshot_manager.latest().await?.ok_or_else(|| {
                    ScanError::NoSnapshot("the table is empty".to_string())
                })?;
                Ok(StartingContext {
                    snapshot,
                    scan_mode: ScanMode::All,
                })
            }
        }
    }
}

/// Decides, per subsequent snapshot, whether a follow-up plan is due and in
/// which mode.
pub trait FollowUpScanner: Send + Sync {
    /// True when `snapshot` carries content for this consumer.
    fn should_scan_snapshot(&self, snapshot: &Snapshot) -> bool;

    /// Mode of the follow-up plan.
    fn scan_mode(&self) -> ScanMode;
}

/// Follows appended deltas.
pub struct DeltaFollowUpScanner;

impl FollowUpScanner for DeltaFollowUpScanner {
    fn should_scan_snapshot(&self, snapshot: &Snapshot) -> bool {
        snapshot.commit_kind == crate::snapshot::CommitKind::Append
    }

    fn scan_mode(&self) -> ScanMode {
        ScanMode::Delta
    }
}

/// Follows changelog-producing snapshots only.
pub struct ChangelogFollowUpScanner;

impl FollowUpScanner for ChangelogFollowUpScanner {
    fn should_scan_snapshot(&self, snapshot: &Snapshot) -> bool {
        if snapshot.changelog_manifest_list.is_some() {
            return true;
        }
        debug!(snapshot = snapshot.id, "snapshot has no changelog, check next one");
        false
    }

    fn scan_mode(&self) -> ScanMode {
        ScanMode::Changelog
    }
}
