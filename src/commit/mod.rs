//! Commit coordinator: snapshot publication under optimistic concurrency.
//!
//! A commit folds prepared messages into manifest deltas and publishes the
//! next snapshot id with create-new semantics. Losing the race surfaces as a
//! conflict; the attempt restarts from a fresh base snapshot with bounded
//! exponential backoff. Partition drops always publish OVERWRITE snapshots.

pub mod message;

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    manifest::{FileKind, ManifestEntry, ManifestList},
    partition::{expire::{Clock, ExpireChecker}, Partition},
    snapshot::{CommitKind, Snapshot, SnapshotError, SnapshotManager},
};

pub use message::{CommitMessage, CompactIncrement, DataIncrement};

/// Commit failure.
#[derive(Debug, Error)]
pub enum CommitError {
    /// The write guard refused the commit: at least one target partition is
    /// already expired. Terminal for this commit.
    #[error(
        "You are writing data to expired partitions, and you can filter this data to avoid job \
         failover. Otherwise, continuous expired records will cause the job to failover restart \
         continuously. Expired partitions are: [{partitions}]"
    )]
    WritingToExpiredPartition {
        /// Rendered list of the expired targets.
        partitions: String,
    },
    /// Identifier conflicts exhausted the retry budget.
    #[error("commit {identifier} gave up after {attempts} snapshot conflicts")]
    RetriesExhausted {
        /// Commit identifier.
        identifier: u64,
        /// Attempts made.
        attempts: usize,
    },
    /// Registry or manifest failure.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// States of one commit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitState {
    Preparing,
    Submitted,
    Succeeded,
    Conflicted,
}

/// Narrow commit surface over one table's snapshot registry.
pub struct FileStoreCommit {
    snapshot_manager: Arc<SnapshotManager>,
    manifest_list: Arc<ManifestList>,
    schema_id: u64,
    commit_user: String,
    max_retries: usize,
    clock: Clock,
    expire_checker: Option<ExpireChecker>,
}

impl FileStoreCommit {
    /// Build a coordinator. `expire_checker` enables the write guard.
    pub fn new(
        snapshot_manager: Arc<SnapshotManager>,
        manifest_list: Arc<ManifestList>,
        schema_id: u64,
        commit_user: String,
        max_retries: usize,
        clock: Clock,
        expire_checker: Option<ExpireChecker>,
    ) -> Arc<Self> {
        Arc::new(FileStoreCommit {
            snapshot_manager,
            manifest_list,
            schema_id,
            commit_user,
            max_retries,
            clock,
            expire_checker,
        })
    }

    /// The committing user.
    pub fn commit_user(&self) -> &str {
        &self.commit_user
    }

    /// Publish `messages` at `identifier`. The write guard rejects commits
    /// whose target partitions are already expired; rejection is terminal and
    /// publishes nothing.
    pub async fn commit(
        &self,
        identifier: u64,
        messages: &[CommitMessage],
    ) -> Result<(), CommitError> {
        if let Some(checker) = &self.expire_checker {
            let now = (self.clock)();
            let mut seen = HashSet::new();
            let targets: Vec<&Partition> = messages
                .iter()
                .map(|m| &m.partition)
                .filter(|p| seen.insert((*p).clone()))
                .collect();
            let expired = checker.expired_of(now, targets);
            if !expired.is_empty() {
                let rendered = expired
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(CommitError::WritingToExpiredPartition {
                    partitions: rendered,
                });
            }
        }
        self.commit_unguarded(identifier, messages).await
    }

    /// Publish without the expired-partition guard. Used by
    /// [`FileStoreCommit::filter_and_commit`], whose messages may legally
    /// target partitions expired after preparation.
    async fn commit_unguarded(
        &self,
        identifier: u64,
        messages: &[CommitMessage],
    ) -> Result<(), CommitError> {
        let mut delta = Vec::new();
        let mut changelog = Vec::new();
        let mut only_compact = !messages.is_empty();
        for message in messages {
            only_compact &= message.data_increment.is_empty();
            let entry = |kind, file: &crate::ondisk::meta::DataFileMeta| ManifestEntry {
                kind,
                partition: message.partition.clone(),
                bucket: message.bucket,
                total_buckets: message.total_buckets,
                file: file.clone(),
            };
            for file in &message.data_increment.new_files {
                delta.push(entry(FileKind::Add, file));
            }
            for file in &message.data_increment.deleted_files {
                delta.push(entry(FileKind::Delete, file));
            }
            for file in &message.compact_increment.compact_before {
                delta.push(entry(FileKind::Delete, file));
            }
            for file in &message.compact_increment.compact_after {
                delta.push(entry(FileKind::Add, file));
            }
            for file in &message.data_increment.changelog_files {
                changelog.push(entry(FileKind::Add, file));
            }
            for file in &message.compact_increment.changelog_files {
                changelog.push(entry(FileKind::Add, file));
            }
        }
        let kind = if only_compact {
            CommitKind::Compact
        } else {
            CommitKind::Append
        };
        self.try_commit(kind, identifier, delta, changelog).await
    }

    /// Drop every live file of `partitions` in one OVERWRITE snapshot.
    pub async fn drop_partitions(
        &self,
        partitions: &[Partition],
        identifier: u64,
    ) -> Result<(), CommitError> {
        let Some(latest) = self.snapshot_manager.latest().await? else {
            return Ok(());
        };
        let live = self.manifest_list.live_entries(&latest).await?;
        let delta: Vec<ManifestEntry> = live
            .into_iter()
            .filter(|entry| partitions.contains(&entry.partition))
            .map(|mut entry| {
                entry.kind = FileKind::Delete;
                entry
            })
            .collect();
        self.try_commit(CommitKind::Overwrite, identifier, delta, Vec::new())
            .await
    }

    /// Retry-safe commit of prepared messages keyed by identifier. For each
    /// identifier already present in the snapshot log under this commit user
    /// the messages are skipped: the earlier attempt succeeded. The call
    /// never trips the expired-partition guard; already-appended data whose
    /// partition expired in between is recognized and not re-applied.
    pub async fn filter_and_commit(
        &self,
        messages_by_identifier: &BTreeMap<u64, Vec<CommitMessage>>,
    ) -> Result<usize, CommitError> {
        let committed = self.committed_identifiers().await?;
        let mut submitted = 0;
        for (&identifier, messages) in messages_by_identifier {
            if committed.contains(&identifier) {
                debug!(identifier, "commit already in snapshot log, skipped");
                continue;
            }
            self.commit_unguarded(identifier, messages).await?;
            submitted += 1;
        }
        Ok(submitted)
    }

    async fn committed_identifiers(&self) -> Result<HashSet<u64>, CommitError> {
        use futures_util::StreamExt;

        let mut out = HashSet::new();
        let mut snapshots = std::pin::pin!(self.snapshot_manager.iter_snapshots().await?);
        while let Some(snapshot) = snapshots.next().await {
            let snapshot = snapshot?;
            if snapshot.commit_user == self.commit_user {
                out.insert(snapshot.commit_identifier);
            }
        }
        Ok(out)
    }

    /// One commit attempt cycle: `Preparing -> Submitted -> Succeeded`, or
    /// back to `Preparing` on conflict with a fresh base snapshot.
    async fn try_commit(
        &self,
        kind: CommitKind,
        identifier: u64,
        delta: Vec<ManifestEntry>,
        changelog: Vec<ManifestEntry>,
    ) -> Result<(), CommitError> {
        let mut state = CommitState::Preparing;
        for attempt in 0..self.max_retries {
            debug_assert_eq!(state, CommitState::Preparing);

            let latest = self.snapshot_manager.latest().await?;
            let (new_id, base_entries) = match &latest {
                Some(snapshot) => (
                    snapshot.id + 1,
                    self.manifest_list.live_entries(snapshot).await?,
                ),
                None => (1, Vec::new()),
            };

            let base_manifest_list = self.manifest_list.write(&base_entries).await?;
            let delta_manifest_list = self.manifest_list.write(&delta).await?;
            let changelog_manifest_list = if changelog.is_empty() {
                None
            } else {
                Some(self.manifest_list.write(&changelog).await?)
            };

            let epoch_millis = {
                let now = (self.clock)();
                now.and_utc().timestamp_millis().max(0) as u64
            };
            let snapshot = Snapshot {
                id: new_id,
                schema_id: self.schema_id,
                base_manifest_list,
                delta_manifest_list,
                changelog_manifest_list,
                commit_user: self.commit_user.clone(),
                commit_identifier: identifier,
                commit_kind: kind,
                time_millis: epoch_millis,
            };

            state = CommitState::Submitted;
            debug!(snapshot = new_id, identifier, ?state, "snapshot submitted");
            match self.snapshot_manager.publish(&snapshot).await {
                Ok(()) => {
                    state = CommitState::Succeeded;
                    debug!(snapshot = new_id, identifier, ?state, "commit finished");
                    return Ok(());
                }
                Err(SnapshotError::Conflict { id }) => {
                    state = CommitState::Conflicted;
                    warn!(
                        snapshot = id,
                        identifier, attempt, ?state, "snapshot conflict, retrying from fresh base"
                    );
                    sleep(backoff(attempt)).await;
                    state = CommitState::Preparing;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CommitError::RetriesExhausted {
            identifier,
            attempts: self.max_retries,
        })
    }
}

fn backoff(attempt: usize) -> Duration {
    let millis = 10u64.saturating_mul(1 << attempt.min(10));
    Duration::from_millis(millis.min(2_000))
}

#[cfg(feature = "tokio")]
async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[cfg(not(feature = "tokio"))]
async fn sleep(_duration: Duration) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::{memory::InMemoryFileIO, Path},
        partition::{expire::system_clock, PartitionTimeExtractor},
        record::GenericRow,
        snapshot::CommitKind,
    };

    fn file(name: &str) -> crate::ondisk::meta::DataFileMeta {
        crate::ondisk::meta::DataFileMeta {
            file_name: name.to_string(),
            file_size: 1,
            row_count: 1,
            min_key: GenericRow::of(["a"]),
            max_key: GenericRow::of(["a"]),
            min_sequence: 0,
            max_sequence: 0,
            level: 0,
            value_stats: vec![],
            creation_time_millis: 0,
        }
    }

    fn message(partition: &str, name: &str) -> CommitMessage {
        CommitMessage::for_new_files(
            Partition::single("dt", partition),
            0,
            1,
            vec![file(name)],
        )
    }

    fn commit_with_guard(expiration_days: Option<u64>) -> Arc<FileStoreCommit> {
        let io: Arc<dyn crate::fs::FileIO> = Arc::new(InMemoryFileIO::new());
        let snapshots = Arc::new(SnapshotManager::new(io.clone(), Path::new("t")));
        let manifests = Arc::new(ManifestList::new(io, &Path::new("t")));
        let checker = expiration_days.map(|days| {
            ExpireChecker::new(
                std::time::Duration::from_secs(days * 24 * 3600),
                PartitionTimeExtractor::new(None, "yyyyMMdd"),
            )
        });
        FileStoreCommit::new(
            snapshots,
            manifests,
            0,
            "user".to_string(),
            4,
            system_clock(),
            checker,
        )
    }

    #[tokio::test]
    async fn commit_publishes_append_snapshots() {
        let commit = commit_with_guard(None);
        commit.commit(0, &[message("20230101", "f1")]).await.unwrap();
        commit.commit(1, &[message("20230103", "f2")]).await.unwrap();

        let latest = commit.snapshot_manager.latest().await.unwrap().unwrap();
        assert_eq!(latest.id, 2);
        assert_eq!(latest.commit_kind, CommitKind::Append);
        assert_eq!(latest.commit_identifier, 1);
        let live = commit.manifest_list.live_entries(&latest).await.unwrap();
        assert_eq!(live.len(), 2);
    }

    #[tokio::test]
    async fn drop_partitions_is_overwrite() {
        let commit = commit_with_guard(None);
        commit.commit(0, &[message("20230101", "f1")]).await.unwrap();
        commit.commit(1, &[message("20230103", "f2")]).await.unwrap();

        commit
            .drop_partitions(&[Partition::single("dt", "20230101")], 2)
            .await
            .unwrap();

        let latest = commit.snapshot_manager.latest().await.unwrap().unwrap();
        assert_eq!(latest.commit_kind, CommitKind::Overwrite);
        let live = commit.manifest_list.live_entries(&latest).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].partition.get("dt"), Some("20230103"));
    }

    #[tokio::test]
    async fn write_guard_rejects_expired_targets() {
        let commit = commit_with_guard(Some(1));
        let err = commit
            .commit(0, &[message("20230101", "f1")])
            .await
            .unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("You are writing data to expired partitions"));
        assert!(rendered.contains("[20230101]"));
        // Rejection is terminal: nothing was published.
        assert!(commit.snapshot_manager.latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn filter_and_commit_is_idempotent() {
        let commit = commit_with_guard(None);
        let mut prepared = BTreeMap::new();
        for i in 0..5u64 {
            prepared.insert(i, vec![message("20230101", &format!("f{i}"))]);
        }
        // Commit a prefix out-of-band first.
        for i in 0..2u64 {
            commit.commit(i, &prepared[&i]).await.unwrap();
        }

        let submitted = commit.filter_and_commit(&prepared).await.unwrap();
        assert_eq!(submitted, 3);
        let latest = commit.snapshot_manager.latest().await.unwrap().unwrap();
        assert_eq!(latest.commit_identifier, 4);
        let live = commit.manifest_list.live_entries(&latest).await.unwrap();
        assert_eq!(live.len(), 5);

        // Repeating the call changes nothing.
        assert_eq!(commit.filter_and_commit(&prepared).await.unwrap(), 0);
        let again = commit.snapshot_manager.latest().await.unwrap().unwrap();
        assert_eq!(again.id, latest.id);
    }

    #[tokio::test]
    async fn compact_only_messages_publish_compact_kind() {
        let commit = commit_with_guard(None);
        commit.commit(0, &[message("20230101", "f1")]).await.unwrap();

        let compact = CommitMessage {
            partition: Partition::single("dt", "20230101"),
            bucket: 0,
            total_buckets: 1,
            data_increment: DataIncrement::default(),
            compact_increment: CompactIncrement {
                compact_before: vec![file("f1")],
                compact_after: vec![file("f1-compacted")],
                changelog_files: vec![],
            },
        };
        commit.commit(1, &[compact]).await.unwrap();
        let latest = commit.snapshot_manager.latest().await.unwrap().unwrap();
        assert_eq!(latest.commit_kind, CommitKind::Compact);
        let live = commit.manifest_list.live_entries(&latest).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].file.file_name, "f1-compacted");
    }
}
