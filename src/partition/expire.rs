//! Partition expiration controller.
//!
//! A periodic pass over the latest snapshot's partitions that drops the ones
//! whose derived timestamp has aged past the retention threshold. Drops are
//! OVERWRITE commits issued in bounded batches, each followed by an external
//! catalog notification.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    commit::{CommitError, FileStoreCommit},
    manifest::ManifestList,
    partition::{by_derived_timestamp, Partition, PartitionHandler, PartitionHandlerError,
        PartitionTimeExtractor},
    snapshot::{SnapshotError, SnapshotManager},
};

/// Wall-clock source, injectable for deterministic tests.
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// The system clock in local time.
pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Local::now().naive_local())
}

/// Decides whether a partition's derived timestamp has expired. Shared by
/// the expire controller and the commit write guard.
#[derive(Clone)]
pub struct ExpireChecker {
    expiration_time: ChronoDuration,
    extractor: PartitionTimeExtractor,
}

impl ExpireChecker {
    /// Build from the configured retention and extractor.
    pub fn new(expiration_time: std::time::Duration, extractor: PartitionTimeExtractor) -> Self {
        ExpireChecker {
            expiration_time: ChronoDuration::from_std(expiration_time)
                .unwrap_or(ChronoDuration::MAX),
            extractor,
        }
    }

    /// Derived timestamp of `partition`, when it parses.
    pub fn derived_timestamp(&self, partition: &Partition) -> Option<NaiveDateTime> {
        self.extractor.extract(partition).ok()
    }

    /// A partition is expired iff its derived timestamp plus the retention is
    /// strictly before `now`. Unparseable partitions never expire.
    pub fn is_expired(&self, now: NaiveDateTime, partition: &Partition) -> bool {
        match self.derived_timestamp(partition) {
            Some(ts) => ts + self.expiration_time < now,
            None => false,
        }
    }

    /// The expired subset of `partitions`, in input order.
    pub fn expired_of<'a>(
        &self,
        now: NaiveDateTime,
        partitions: impl IntoIterator<Item = &'a Partition>,
    ) -> Vec<Partition> {
        partitions
            .into_iter()
            .filter(|p| self.is_expired(now, p))
            .cloned()
            .collect()
    }
}

/// Expire pass failure. A failing chunk aborts the pass; chunks already
/// committed stand.
#[derive(Debug, Error)]
pub enum ExpireError {
    /// Registry failure.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    /// Drop commit failure.
    #[error(transparent)]
    Commit(#[from] Box<CommitError>),
    /// Catalog notification failure.
    #[error(transparent)]
    Handler(#[from] PartitionHandlerError),
}

impl From<CommitError> for ExpireError {
    fn from(e: CommitError) -> Self {
        ExpireError::Commit(Box::new(e))
    }
}

/// Single-threaded per-table expiration controller.
pub struct PartitionExpire {
    check_interval: ChronoDuration,
    checker: ExpireChecker,
    last_check: NaiveDateTime,
    batch_size: Option<usize>,
    max_expires: Option<usize>,
    snapshot_manager: Arc<SnapshotManager>,
    manifest_list: Arc<ManifestList>,
    commit: Arc<FileStoreCommit>,
    handler: Option<Arc<dyn PartitionHandler>>,
}

impl PartitionExpire {
    /// Build a controller. `now` seeds `last_check`, so the first triggering
    /// commit of a session only arms the timer and the next one does the
    /// work; restarting rapidly cannot double-expire.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        expiration_time: std::time::Duration,
        check_interval: std::time::Duration,
        extractor: PartitionTimeExtractor,
        batch_size: Option<usize>,
        max_expires: Option<usize>,
        snapshot_manager: Arc<SnapshotManager>,
        manifest_list: Arc<ManifestList>,
        commit: Arc<FileStoreCommit>,
        handler: Option<Arc<dyn PartitionHandler>>,
        now: NaiveDateTime,
    ) -> Self {
        PartitionExpire {
            check_interval: ChronoDuration::from_std(check_interval)
                .unwrap_or(ChronoDuration::MAX),
            checker: ExpireChecker::new(expiration_time, extractor),
            last_check: now,
            batch_size,
            max_expires,
            snapshot_manager,
            manifest_list,
            commit,
            handler,
        }
    }

    /// Override the last check time. Test hook.
    pub fn set_last_check(&mut self, at: NaiveDateTime) {
        self.last_check = at;
    }

    /// The expiration decision logic, shared with the commit write guard.
    pub fn checker(&self) -> &ExpireChecker {
        &self.checker
    }

    fn due(&self, now: NaiveDateTime) -> bool {
        self.check_interval.is_zero() || now > self.last_check + self.check_interval
    }

    /// Run one expire pass. Returns `false` when the check interval has not
    /// elapsed yet, `true` when a pass ran (even if nothing expired).
    pub async fn expire(
        &mut self,
        now: NaiveDateTime,
        commit_identifier: u64,
    ) -> Result<bool, ExpireError> {
        if !self.due(now) {
            debug!(%now, last_check = %self.last_check, "expire check interval not elapsed");
            return Ok(false);
        }
        self.last_check = now;

        let Some(snapshot) = self.snapshot_manager.latest().await? else {
            return Ok(true);
        };
        let partition_entries = self.manifest_list.partition_entries(&snapshot).await?;

        let mut expired: Vec<(Partition, NaiveDateTime)> = Vec::new();
        for entry in partition_entries {
            match self.checker.derived_timestamp(&entry.partition) {
                Some(ts) if ts + self.checker.expiration_time < now => {
                    expired.push((entry.partition, ts));
                }
                Some(_) => {}
                None => {
                    // Opaque partitions are preserved, never silently lost.
                    debug!(partition = %entry.partition, "partition timestamp unparseable, preserved");
                }
            }
        }

        expired.sort_by(by_derived_timestamp);
        if let Some(max) = self.max_expires {
            expired.truncate(max);
        }
        if expired.is_empty() {
            return Ok(true);
        }

        let batch = self.batch_size.unwrap_or(expired.len()).max(1);
        for chunk in expired.chunks(batch) {
            let partitions: Vec<Partition> =
                chunk.iter().map(|(p, _)| p.clone()).collect();
            info!(count = partitions.len(), identifier = commit_identifier, "expiring partitions");
            self.commit
                .drop_partitions(&partitions, commit_identifier)
                .await?;
            if let Some(handler) = &self.handler {
                handler.drop_partitions(&partitions).await?;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 1, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn checker(days: u64) -> ExpireChecker {
        ExpireChecker::new(
            std::time::Duration::from_secs(days * 24 * 3600),
            PartitionTimeExtractor::new(None, "yyyyMMdd"),
        )
    }

    #[test]
    fn expiration_boundary_is_strict() {
        let checker = checker(2);
        let p = Partition::single("f0", "20230101");
        // 20230101 + 2d == 20230103: not yet expired at exactly that instant.
        assert!(!checker.is_expired(at(3), &p));
        assert!(checker.is_expired(at(5), &p));
    }

    #[test]
    fn unparseable_partitions_never_expire() {
        let checker = checker(2);
        let p = Partition::single("f0", "abcd");
        assert!(!checker.is_expired(at(8), &p));
        assert!(checker.derived_timestamp(&p).is_none());
    }

    #[test]
    fn expired_subset_keeps_order() {
        let checker = checker(2);
        let old = Partition::single("f0", "20230101");
        let fresh = Partition::single("f0", "20230107");
        let odd = Partition::single("f0", "abcd");
        let expired = checker.expired_of(at(8), [&old, &odd, &fresh]);
        assert_eq!(expired, vec![old]);
    }
}
