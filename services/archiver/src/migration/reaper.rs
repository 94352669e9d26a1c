// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Stale claim reaper
//!
//! A claim older than the timeout (plus a fixed buffer) is presumed dead,
//! whether or not its worker is actually still running. Clearing it makes
//! the task reservable again and counts one attempt against both the task
//! and the record. False reclaims are tolerated because uploads overwrite
//! deterministic keys.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use archiver_types::StaleClaim;

use super::MigrationError;
use crate::config::STALE_CLAIM_BUFFER_SECS;
use crate::metrics;
use crate::queue::{TaskQueue, chrono_delay};
use crate::store::RecordStore;

/// Result of one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Claims taken at or before this instant were considered stale
    pub threshold: DateTime<Utc>,
    pub claims: Vec<StaleClaim>,
    /// `false` for a dry run
    pub cleared: bool,
}

pub struct StaleClaimReaper {
    queue: Arc<dyn TaskQueue>,
    records: Arc<dyn RecordStore>,
    timeout: Duration,
    max_attempts: i32,
}

impl StaleClaimReaper {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        records: Arc<dyn RecordStore>,
        timeout: Duration,
        max_attempts: i32,
    ) -> Self {
        Self {
            queue,
            records,
            timeout,
            max_attempts,
        }
    }

    /// Claims taken at or before the returned instant are stale.
    pub fn threshold(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono_delay(self.timeout) - chrono::Duration::seconds(STALE_CLAIM_BUFFER_SECS as i64)
    }

    /// Find stale claims and, unless `dry_run`, clear them.
    pub async fn sweep(&self, dry_run: bool) -> Result<SweepReport, MigrationError> {
        let threshold = self.threshold(Utc::now());

        if dry_run {
            let claims = self.queue.stale_claims(threshold).await?;
            return Ok(SweepReport {
                threshold,
                claims,
                cleared: false,
            });
        }

        let claims = self.queue.clear_stale_claims(threshold).await?;
        for claim in &claims {
            let Some(record_id) = claim.record_id else {
                continue;
            };
            if let Err(e) = self
                .records
                .record_failure(
                    record_id,
                    "Claim expired: worker presumed dead",
                    Utc::now(),
                    self.max_attempts,
                )
                .await
            {
                warn!(task_id = claim.task_id, record_id, error = %e, "Failed to count reclaimed attempt");
                metrics::record_db_operation_failure();
            }
        }

        if !claims.is_empty() {
            metrics::record_stale_claims_cleared(claims.len());
            info!(count = claims.len(), %threshold, "Cleared stale claims");
        }

        Ok(SweepReport {
            threshold,
            claims,
            cleared: true,
        })
    }

    /// Sweep every `interval` until `shutdown` flips to `true`.
    pub async fn run_periodic(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep(false).await {
                        warn!(error = %e, "Stale claim sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::{MemoryQueue, MemoryStore};
    use archiver_types::{MigrationTask, Record, RunId};

    async fn setup() -> (Arc<MemoryQueue>, Arc<MemoryStore>, StaleClaimReaper) {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryStore::new());
        store.insert_record(Record::new(1, "b", "text/html"));
        store.insert_record(Record::new(2, "b", "text/html"));
        for record_id in [1, 2] {
            queue
                .enqueue(
                    "q",
                    &MigrationTask {
                        record_id,
                        run_id: RunId::nil(),
                    },
                    Duration::ZERO,
                )
                .await
                .unwrap();
        }
        let reaper = StaleClaimReaper::new(
            queue.clone(),
            store.clone(),
            Duration::from_secs(300),
            3,
        );
        (queue, store, reaper)
    }

    #[test]
    fn threshold_includes_the_buffer() {
        let reaper = StaleClaimReaper::new(
            Arc::new(MemoryQueue::new()),
            Arc::new(MemoryStore::new()),
            Duration::from_secs(300),
            3,
        );
        let now = Utc::now();
        assert_eq!(reaper.threshold(now), now - chrono::Duration::seconds(360));
    }

    #[tokio::test]
    async fn dry_run_changes_nothing() {
        let (queue, store, reaper) = setup().await;
        let stale = queue.reserve("q").await.unwrap().unwrap();
        queue.backdate_claim(stale.id, Utc::now() - chrono::Duration::minutes(10));

        let report = reaper.sweep(true).await.unwrap();
        assert!(!report.cleared);
        assert_eq!(report.claims.len(), 1);
        assert_eq!(report.claims[0].record_id, Some(1));

        assert!(queue.tasks()[0].reserved_at.is_some());
        assert_eq!(store.record(1).unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn sweep_clears_only_stale_claims() {
        let (queue, store, reaper) = setup().await;
        let stale = queue.reserve("q").await.unwrap().unwrap();
        queue.backdate_claim(stale.id, Utc::now() - chrono::Duration::minutes(10));
        let fresh = queue.reserve("q").await.unwrap().unwrap();

        let report = reaper.sweep(false).await.unwrap();
        assert!(report.cleared);
        assert_eq!(report.claims.len(), 1);

        let tasks = queue.tasks();
        let reclaimed = tasks.iter().find(|t| t.id == stale.id).unwrap();
        assert!(reclaimed.reserved_at.is_none());
        assert_eq!(reclaimed.attempts, 2);
        assert!(tasks.iter().find(|t| t.id == fresh.id).unwrap().reserved_at.is_some());

        assert_eq!(store.record(1).unwrap().attempts, 1);
        assert_eq!(store.record(2).unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn reclaiming_a_migrated_record_keeps_its_attempts() {
        let (queue, store, reaper) = setup().await;
        let stale = queue.reserve("q").await.unwrap().unwrap();
        queue.backdate_claim(stale.id, Utc::now() - chrono::Duration::minutes(10));

        // The worker finished the record before it stopped responding.
        let mut record = Record::new(1, "b", "text/html");
        record.migrated = true;
        store.insert_record(record);

        let report = reaper.sweep(false).await.unwrap();
        assert_eq!(report.claims.len(), 1);

        let record = store.record(1).unwrap();
        assert_eq!(record.attempts, 0);
        assert!(record.last_error.is_none());
    }
}
