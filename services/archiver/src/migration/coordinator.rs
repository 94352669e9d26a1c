// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared run counters and completion detection
//!
//! Workers never take a lock on the run. Each finished unit is a single
//! atomic increment followed by a separate completion check. Two workers can
//! both observe "total reached"; the completion write is conditional on the
//! run not being completed yet, so only one of them makes the transition.

use tracing::warn;

use archiver_types::RunId;

use super::MigrationError;
use super::tracker::RunTracker;
use crate::metrics;

/// Which counter a finished unit of work moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Processed,
    Failed,
}

#[derive(Clone)]
pub struct Coordinator {
    tracker: RunTracker,
}

impl Coordinator {
    pub fn new(tracker: RunTracker) -> Self {
        Self { tracker }
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    /// Count one finished unit, then try to complete the run. Returns whether
    /// this call completed it.
    pub async fn record_unit(
        &self,
        run_id: RunId,
        disposition: Disposition,
    ) -> Result<bool, MigrationError> {
        let (processed, failed) = match disposition {
            Disposition::Processed => (1, 0),
            Disposition::Failed => (0, 1),
        };
        self.tracker
            .record_outcome(run_id, processed, failed)
            .await?;
        self.tracker.try_complete(run_id).await
    }

    /// [`Coordinator::record_unit`] for workers: the record is already
    /// handled, so a failed counter update is logged and swallowed.
    pub async fn settle(&self, run_id: RunId, disposition: Disposition) -> bool {
        match self.record_unit(run_id, disposition).await {
            Ok(completed) => completed,
            Err(e) => {
                warn!(
                    run_id = %run_id,
                    ?disposition,
                    error = %e,
                    "Failed to update run progress"
                );
                metrics::record_db_operation_failure();
                false
            }
        }
    }

    /// Count a whole batch-loop slice. Completion is left to the dispatcher,
    /// which completes the run once a selection comes back empty.
    pub async fn record_slice(
        &self,
        run_id: RunId,
        processed: u64,
        failed: u64,
    ) -> Result<(), MigrationError> {
        let processed = i64::try_from(processed).unwrap_or(i64::MAX);
        let failed = i64::try_from(failed).unwrap_or(i64::MAX);
        self.tracker.record_outcome(run_id, processed, failed).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use archiver_types::RunStatus;
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryStore>, RunTracker, Coordinator) {
        let store = Arc::new(MemoryStore::new());
        let tracker = RunTracker::new(store.clone());
        let coordinator = Coordinator::new(tracker.clone());
        (store, tracker, coordinator)
    }

    #[tokio::test]
    async fn units_move_exactly_one_counter() {
        let (store, tracker, coordinator) = setup();
        let run = tracker.create_run(3).await.unwrap();

        assert!(!coordinator.record_unit(run.id, Disposition::Processed).await.unwrap());
        assert!(!coordinator.record_unit(run.id, Disposition::Failed).await.unwrap());

        let stored = store.run(run.id).unwrap();
        assert_eq!(stored.processed_count, 1);
        assert_eq!(stored.failed_count, 1);
        assert_eq!(stored.status, RunStatus::Pending);

        assert!(coordinator.record_unit(run.id, Disposition::Processed).await.unwrap());
        assert_eq!(store.run(run.id).unwrap().status, RunStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_finishers_complete_once() {
        let (store, tracker, coordinator) = setup();
        let run = tracker.create_run(16).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let coordinator = coordinator.clone();
            let disposition = if i % 4 == 0 {
                Disposition::Failed
            } else {
                Disposition::Processed
            };
            handles.push(tokio::spawn(async move {
                coordinator.record_unit(run.id, disposition).await.unwrap()
            }));
        }

        let mut completions = 0;
        for handle in handles {
            if handle.await.unwrap() {
                completions += 1;
            }
        }

        assert_eq!(completions, 1);
        let stored = store.run(run.id).unwrap();
        assert_eq!(stored.processed_count, 12);
        assert_eq!(stored.failed_count, 4);
        assert_eq!(stored.status, RunStatus::Completed);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn settle_swallows_counter_failures() {
        let (store, tracker, coordinator) = setup();
        let run = tracker.create_run(1).await.unwrap();
        store.set_fail_counter_updates(true);

        assert!(!coordinator.settle(run.id, Disposition::Processed).await);
        assert_eq!(store.run(run.id).unwrap().processed_count, 0);
    }

    #[tokio::test]
    async fn slices_do_not_complete_the_run() {
        let (store, tracker, coordinator) = setup();
        let run = tracker.create_run(2).await.unwrap();
        coordinator.record_slice(run.id, 2, 0).await.unwrap();

        let stored = store.run(run.id).unwrap();
        assert_eq!(stored.processed_count, 2);
        assert_eq!(stored.status, RunStatus::Pending);
    }
}
