// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Fan-out task consumer
//!
//! Each reserved task runs the migrator once and acts on the explicit
//! outcome:
//!
//! | Outcome                         | Run counter | Task                       |
//! |---------------------------------|-------------|----------------------------|
//! | migrated                        | processed   | delete                     |
//! | already migrated / missing      | -           | delete                     |
//! | exhausted / permanent failure   | failed      | delete                     |
//! | transient failure, tries left   | -           | release after backoff      |
//! | transient failure, no tries left| failed      | terminal hook, then bury   |
//!
//! Infrastructure errors follow the transient rows. The terminal hook forces
//! the record's attempts to the cap with a `Job permanently failed` message
//! so the record is not left retryable after the queue gave up on it.
//! Permanent failures and terminal hooks also append to the run's error log.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ArchiverConfig;
use crate::metrics;
use crate::queue::{ReservedTask, TaskQueue};

use super::coordinator::{Coordinator, Disposition};
use super::migrator::{RecordMigrator, RecordOutcome};
use super::{MigrationError, truncate_error};

/// Task-level retry policy and polling, reloadable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Tries per task before the terminal hook runs
    pub max_tries: i32,
    /// Fixed delay before a released task becomes reservable again
    pub backoff: Duration,
    /// Sleep when the queue is empty
    pub poll_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_tries: 3,
            backoff: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl From<&ArchiverConfig> for WorkerSettings {
    fn from(config: &ArchiverConfig) -> Self {
        Self {
            max_tries: config.task_max_tries,
            backoff: config.task_backoff(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// What a worker did with one reserved task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDisposition {
    /// Finished and counted against the run; task deleted
    Acknowledged(Disposition),
    /// Nothing to do; task deleted without counting
    Skipped,
    /// Returned to the queue for another try
    Released { delay: Duration },
    /// Tries exhausted; record forced to the cap and task buried
    Buried,
}

impl TaskDisposition {
    fn label(&self) -> &'static str {
        match self {
            TaskDisposition::Acknowledged(_) => "acknowledged",
            TaskDisposition::Skipped => "skipped",
            TaskDisposition::Released { .. } => "released",
            TaskDisposition::Buried => "buried",
        }
    }
}

pub struct QueueWorker {
    queue: Arc<dyn TaskQueue>,
    queue_name: String,
    migrator: Arc<RecordMigrator>,
    coordinator: Coordinator,
    settings: watch::Receiver<WorkerSettings>,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        queue_name: impl Into<String>,
        migrator: Arc<RecordMigrator>,
        coordinator: Coordinator,
        settings: watch::Receiver<WorkerSettings>,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            migrator,
            coordinator,
            settings,
        }
    }

    /// Reserve and handle at most one task. `None` when the queue has
    /// nothing ready.
    pub async fn poll_once(&self) -> Result<Option<TaskDisposition>, MigrationError> {
        let Some(task) = self.queue.reserve(&self.queue_name).await? else {
            return Ok(None);
        };
        let settings = *self.settings.borrow();
        let disposition = self.handle(&task, settings).await?;
        metrics::record_task_action(disposition.label());
        Ok(Some(disposition))
    }

    /// Consume tasks until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.queue_name, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.poll_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(error = %e, "Failed to process task");
                    true
                }
            };

            if idle {
                let poll_interval = self.settings.borrow().poll_interval;
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(queue = %self.queue_name, "Worker stopped");
    }

    async fn handle(
        &self,
        task: &ReservedTask,
        settings: WorkerSettings,
    ) -> Result<TaskDisposition, MigrationError> {
        let record_id = task.payload.record_id;
        let run_id = task.payload.run_id;

        // Only reachable when the reaper cleared a claim after the last try.
        if task.attempts > settings.max_tries {
            let record = self.migrator.records().get_record(record_id).await?;
            if record.is_none_or(|r| r.migrated) {
                self.queue.delete(task.id).await?;
                return Ok(TaskDisposition::Skipped);
            }
            return self
                .terminal_failure(task, "exceeded maximum tries")
                .await;
        }

        match self.migrator.migrate(record_id).await {
            Ok(RecordOutcome::TransientFailure { error, .. }) => {
                self.retry_or_bury(task, &error, settings).await
            }
            Ok(outcome) => {
                // Transient failures were routed above, so this is permanent.
                if let Some(error) = outcome.error() {
                    self.coordinator
                        .tracker()
                        .log_record_error(run_id, record_id, error)
                        .await;
                }
                let disposition = outcome.disposition();
                if let Some(disposition) = disposition {
                    self.coordinator.settle(run_id, disposition).await;
                }
                self.queue.delete(task.id).await?;
                debug!(task_id = task.id, record_id, outcome = outcome.label(), "Task done");
                Ok(disposition.map_or(TaskDisposition::Skipped, TaskDisposition::Acknowledged))
            }
            Err(e) => {
                warn!(
                    task_id = task.id,
                    record_id,
                    error = %e,
                    "Task failed outside the record's scope"
                );
                self.retry_or_bury(task, &e.to_string(), settings).await
            }
        }
    }

    async fn retry_or_bury(
        &self,
        task: &ReservedTask,
        error: &str,
        settings: WorkerSettings,
    ) -> Result<TaskDisposition, MigrationError> {
        if task.attempts < settings.max_tries {
            self.queue.release(task.id, settings.backoff).await?;
            info!(
                task_id = task.id,
                record_id = task.payload.record_id,
                attempts = task.attempts,
                max_tries = settings.max_tries,
                backoff_secs = settings.backoff.as_secs(),
                "Task released for retry"
            );
            return Ok(TaskDisposition::Released {
                delay: settings.backoff,
            });
        }
        self.terminal_failure(task, error).await
    }

    async fn terminal_failure(
        &self,
        task: &ReservedTask,
        error: &str,
    ) -> Result<TaskDisposition, MigrationError> {
        let record_id = task.payload.record_id;
        let message = truncate_error(&format!("Job permanently failed: {}", error));

        error!(
            task_id = task.id,
            record_id,
            run_id = %task.payload.run_id,
            error = %error,
            "Job permanently failed"
        );

        self.migrator
            .records()
            .force_exhausted(record_id, self.migrator.max_attempts(), &message, Utc::now())
            .await?;
        self.coordinator
            .tracker()
            .log_record_error(task.payload.run_id, record_id, &message)
            .await;
        self.coordinator
            .settle(task.payload.run_id, Disposition::Failed)
            .await;
        self.queue.bury(task, &message).await?;

        Ok(TaskDisposition::Buried)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::{MemoryObjectStore, MemoryQueue, MemoryStore};
    use crate::migration::keys::KeyLayout;
    use crate::migration::tracker::RunTracker;
    use archiver_types::{MigrationTask, Record, RunId};
    use pretty_assertions::assert_eq;

    struct Harness {
        store: Arc<MemoryStore>,
        objects: Arc<MemoryObjectStore>,
        queue: Arc<MemoryQueue>,
        tracker: RunTracker,
        worker: QueueWorker,
        _settings: watch::Sender<WorkerSettings>,
    }

    fn harness(max_tries: i32) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let objects = Arc::new(MemoryObjectStore::new("bucket"));
        let queue = Arc::new(MemoryQueue::new());
        let tracker = RunTracker::new(store.clone());
        let migrator = Arc::new(RecordMigrator::new(
            store.clone(),
            objects.clone(),
            KeyLayout::default(),
            "/nonexistent",
            3,
        ));
        let (tx, rx) = watch::channel(WorkerSettings {
            max_tries,
            backoff: Duration::from_secs(300),
            poll_interval: Duration::from_millis(10),
        });
        let worker = QueueWorker::new(
            queue.clone(),
            "q",
            migrator,
            Coordinator::new(tracker.clone()),
            rx,
        );
        Harness {
            store,
            objects,
            queue,
            tracker,
            worker,
            _settings: tx,
        }
    }

    impl Harness {
        async fn publish(&self, run_id: RunId, record_id: i64) {
            self.queue
                .enqueue("q", &MigrationTask { record_id, run_id }, Duration::ZERO)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn empty_queue_polls_nothing() {
        let h = harness(3);
        assert_eq!(h.worker.poll_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn success_counts_processed_and_deletes() {
        let h = harness(3);
        h.store.insert_record(Record::new(1, "b", "text/html"));
        let run = h.tracker.create_run(1).await.unwrap();
        h.publish(run.id, 1).await;

        let disposition = h.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(
            disposition,
            TaskDisposition::Acknowledged(Disposition::Processed)
        );
        assert!(h.queue.tasks().is_empty());

        let stored = h.store.run(run.id).unwrap();
        assert_eq!(stored.processed_count, 1);
        assert!(stored.is_completed());
    }

    #[tokio::test]
    async fn duplicate_task_is_skipped_without_counting() {
        let h = harness(3);
        h.store.insert_record(Record::new(1, "b", "text/html"));
        let run = h.tracker.create_run(1).await.unwrap();
        h.publish(run.id, 1).await;
        h.publish(run.id, 1).await;

        h.worker.poll_once().await.unwrap();
        let second = h.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(second, TaskDisposition::Skipped);
        assert_eq!(h.store.run(run.id).unwrap().processed_count, 1);
        assert_eq!(h.objects.put_count(), 1);
    }

    #[tokio::test]
    async fn transient_failure_is_released_with_backoff() {
        let h = harness(3);
        h.store.insert_record(Record::new(2, "b", "text/html"));
        h.objects.fail_key("records/0/2.html");
        let run = h.tracker.create_run(1).await.unwrap();
        h.publish(run.id, 2).await;

        let disposition = h.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(
            disposition,
            TaskDisposition::Released {
                delay: Duration::from_secs(300)
            }
        );

        let tasks = h.queue.tasks();
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].reserved_at.is_none());
        assert!(tasks[0].available_at > Utc::now());

        // Not counted until the task settles.
        let stored = h.store.run(run.id).unwrap();
        assert_eq!(stored.failed_count, 0);
        assert_eq!(h.store.record(2).unwrap().attempts, 1);

        // The retry succeeds once the store recovers.
        h.objects.clear_failures();
        h.queue.make_all_available();
        assert_eq!(
            h.worker.poll_once().await.unwrap().unwrap(),
            TaskDisposition::Acknowledged(Disposition::Processed)
        );
        assert!(h.store.run(run.id).unwrap().is_completed());
    }

    #[tokio::test]
    async fn last_try_runs_the_terminal_hook() {
        let h = harness(2);
        h.store.insert_record(Record::new(3, "b", "text/html"));
        h.objects.fail_key("records/0/3.html");
        let run = h.tracker.create_run(1).await.unwrap();
        h.publish(run.id, 3).await;

        h.worker.poll_once().await.unwrap();
        h.queue.make_all_available();
        let disposition = h.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(disposition, TaskDisposition::Buried);

        let record = h.store.record(3).unwrap();
        assert_eq!(record.attempts, 3);
        assert!(
            record
                .last_error
                .unwrap()
                .starts_with("Job permanently failed: ")
        );

        let buried = h.queue.buried();
        assert_eq!(buried.len(), 1);
        assert!(h.queue.tasks().is_empty());

        let stored = h.store.run(run.id).unwrap();
        assert_eq!(stored.failed_count, 1);
        assert!(stored.is_completed());
        assert_eq!(stored.error_log.len(), 1);
        assert_eq!(stored.error_log[0].record_id, Some(3));
        assert!(stored.error_log[0].message.starts_with("Job permanently failed: "));
    }

    #[tokio::test]
    async fn permanent_failure_is_counted_once() {
        let h = harness(3);
        let mut record = Record::new(4, "b", "text/html");
        record.attempts = 2;
        h.store.insert_record(record);
        h.objects.fail_key("records/0/4.html");
        let run = h.tracker.create_run(1).await.unwrap();
        h.publish(run.id, 4).await;

        let disposition = h.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(
            disposition,
            TaskDisposition::Acknowledged(Disposition::Failed)
        );
        assert!(h.queue.tasks().is_empty());
        assert!(h.queue.buried().is_empty());

        let stored = h.store.run(run.id).unwrap();
        assert_eq!(stored.failed_count, 1);
        assert_eq!(stored.error_log.len(), 1);
        assert_eq!(stored.error_log[0].record_id, Some(4));
    }

    #[tokio::test]
    async fn released_task_leaves_the_error_log_alone() {
        let h = harness(3);
        h.store.insert_record(Record::new(6, "b", "text/html"));
        h.objects.fail_key("records/0/6.html");
        let run = h.tracker.create_run(1).await.unwrap();
        h.publish(run.id, 6).await;

        h.worker.poll_once().await.unwrap();
        assert!(h.store.run(run.id).unwrap().error_log.is_empty());
    }

    #[tokio::test]
    async fn reclaimed_task_past_its_tries_is_buried() {
        let h = harness(1);
        h.store.insert_record(Record::new(5, "b", "text/html"));
        let run = h.tracker.create_run(1).await.unwrap();
        h.publish(run.id, 5).await;

        // A worker reserved the task and died; the reaper cleared the claim.
        let reserved = h.queue.reserve("q").await.unwrap().unwrap();
        h.queue.backdate_claim(reserved.id, Utc::now() - chrono::Duration::hours(1));
        h.queue
            .clear_stale_claims(Utc::now() - chrono::Duration::minutes(30))
            .await
            .unwrap();

        let disposition = h.worker.poll_once().await.unwrap().unwrap();
        assert_eq!(disposition, TaskDisposition::Buried);
        assert_eq!(h.objects.put_count(), 0);
        assert_eq!(h.store.record(5).unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness(3);
        let (tx, rx) = watch::channel(false);
        let worker = Arc::new(h.worker);
        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run(rx).await })
        };
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
