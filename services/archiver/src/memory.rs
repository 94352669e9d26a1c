// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! In-memory implementations of the storage, queue and object store traits
//!
//! These mirror the single-row semantics of the PostgreSQL and S3 backends
//! closely enough to exercise the engine in tests without external services.
//! They also expose a few knobs for injecting failures.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use archiver_types::{
    Attachment, AttachmentId, ErrorLogEntry, MigrationRun, MigrationTask, QueueStats, Record,
    RecordId, RunId, RunStatus, StaleClaim, TaskId,
};

use crate::db::DbError;
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::queue::{ReservedTask, TaskQueue, chrono_delay};
use crate::store::{BatchClaim, ClaimGuard, RecordStore, RunStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Run and record store
// ============================================================================

#[derive(Default)]
struct StoreState {
    runs: HashMap<RunId, MigrationRun>,
    records: BTreeMap<RecordId, Record>,
    attachments: HashMap<AttachmentId, Attachment>,
}

/// Runs, records and attachments held in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    claim_locks: Mutex<HashMap<RunId, Arc<tokio::sync::Mutex<()>>>>,
    migration_lock: Arc<tokio::sync::Mutex<()>>,
    fail_mark_migrated: AtomicBool,
    fail_counter_updates: AtomicBool,
    completions: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_record(&self, record: Record) {
        lock(&self.state).records.insert(record.id, record);
    }

    pub fn insert_attachment(&self, attachment: Attachment) {
        lock(&self.state)
            .attachments
            .insert(attachment.id, attachment);
    }

    pub fn record(&self, id: RecordId) -> Option<Record> {
        lock(&self.state).records.get(&id).cloned()
    }

    pub fn attachment(&self, id: AttachmentId) -> Option<Attachment> {
        lock(&self.state).attachments.get(&id).cloned()
    }

    pub fn run(&self, id: RunId) -> Option<MigrationRun> {
        lock(&self.state).runs.get(&id).cloned()
    }

    /// Make `mark_migrated` fail, as if the database went away mid-record.
    pub fn set_fail_mark_migrated(&self, fail: bool) {
        self.fail_mark_migrated.store(fail, Ordering::SeqCst);
    }

    /// Transitions into `completed` across all runs.
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    /// Make run counter increments fail.
    pub fn set_fail_counter_updates(&self, fail: bool) {
        self.fail_counter_updates.store(fail, Ordering::SeqCst);
    }

    fn with_run<T>(
        &self,
        id: RunId,
        f: impl FnOnce(&mut MigrationRun) -> T,
    ) -> Result<T, DbError> {
        let mut state = lock(&self.state);
        let run = state
            .runs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(id.to_string()))?;
        Ok(f(run))
    }

    fn claim_lock(&self, id: RunId) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.claim_locks).entry(id).or_default().clone()
    }

    fn eligible_ids(&self, after: RecordId, limit: i64, max_attempts: i32) -> Vec<RecordId> {
        let limit = usize::try_from(limit).unwrap_or(0);
        lock(&self.state)
            .records
            .range(after.saturating_add(1)..)
            .filter(|(_, r)| r.is_eligible(max_attempts))
            .map(|(id, _)| *id)
            .take(limit)
            .collect()
    }
}

struct MemoryClaimGuard {
    guard: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl ClaimGuard for MemoryClaimGuard {
    async fn release(&mut self) -> Result<(), DbError> {
        self.guard.take();
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn insert_run(&self, run: &MigrationRun) -> Result<(), DbError> {
        lock(&self.state).runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<MigrationRun>, DbError> {
        Ok(self.run(id))
    }

    async fn list_runs(&self, limit: i64) -> Result<Vec<MigrationRun>, DbError> {
        let mut runs: Vec<MigrationRun> = lock(&self.state).runs.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(runs)
    }

    async fn mark_processing(&self, id: RunId) -> Result<bool, DbError> {
        self.with_run(id, |run| {
            if matches!(run.status, RunStatus::Pending | RunStatus::Failed) {
                run.status = RunStatus::Processing;
                true
            } else {
                false
            }
        })
    }

    async fn mark_failed(&self, id: RunId, entry: &ErrorLogEntry) -> Result<bool, DbError> {
        self.with_run(id, |run| {
            if matches!(run.status, RunStatus::Pending | RunStatus::Processing) {
                run.status = RunStatus::Failed;
                run.error_log.push(entry.clone());
                true
            } else {
                false
            }
        })
    }

    async fn append_error(&self, id: RunId, entry: &ErrorLogEntry) -> Result<(), DbError> {
        self.with_run(id, |run| run.error_log.push(entry.clone()))
    }

    async fn add_outcomes(&self, id: RunId, processed: i64, failed: i64) -> Result<(), DbError> {
        if self.fail_counter_updates.load(Ordering::SeqCst) {
            return Err(DbError::Connection("counter updates disabled".to_string()));
        }
        self.with_run(id, |run| {
            run.processed_count += processed;
            run.failed_count += failed;
        })
    }

    async fn advance_processed_cursor(&self, id: RunId, cursor: RecordId) -> Result<(), DbError> {
        self.with_run(id, |run| {
            run.last_processed_id = run.last_processed_id.max(cursor);
        })
    }

    async fn advance_dispatch_cursor(
        &self,
        id: RunId,
        expected: RecordId,
        cursor: RecordId,
        dispatched: i64,
    ) -> Result<bool, DbError> {
        self.with_run(id, |run| {
            if run.last_dispatched_id == expected && cursor > expected {
                run.last_dispatched_id = cursor;
                run.dispatched_count += dispatched;
                true
            } else {
                false
            }
        })
    }

    async fn complete_if_settled(&self, id: RunId, at: DateTime<Utc>) -> Result<bool, DbError> {
        Ok(self
            .with_run(id, |run| {
                if run.status != RunStatus::Completed && run.totals_reached() {
                    run.status = RunStatus::Completed;
                    run.completed_at = Some(at);
                    self.completions.fetch_add(1, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false))
    }

    async fn complete(&self, id: RunId, at: DateTime<Utc>) -> Result<bool, DbError> {
        Ok(self
            .with_run(id, |run| {
                if run.status != RunStatus::Completed {
                    run.status = RunStatus::Completed;
                    run.completed_at = Some(at);
                    self.completions.fetch_add(1, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false))
    }

    async fn claim_batch(
        &self,
        id: RunId,
        limit: i64,
        max_attempts: i32,
    ) -> Result<BatchClaim, DbError> {
        let guard = self.claim_lock(id).lock_owned().await;
        let cursor = self.with_run(id, |run| run.last_processed_id)?;
        let ids = self.eligible_ids(cursor, limit, max_attempts);
        Ok(BatchClaim::new(
            cursor,
            ids,
            Box::new(MemoryClaimGuard {
                guard: Some(guard),
            }),
        ))
    }

    async fn try_lock_migration(&self) -> Result<Option<Box<dyn ClaimGuard>>, DbError> {
        Ok(self
            .migration_lock
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| -> Box<dyn ClaimGuard> {
                Box::new(MemoryClaimGuard { guard: Some(guard) })
            }))
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn count_eligible(&self, max_attempts: i32) -> Result<i64, DbError> {
        let count = lock(&self.state)
            .records
            .values()
            .filter(|r| r.is_eligible(max_attempts))
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn eligible_after(
        &self,
        after: RecordId,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<RecordId>, DbError> {
        Ok(self.eligible_ids(after, limit, max_attempts))
    }

    async fn get_record(&self, id: RecordId) -> Result<Option<Record>, DbError> {
        Ok(self.record(id))
    }

    async fn get_attachment(&self, id: AttachmentId) -> Result<Option<Attachment>, DbError> {
        Ok(self.attachment(id))
    }

    async fn mark_attachment_migrated(
        &self,
        id: AttachmentId,
        location: &str,
    ) -> Result<(), DbError> {
        let mut state = lock(&self.state);
        let attachment = state
            .attachments
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("attachment {}", id)))?;
        attachment.location = Some(location.to_string());
        attachment.migrated = true;
        Ok(())
    }

    async fn mark_migrated(
        &self,
        id: RecordId,
        body_location: &str,
        attachment_locations: &BTreeMap<AttachmentId, String>,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        if self.fail_mark_migrated.load(Ordering::SeqCst) {
            return Err(DbError::Connection("record updates disabled".to_string()));
        }
        let mut state = lock(&self.state);
        match state.records.get_mut(&id) {
            Some(record) if !record.migrated => {
                record.body_location = Some(body_location.to_string());
                record.attachment_locations = attachment_locations.clone();
                record.migrated = true;
                record.last_attempted_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_failure(
        &self,
        id: RecordId,
        error: &str,
        at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<i32, DbError> {
        let mut state = lock(&self.state);
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("record {}", id)))?;
        if record.migrated {
            return Ok(record.attempts);
        }
        record.attempts = (record.attempts + 1).min(max_attempts);
        record.last_error = Some(error.to_string());
        record.last_attempted_at = Some(at);
        Ok(record.attempts)
    }

    async fn force_exhausted(
        &self,
        id: RecordId,
        max_attempts: i32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let mut state = lock(&self.state);
        if let Some(record) = state.records.get_mut(&id).filter(|r| !r.migrated) {
            record.attempts = record.attempts.max(max_attempts);
            record.last_error = Some(error.to_string());
            record.last_attempted_at = Some(at);
        }
        Ok(())
    }

    async fn failed_records(&self, max_attempts: i32, limit: i64) -> Result<Vec<Record>, DbError> {
        Ok(lock(&self.state)
            .records
            .values()
            .filter(|r| !r.migrated && r.attempts >= max_attempts)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn count_failed(&self, max_attempts: i32) -> Result<i64, DbError> {
        let count = lock(&self.state)
            .records
            .values()
            .filter(|r| !r.migrated && r.attempts >= max_attempts)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn reset_attempts(
        &self,
        ids: &[RecordId],
        max_attempts: i32,
    ) -> Result<Vec<RecordId>, DbError> {
        let mut state = lock(&self.state);
        let mut reset = Vec::new();
        for id in ids {
            if let Some(record) = state
                .records
                .get_mut(id)
                .filter(|r| !r.migrated && r.attempts >= max_attempts)
            {
                record.attempts = 0;
                record.last_error = None;
                reset.push(*id);
            }
        }
        reset.sort_unstable();
        reset.dedup();
        Ok(reset)
    }
}

// ============================================================================
// Task queue
// ============================================================================

/// A task as held by [`MemoryQueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub id: TaskId,
    pub queue: String,
    pub payload: MigrationTask,
    pub attempts: i32,
    pub delay: Duration,
    pub available_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct QueueState {
    next_id: TaskId,
    tasks: BTreeMap<TaskId, QueuedTask>,
    buried: Vec<(QueuedTask, String)>,
}

#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live tasks in publish order.
    pub fn tasks(&self) -> Vec<QueuedTask> {
        lock(&self.state).tasks.values().cloned().collect()
    }

    /// Buried tasks with the error they were buried with.
    pub fn buried(&self) -> Vec<(QueuedTask, String)> {
        lock(&self.state).buried.clone()
    }

    /// Skip every pending delay and backoff.
    pub fn make_all_available(&self) {
        let now = Utc::now();
        for task in lock(&self.state).tasks.values_mut() {
            task.available_at = task.available_at.min(now);
        }
    }

    /// Pretend a claim was taken at `at`.
    pub fn backdate_claim(&self, id: TaskId, at: DateTime<Utc>) {
        if let Some(task) = lock(&self.state).tasks.get_mut(&id) {
            if task.reserved_at.is_some() {
                task.reserved_at = Some(at);
            }
        }
    }

    fn stale(task: &QueuedTask, reserved_before: DateTime<Utc>) -> Option<StaleClaim> {
        task.reserved_at
            .filter(|at| *at <= reserved_before)
            .map(|reserved_at| StaleClaim {
                task_id: task.id,
                record_id: Some(task.payload.record_id),
                attempts: task.attempts,
                reserved_at,
            })
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(
        &self,
        queue: &str,
        task: &MigrationTask,
        delay: Duration,
    ) -> Result<TaskId, DbError> {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state.tasks.insert(
            id,
            QueuedTask {
                id,
                queue: queue.to_string(),
                payload: *task,
                attempts: 0,
                delay,
                available_at: Utc::now() + chrono_delay(delay),
                reserved_at: None,
            },
        );
        Ok(id)
    }

    async fn reserve(&self, queue: &str) -> Result<Option<ReservedTask>, DbError> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        let next = state
            .tasks
            .values_mut()
            .filter(|t| t.queue == queue && t.reserved_at.is_none() && t.available_at <= now)
            .min_by_key(|t| (t.available_at, t.id));

        Ok(next.map(|task| {
            task.attempts += 1;
            task.reserved_at = Some(now);
            ReservedTask {
                id: task.id,
                queue: task.queue.clone(),
                payload: task.payload,
                attempts: task.attempts,
                reserved_at: now,
            }
        }))
    }

    async fn delete(&self, id: TaskId) -> Result<(), DbError> {
        lock(&self.state).tasks.remove(&id);
        Ok(())
    }

    async fn release(&self, id: TaskId, delay: Duration) -> Result<(), DbError> {
        let mut state = lock(&self.state);
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))?;
        task.reserved_at = None;
        task.delay = delay;
        task.available_at = Utc::now() + chrono_delay(delay);
        Ok(())
    }

    async fn bury(&self, task: &ReservedTask, error: &str) -> Result<(), DbError> {
        let mut state = lock(&self.state);
        if let Some(queued) = state.tasks.remove(&task.id) {
            state.buried.push((queued, error.to_string()));
        }
        Ok(())
    }

    async fn stale_claims(
        &self,
        reserved_before: DateTime<Utc>,
    ) -> Result<Vec<StaleClaim>, DbError> {
        Ok(lock(&self.state)
            .tasks
            .values()
            .filter_map(|t| Self::stale(t, reserved_before))
            .collect())
    }

    async fn clear_stale_claims(
        &self,
        reserved_before: DateTime<Utc>,
    ) -> Result<Vec<StaleClaim>, DbError> {
        let mut cleared = Vec::new();
        for task in lock(&self.state).tasks.values_mut() {
            if let Some(claim) = Self::stale(task, reserved_before) {
                task.reserved_at = None;
                task.attempts += 1;
                cleared.push(claim);
            }
        }
        Ok(cleared)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, DbError> {
        let now = Utc::now();
        let state = lock(&self.state);
        let mut stats = QueueStats::default();
        for task in state.tasks.values().filter(|t| t.queue == queue) {
            match task.reserved_at {
                Some(_) => stats.reserved += 1,
                None if task.available_at <= now => stats.pending += 1,
                None => stats.delayed += 1,
            }
        }
        stats.failed = state
            .buried
            .iter()
            .filter(|(t, _)| t.queue == queue)
            .count() as i64;
        Ok(stats)
    }
}

// ============================================================================
// Object store
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: Option<String>,
}

/// Bucket held in process memory
pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    failing_keys: Mutex<HashSet<String>>,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            failing_keys: Mutex::new(HashSet::new()),
            puts: AtomicUsize::new(0),
        }
    }

    /// Every put to `key` fails until [`MemoryObjectStore::clear_failures`].
    pub fn fail_key(&self, key: &str) {
        lock(&self.failing_keys).insert(key.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.failing_keys).clear();
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    /// Put attempts, including failed ones.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    fn store(&self, key: &str, object: StoredObject) -> Result<String, ObjectStoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if lock(&self.failing_keys).contains(key) {
            return Err(ObjectStoreError::Status {
                key: key.to_string(),
                status: 503,
                message: "injected failure".to_string(),
            });
        }
        lock(&self.objects).insert(key.to_string(), object);
        Ok(key.to_string())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_content(
        &self,
        body: Bytes,
        key: &str,
        content_type: &str,
    ) -> Result<String, ObjectStoreError> {
        self.store(
            key,
            StoredObject {
                body,
                content_type: Some(content_type.to_string()),
            },
        )
    }

    async fn put_file(&self, local_path: &Path, key: &str) -> Result<String, ObjectStoreError> {
        let body = tokio::fs::read(local_path)
            .await
            .map_err(|e| ObjectStoreError::LocalRead {
                path: local_path.display().to_string(),
                message: e.to_string(),
            })?;
        self.store(
            key,
            StoredObject {
                body: Bytes::from(body),
                content_type: None,
            },
        )
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        Ok(lock(&self.objects).contains_key(key))
    }

    fn bucket_name(&self) -> &str {
        &self.bucket
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn task(record_id: RecordId) -> MigrationTask {
        MigrationTask {
            record_id,
            run_id: Uuid::nil(),
        }
    }

    #[tokio::test]
    async fn second_claim_waits_for_release() {
        let store = Arc::new(MemoryStore::new());
        let run = MigrationRun::new(0, Utc::now());
        store.insert_run(&run).await.unwrap();

        let first = store.claim_batch(run.id, 10, 3).await.unwrap();

        let contender = {
            let store = store.clone();
            tokio::spawn(async move { store.claim_batch(run.id, 10, 3).await.map(|c| c.cursor) })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        store.advance_processed_cursor(run.id, 9).await.unwrap();
        first.release().await.unwrap();

        // The contender reads the cursor only once it holds the lock.
        assert_eq!(contender.await.unwrap().unwrap(), 9);
    }

    #[tokio::test]
    async fn claim_for_unknown_run_is_not_found() {
        let store = MemoryStore::new();
        let result = store.claim_batch(Uuid::new_v4(), 10, 3).await;
        assert!(matches!(result, Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn reserve_skips_delayed_and_reserved_tasks() {
        let queue = MemoryQueue::new();
        queue
            .enqueue("q", &task(1), Duration::from_secs(3600))
            .await
            .unwrap();
        queue.enqueue("q", &task(2), Duration::ZERO).await.unwrap();

        let reserved = queue.reserve("q").await.unwrap().unwrap();
        assert_eq!(reserved.payload.record_id, 2);
        assert_eq!(reserved.attempts, 1);
        assert!(queue.reserve("q").await.unwrap().is_none());
        assert!(queue.reserve("other").await.unwrap().is_none());

        let stats = queue.stats("q").await.unwrap();
        assert_eq!(stats.reserved, 1);
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn object_store_failures_are_per_key() {
        let objects = MemoryObjectStore::new("bucket");
        objects.fail_key("bad");
        assert!(
            objects
                .put_content(Bytes::from_static(b"x"), "bad", "text/plain")
                .await
                .is_err()
        );
        objects
            .put_content(Bytes::from_static(b"x"), "good", "text/plain")
            .await
            .unwrap();
        assert_eq!(objects.keys(), vec!["good".to_string()]);
        assert_eq!(objects.put_count(), 2);
        assert!(objects.exists("good").await.unwrap());
        assert!(!objects.exists("bad").await.unwrap());
    }
}
