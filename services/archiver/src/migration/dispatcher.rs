// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Work dispatch strategies
//!
//! Both strategies hand records out in ascending id order and resume from a
//! monotonic cursor on the run.
//!
//! # Batch loop
//!
//! [`BatchDispatcher`] claims up to N eligible ids past `last_processed_id`
//! under an exclusive per-run claim and migrates them in-process. Concurrent
//! batch loops over the same run serialize on the claim, so each id is
//! selected once. An empty selection completes the run.
//!
//! # Fan-out
//!
//! [`FanOutDispatcher`] scans eligible ids past `last_dispatched_id` without
//! a lock and publishes one queue task per id, each delayed a little more
//! than the previous one. The cursor moves by compare-and-swap only after a
//! page is published, so dispatch is at-least-once: two dispatchers racing
//! on the same run can publish overlapping pages, and the migrator's
//! already-migrated short-circuit absorbs the duplicates. Completion is
//! driven by workers through the [`Coordinator`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use archiver_types::{MigrationTask, ProcessingResult, RecordId, RunId};

use super::MigrationError;
use super::coordinator::{Coordinator, Disposition};
use super::migrator::RecordMigrator;
use super::tracker::RunTracker;
use crate::queue::TaskQueue;
use crate::store::{RecordStore, RunStore};

// ============================================================================
// Batch loop
// ============================================================================

pub struct BatchDispatcher {
    runs: Arc<dyn RunStore>,
    tracker: RunTracker,
    coordinator: Coordinator,
    migrator: Arc<RecordMigrator>,
    batch_size: i64,
}

impl BatchDispatcher {
    pub fn new(runs: Arc<dyn RunStore>, migrator: Arc<RecordMigrator>, batch_size: i64) -> Self {
        let tracker = RunTracker::new(runs.clone());
        Self {
            coordinator: Coordinator::new(tracker.clone()),
            runs,
            tracker,
            migrator,
            batch_size: batch_size.max(1),
        }
    }

    /// Claim and migrate one slice of the run.
    ///
    /// Per-record failures are counted in the result. An infrastructure
    /// failure persists the progress made so far, marks the run failed and
    /// is returned; the run can be resumed later.
    pub async fn process_batch(&self, run_id: RunId) -> Result<ProcessingResult, MigrationError> {
        match self.process_slice(run_id).await {
            Ok(result) => Ok(result),
            Err(e @ MigrationError::RunNotFound(_)) => Err(e),
            Err(e) => {
                if let Err(fail_err) = self.tracker.fail_run(run_id, &e.to_string()).await {
                    warn!(run_id = %run_id, error = %fail_err, "Failed to mark run failed");
                }
                Err(e)
            }
        }
    }

    /// Call [`BatchDispatcher::process_batch`] until the run completes.
    /// `on_slice` sees every slice result, including the final one.
    pub async fn run_to_completion(
        &self,
        run_id: RunId,
        mut on_slice: impl FnMut(&ProcessingResult),
    ) -> Result<ProcessingResult, MigrationError> {
        let mut total = ProcessingResult::default();
        loop {
            let slice = self.process_batch(run_id).await?;
            on_slice(&slice);
            total.absorb(&slice);
            if slice.is_complete {
                return Ok(total);
            }
        }
    }

    async fn process_slice(&self, run_id: RunId) -> Result<ProcessingResult, MigrationError> {
        let run = self.tracker.find_run(run_id).await?;
        if run.is_completed() {
            return Ok(ProcessingResult::complete());
        }
        self.tracker.mark_processing(run_id).await?;

        let claim = self
            .runs
            .claim_batch(run_id, self.batch_size, self.migrator.max_attempts())
            .await?;

        if claim.is_empty() {
            claim.release().await?;
            self.tracker.complete(run_id).await?;
            return Ok(ProcessingResult::complete());
        }

        debug!(
            run_id = %run_id,
            cursor = claim.cursor,
            count = claim.record_ids.len(),
            "Claimed batch"
        );

        let mut result = ProcessingResult::default();
        let mut last_id = claim.cursor;
        let mut aborted = None;

        for &record_id in &claim.record_ids {
            match self.migrator.migrate(record_id).await {
                Ok(outcome) => {
                    match outcome.disposition() {
                        Some(Disposition::Processed) => result.processed += 1,
                        Some(Disposition::Failed) => result.failed += 1,
                        None => {}
                    }
                    if let Some(error) = outcome.error().filter(|_| !outcome.is_transient()) {
                        self.tracker.log_record_error(run_id, record_id, error).await;
                    }
                    last_id = record_id;
                }
                Err(e) => {
                    aborted = Some(e);
                    break;
                }
            }
        }

        // Record whatever was finished, even when the slice was cut short.
        let persisted = self.persist_progress(run_id, claim.cursor, last_id, &result).await;
        let released = claim.release().await;

        if let Some(e) = aborted {
            if let Err(persist_err) = persisted {
                warn!(run_id = %run_id, error = %persist_err, "Failed to persist partial progress");
            }
            return Err(e);
        }
        persisted?;
        released?;

        info!(
            run_id = %run_id,
            last_id,
            processed = result.processed,
            failed = result.failed,
            "Processed batch"
        );
        Ok(result)
    }

    async fn persist_progress(
        &self,
        run_id: RunId,
        from: RecordId,
        to: RecordId,
        result: &ProcessingResult,
    ) -> Result<(), MigrationError> {
        // Cursor first: a crash between the two writes then under-counts
        // rather than handing the same failed records out again.
        if to > from {
            self.tracker.advance_processed_cursor(run_id, to).await?;
        }
        self.coordinator
            .record_slice(run_id, result.processed, result.failed)
            .await
    }
}

// ============================================================================
// Fan-out
// ============================================================================

/// One published page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPage {
    pub published: usize,
    pub first_id: RecordId,
    pub last_id: RecordId,
    /// Whether this dispatcher moved the cursor. `false` means another
    /// dispatcher moved it first and part of this page may be duplicated.
    pub advanced: bool,
}

pub struct FanOutDispatcher {
    tracker: RunTracker,
    records: Arc<dyn RecordStore>,
    queue: Arc<dyn TaskQueue>,
    queue_name: String,
    page_size: i64,
    stagger: Duration,
    max_attempts: i32,
}

impl FanOutDispatcher {
    pub fn new(
        tracker: RunTracker,
        records: Arc<dyn RecordStore>,
        queue: Arc<dyn TaskQueue>,
        queue_name: impl Into<String>,
        max_attempts: i32,
    ) -> Self {
        Self {
            tracker,
            records,
            queue,
            queue_name: queue_name.into(),
            page_size: 10,
            stagger: Duration::from_millis(100),
            max_attempts,
        }
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Delay added per task within a page.
    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    /// Publish the next page past the run's dispatch cursor. `None` once a
    /// scan finds nothing left to publish.
    pub async fn dispatch_page(&self, run_id: RunId) -> Result<Option<DispatchPage>, MigrationError> {
        let run = self.tracker.find_run(run_id).await?;
        if run.is_completed() {
            return Ok(None);
        }

        let cursor = run.last_dispatched_id;
        let ids = self
            .records
            .eligible_after(cursor, self.page_size, self.max_attempts)
            .await?;
        let (Some(&first_id), Some(&last_id)) = (ids.first(), ids.last()) else {
            return Ok(None);
        };

        for (index, &record_id) in ids.iter().enumerate() {
            let delay = self
                .stagger
                .saturating_mul(u32::try_from(index).unwrap_or(u32::MAX));
            let task = MigrationTask { record_id, run_id };
            self.queue.enqueue(&self.queue_name, &task, delay).await?;
        }

        let published = ids.len();
        let advanced = self
            .tracker
            .record_dispatch(
                run_id,
                cursor,
                last_id,
                i64::try_from(published).unwrap_or(i64::MAX),
            )
            .await?;

        if advanced {
            debug!(run_id = %run_id, first_id, last_id, published, "Dispatched page");
        } else {
            warn!(
                run_id = %run_id,
                first_id,
                last_id,
                "Dispatch cursor moved concurrently, page may be duplicated"
            );
        }

        Ok(Some(DispatchPage {
            published,
            first_id,
            last_id,
            advanced,
        }))
    }

    /// Publish pages until a scan comes back empty. Returns the number of
    /// tasks published by this call.
    ///
    /// The run completes here only if nothing is left to settle (for
    /// example an empty run); otherwise workers complete it.
    pub async fn dispatch_all(&self, run_id: RunId) -> Result<u64, MigrationError> {
        match self.dispatch_pages(run_id).await {
            Ok(published) => Ok(published),
            Err(e @ MigrationError::RunNotFound(_)) => Err(e),
            Err(e) => {
                if let Err(fail_err) = self.tracker.fail_run(run_id, &e.to_string()).await {
                    warn!(run_id = %run_id, error = %fail_err, "Failed to mark run failed");
                }
                Err(e)
            }
        }
    }

    async fn dispatch_pages(&self, run_id: RunId) -> Result<u64, MigrationError> {
        let run = self.tracker.find_run(run_id).await?;
        if run.is_completed() {
            return Ok(0);
        }
        self.tracker.mark_processing(run_id).await?;

        let mut published = 0u64;
        while let Some(page) = self.dispatch_page(run_id).await? {
            published += page.published as u64;
        }

        self.tracker.try_complete(run_id).await?;
        info!(run_id = %run_id, published, "Dispatch finished");
        Ok(published)
    }
}
