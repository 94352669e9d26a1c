// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Persisted run lifecycle

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use archiver_types::{ErrorLogEntry, MigrationRun, RecordId, RunId};

use super::{MigrationError, truncate_error};
use crate::metrics;
use crate::store::{ClaimGuard, RunStore};

/// Exclusive right to start or resume runs, held by one operator command.
pub struct MigrationLock {
    guard: Box<dyn ClaimGuard>,
}

impl MigrationLock {
    pub async fn release(mut self) -> Result<(), MigrationError> {
        Ok(self.guard.release().await?)
    }
}

/// Creates, reloads and finishes migration runs.
///
/// Every mutation is a single-row conditional write, so the tracker can be
/// shared by any number of dispatchers and workers across processes.
#[derive(Clone)]
pub struct RunTracker {
    runs: Arc<dyn RunStore>,
}

impl RunTracker {
    pub fn new(runs: Arc<dyn RunStore>) -> Self {
        Self { runs }
    }

    /// Start a run over `eligible_count` records. The total is a snapshot and
    /// never recomputed.
    pub async fn create_run(&self, eligible_count: i64) -> Result<MigrationRun, MigrationError> {
        let run = MigrationRun::new(eligible_count.max(0), Utc::now());
        self.runs.insert_run(&run).await?;
        info!(run_id = %run.id, total = run.total_count, "Created migration run");
        Ok(run)
    }

    /// Fails with [`MigrationError::AlreadyRunning`] while another command
    /// holds the lock.
    pub async fn lock_migration(&self) -> Result<MigrationLock, MigrationError> {
        match self.runs.try_lock_migration().await? {
            Some(guard) => Ok(MigrationLock { guard }),
            None => Err(MigrationError::AlreadyRunning),
        }
    }

    pub async fn find_run(&self, id: RunId) -> Result<MigrationRun, MigrationError> {
        self.runs
            .get_run(id)
            .await?
            .ok_or(MigrationError::RunNotFound(id))
    }

    pub async fn list_runs(&self, limit: i64) -> Result<Vec<MigrationRun>, MigrationError> {
        Ok(self.runs.list_runs(limit).await?)
    }

    /// Reload a run for further dispatch and move it to `processing`.
    ///
    /// A completed run cannot be resumed.
    pub async fn resume(&self, id: RunId) -> Result<MigrationRun, MigrationError> {
        let run = self.find_run(id).await?;
        if run.is_completed() {
            return Err(MigrationError::RunCompleted(id));
        }
        if self.runs.mark_processing(id).await? {
            info!(run_id = %id, from = %run.status, "Resumed migration run");
        }
        self.find_run(id).await
    }

    /// Move a pending or failed run to `processing`. No-op otherwise.
    pub async fn mark_processing(&self, id: RunId) -> Result<(), MigrationError> {
        self.runs.mark_processing(id).await?;
        Ok(())
    }

    /// Advance the dispatch cursor from `expected` to `cursor`. Returns
    /// `false` when another dispatcher moved the cursor first.
    pub async fn record_dispatch(
        &self,
        id: RunId,
        expected: RecordId,
        cursor: RecordId,
        dispatched: i64,
    ) -> Result<bool, MigrationError> {
        Ok(self
            .runs
            .advance_dispatch_cursor(id, expected, cursor, dispatched)
            .await?)
    }

    /// Lock-free increment of the run counters.
    pub async fn record_outcome(
        &self,
        id: RunId,
        processed: i64,
        failed: i64,
    ) -> Result<(), MigrationError> {
        if processed == 0 && failed == 0 {
            return Ok(());
        }
        Ok(self.runs.add_outcomes(id, processed, failed).await?)
    }

    pub async fn advance_processed_cursor(
        &self,
        id: RunId,
        cursor: RecordId,
    ) -> Result<(), MigrationError> {
        Ok(self.runs.advance_processed_cursor(id, cursor).await?)
    }

    /// Complete the run iff every record is accounted for. Safe to call
    /// redundantly; only the caller that makes the transition gets `true`.
    pub async fn try_complete(&self, id: RunId) -> Result<bool, MigrationError> {
        let completed = self.runs.complete_if_settled(id, Utc::now()).await?;
        if completed {
            metrics::record_run_completed();
            info!(run_id = %id, "Migration run completed");
        }
        Ok(completed)
    }

    /// Complete the run regardless of its counters. Used once a batch-loop
    /// selection comes back empty.
    pub async fn complete(&self, id: RunId) -> Result<bool, MigrationError> {
        let completed = self.runs.complete(id, Utc::now()).await?;
        if completed {
            metrics::record_run_completed();
            info!(run_id = %id, "Migration run completed (nothing left to select)");
        }
        Ok(completed)
    }

    /// Record that an invocation aborted on an infrastructure error.
    pub async fn fail_run(&self, id: RunId, message: &str) -> Result<bool, MigrationError> {
        let entry = ErrorLogEntry {
            at: Utc::now(),
            record_id: None,
            message: truncate_error(message),
        };
        let failed = self.runs.mark_failed(id, &entry).await?;
        if failed {
            warn!(run_id = %id, error = %message, "Migration run marked failed");
        }
        Ok(failed)
    }

    /// Append a record failure to the run's error log. Best effort.
    pub async fn log_record_error(&self, id: RunId, record_id: RecordId, message: &str) {
        let entry = ErrorLogEntry {
            at: Utc::now(),
            record_id: Some(record_id),
            message: truncate_error(message),
        };
        if let Err(e) = self.runs.append_error(id, &entry).await {
            warn!(run_id = %id, record_id, error = %e, "Failed to append run error log");
            metrics::record_db_operation_failure();
        }
    }
}
