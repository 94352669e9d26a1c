// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Persistence capabilities used by the migration engine
//!
//! The engine only talks to these traits. `postgres` holds the production
//! implementation; `crate::memory` holds the in-process doubles.

pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use archiver_types::{
    Attachment, AttachmentId, ErrorLogEntry, MigrationRun, Record, RecordId, RunId,
};

use crate::db::DbError;

pub use postgres::PgStore;

/// Holds the exclusive selection for one batch-loop slice until released.
#[async_trait]
pub trait ClaimGuard: Send {
    /// Give up the exclusive selection. Dropping without releasing must also
    /// give it up, possibly less gracefully.
    async fn release(&mut self) -> Result<(), DbError>;
}

/// A slice of eligible record ids selected under the run's exclusive lock.
pub struct BatchClaim {
    /// The run's last-processed cursor as read under the lock.
    pub cursor: RecordId,
    /// Ascending ids greater than `cursor`.
    pub record_ids: Vec<RecordId>,
    guard: Box<dyn ClaimGuard>,
}

impl BatchClaim {
    pub fn new(cursor: RecordId, record_ids: Vec<RecordId>, guard: Box<dyn ClaimGuard>) -> Self {
        Self {
            cursor,
            record_ids,
            guard,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.record_ids.is_empty()
    }

    pub async fn release(mut self) -> Result<(), DbError> {
        self.guard.release().await
    }
}

/// Persisted run state. Every mutation is a single-row atomic update.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: &MigrationRun) -> Result<(), DbError>;

    async fn get_run(&self, id: RunId) -> Result<Option<MigrationRun>, DbError>;

    /// Most recently started runs first.
    async fn list_runs(&self, limit: i64) -> Result<Vec<MigrationRun>, DbError>;

    /// `pending | failed -> processing`. Returns whether the row changed.
    async fn mark_processing(&self, id: RunId) -> Result<bool, DbError>;

    /// `pending | processing -> failed`, appending `entry` to the error log.
    async fn mark_failed(&self, id: RunId, entry: &ErrorLogEntry) -> Result<bool, DbError>;

    async fn append_error(&self, id: RunId, entry: &ErrorLogEntry) -> Result<(), DbError>;

    /// Lock-free increment of the processed and failed counters.
    async fn add_outcomes(&self, id: RunId, processed: i64, failed: i64) -> Result<(), DbError>;

    /// Move the last-processed cursor forward; never backwards.
    async fn advance_processed_cursor(&self, id: RunId, cursor: RecordId) -> Result<(), DbError>;

    /// Compare-and-swap of the last-dispatched cursor, adding `dispatched` to
    /// the dispatched count when the swap wins.
    async fn advance_dispatch_cursor(
        &self,
        id: RunId,
        expected: RecordId,
        cursor: RecordId,
        dispatched: i64,
    ) -> Result<bool, DbError>;

    /// Complete the run iff `processed + failed >= total` and it is not
    /// already completed. Returns whether this call made the transition.
    async fn complete_if_settled(&self, id: RunId, at: DateTime<Utc>) -> Result<bool, DbError>;

    /// Complete the run unconditionally unless it already is.
    async fn complete(&self, id: RunId, at: DateTime<Utc>) -> Result<bool, DbError>;

    /// Select up to `limit` eligible ids past the run's last-processed cursor,
    /// excluding every other batch-loop consumer of the same run until the
    /// returned claim is released.
    async fn claim_batch(
        &self,
        id: RunId,
        limit: i64,
        max_attempts: i32,
    ) -> Result<BatchClaim, DbError>;

    /// Take the process-wide lock that lets one operator command start or
    /// resume migrations at a time. `None` when someone else holds it.
    async fn try_lock_migration(&self) -> Result<Option<Box<dyn ClaimGuard>>, DbError>;
}

/// Access to the host application's records and attachments.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn count_eligible(&self, max_attempts: i32) -> Result<i64, DbError>;

    /// Ascending eligible ids greater than `after`. No locking.
    async fn eligible_after(
        &self,
        after: RecordId,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<RecordId>, DbError>;

    async fn get_record(&self, id: RecordId) -> Result<Option<Record>, DbError>;

    async fn get_attachment(&self, id: AttachmentId) -> Result<Option<Attachment>, DbError>;

    async fn mark_attachment_migrated(
        &self,
        id: AttachmentId,
        location: &str,
    ) -> Result<(), DbError>;

    /// Atomically store the remote locations and flip `migrated`. Returns
    /// `false` when the record was already migrated by someone else.
    async fn mark_migrated(
        &self,
        id: RecordId,
        body_location: &str,
        attachment_locations: &BTreeMap<AttachmentId, String>,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError>;

    /// Count one failed attempt, capped at `max_attempts`. Returns the new
    /// attempt count. A migrated record is left untouched.
    async fn record_failure(
        &self,
        id: RecordId,
        error: &str,
        at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<i32, DbError>;

    /// Raise attempts to `max_attempts` so the record is no longer eligible.
    async fn force_exhausted(
        &self,
        id: RecordId,
        max_attempts: i32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DbError>;

    /// Unmigrated records at or above the attempt cap, ascending by id.
    async fn failed_records(&self, max_attempts: i32, limit: i64) -> Result<Vec<Record>, DbError>;

    async fn count_failed(&self, max_attempts: i32) -> Result<i64, DbError>;

    /// Operator action: make the given records eligible again. Only records
    /// still unmigrated and at the cap are touched; their ids are returned
    /// in ascending order.
    async fn reset_attempts(
        &self,
        ids: &[RecordId],
        max_attempts: i32,
    ) -> Result<Vec<RecordId>, DbError>;
}
