// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Migration orchestration engine
//!
//! A run moves every eligible record into the object store. The pieces:
//!
//! - [`tracker`]: persisted run lifecycle (create, resume, complete)
//! - [`dispatcher`]: hands eligible records out in ascending id order, either
//!   as locked in-process slices or as one queue task per record
//! - [`migrator`]: migrates one record and reports an explicit outcome
//! - [`coordinator`]: folds outcomes into the run counters and decides
//!   completion without serializing workers
//! - [`worker`]: consumes fan-out tasks and applies the task-level retry
//!   policy
//! - [`reaper`]: takes back queue claims whose worker is presumed dead
//! - [`failed`]: operator tooling for permanently failed records and the
//!   dry-run plan
//!
//! Record-scoped failures never surface as `Err`; they become a
//! [`RecordOutcome`] plus persisted attempt state. `Err` is reserved for
//! failures outside one record's scope (database connectivity, a missing
//! run).

pub mod coordinator;
pub mod dispatcher;
pub mod failed;
pub mod keys;
pub mod migrator;
pub mod reaper;
pub mod tracker;
pub mod worker;

use thiserror::Error;

use archiver_types::{AttachmentId, RecordId, RunId};

use crate::db::DbError;
use crate::object_store::ObjectStoreError;

pub use coordinator::{Coordinator, Disposition};
pub use dispatcher::{BatchDispatcher, DispatchPage, FanOutDispatcher};
pub use failed::{FailedRecords, PlannedUpload, RecordPlan};
pub use keys::KeyLayout;
pub use migrator::{RecordMigrator, RecordOutcome};
pub use reaper::{StaleClaimReaper, SweepReport};
pub use tracker::{MigrationLock, RunTracker};
pub use worker::{QueueWorker, TaskDisposition, WorkerSettings};

/// Longest error message persisted on a record, in characters.
pub const MAX_ERROR_LEN: usize = 1000;

/// Migration errors
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Network or object store failure while uploading
    #[error("Upload failed: {0}")]
    TransientUpload(#[from] ObjectStoreError),

    /// An attachment's row or backing file is missing
    #[error("Attachment {attachment_id} of record {record_id} not found: {detail}")]
    AttachmentNotFound {
        record_id: RecordId,
        attachment_id: AttachmentId,
        detail: String,
    },

    #[error("Migration run {0} not found")]
    RunNotFound(RunId),

    #[error("Migration run {0} is already completed")]
    RunCompleted(RunId),

    #[error("Migration is already running")]
    AlreadyRunning,

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

/// Cut `message` to at most [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
