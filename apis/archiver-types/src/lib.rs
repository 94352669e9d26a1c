// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared types for the archiver engine, worker and admin CLI.
//!
//! A migration *run* moves every eligible record (a text body plus zero or
//! more attachments) into an object store. These types describe the run, the
//! records it operates on, and the task payloads exchanged through the queue.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, VariantNames};
use uuid::Uuid;

// ============================================================================
// Type Aliases
// ============================================================================

/// Record identifier (primary key of the host application's records table)
pub type RecordId = i64;

/// Attachment identifier
pub type AttachmentId = i64;

/// Queue task identifier
pub type TaskId = i64;

/// Run identifier
pub type RunId = Uuid;

// ============================================================================
// Run Types
// ============================================================================

/// Lifecycle state of a migration run.
///
/// Runs only move forward: `pending -> processing -> completed`. `failed` is
/// recorded when an invocation aborts on an infrastructure error; such a run
/// can be resumed, which moves it back to `processing`.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    VariantNames,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One entry of a run's structured error log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
    pub message: String,
}

/// Persisted state of one migration attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub id: RunId,
    /// Eligible records at creation time; never recomputed.
    pub total_count: i64,
    pub processed_count: i64,
    pub failed_count: i64,
    pub dispatched_count: i64,
    /// Highest record id finished by the batch loop.
    pub last_processed_id: RecordId,
    /// Highest record id published by the fan-out dispatcher.
    pub last_dispatched_id: RecordId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_log: Vec<ErrorLogEntry>,
}

impl MigrationRun {
    /// A fresh run over `total_count` eligible records.
    pub fn new(total_count: i64, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            total_count,
            processed_count: 0,
            failed_count: 0,
            dispatched_count: 0,
            last_processed_id: 0,
            last_dispatched_id: 0,
            status: RunStatus::Pending,
            started_at,
            completed_at: None,
            error_log: Vec::new(),
        }
    }

    /// Records that reached a final disposition (migrated or failed).
    pub fn settled_count(&self) -> i64 {
        self.processed_count + self.failed_count
    }

    /// Records not yet settled. Never negative.
    pub fn remaining(&self) -> i64 {
        (self.total_count - self.settled_count()).max(0)
    }

    /// Whether the counters say every record has been accounted for.
    pub fn totals_reached(&self) -> bool {
        self.settled_count() >= self.total_count
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Outcome of one batch-loop dispatch call. Not persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub is_complete: bool,
    pub processed: u64,
    pub failed: u64,
}

impl ProcessingResult {
    /// The result returned once a run has nothing left to select.
    pub fn complete() -> Self {
        Self {
            is_complete: true,
            processed: 0,
            failed: 0,
        }
    }

    /// Fold another slice's result into a running total.
    pub fn absorb(&mut self, other: &ProcessingResult) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.is_complete = other.is_complete;
    }
}

/// How eligible records are handed to workers.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    VariantNames,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// Claim a locked slice and migrate it in-process.
    #[default]
    Batch,
    /// Publish one queue task per record.
    FanOut,
}

// ============================================================================
// Record Types
// ============================================================================

/// A unit of migration: a text body plus attachments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub body: String,
    pub content_type: String,
    #[serde(default)]
    pub attachment_ids: Vec<AttachmentId>,
    pub migrated: bool,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub body_location: Option<String>,
    #[serde(default)]
    pub attachment_locations: BTreeMap<AttachmentId, String>,
}

impl Record {
    /// A fresh, unmigrated record.
    pub fn new(id: RecordId, body: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            id,
            body: body.into(),
            content_type: content_type.into(),
            attachment_ids: Vec::new(),
            migrated: false,
            attempts: 0,
            last_error: None,
            last_attempted_at: None,
            body_location: None,
            attachment_locations: BTreeMap::new(),
        }
    }

    pub fn with_attachments(mut self, ids: impl IntoIterator<Item = AttachmentId>) -> Self {
        self.attachment_ids = ids.into_iter().collect();
        self
    }

    /// Eligible iff not migrated and below the attempt cap.
    pub fn is_eligible(&self, max_attempts: i32) -> bool {
        !self.migrated && self.attempts < max_attempts
    }
}

/// Binary side-content referenced by a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    /// Original file name, used in the remote key.
    pub name: String,
    /// Path relative to the configured attachment root.
    pub path: String,
    pub migrated: bool,
    pub location: Option<String>,
}

impl Attachment {
    pub fn new(id: AttachmentId, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            path: path.into(),
            migrated: false,
            location: None,
        }
    }
}

// ============================================================================
// Queue Types
// ============================================================================

/// Payload of one fan-out task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationTask {
    pub record_id: RecordId,
    pub run_id: RunId,
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Ready to be reserved now.
    pub pending: i64,
    /// Waiting for a delay or backoff to elapse.
    pub delayed: i64,
    /// Currently claimed by a worker.
    pub reserved: i64,
    /// Tasks that exhausted their tries and were moved aside.
    pub failed: i64,
}

impl QueueStats {
    /// Each claimed task is held by one worker loop.
    pub fn active_workers_estimate(&self) -> i64 {
        self.reserved
    }
}

/// A task whose claim outlived the configured timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleClaim {
    pub task_id: TaskId,
    pub record_id: Option<RecordId>,
    pub attempts: i32,
    pub reserved_at: DateTime<Utc>,
}
