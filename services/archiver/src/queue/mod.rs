// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Durable task queue used by fan-out dispatch
//!
//! Delivery is at-least-once. A reserved task carries a claim timestamp so
//! stale claims can be detected and an active-worker estimate computed.

pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use archiver_types::{MigrationTask, QueueStats, StaleClaim, TaskId};

use crate::db::DbError;

pub use postgres::PgTaskQueue;

/// A task claimed by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedTask {
    pub id: TaskId,
    pub queue: String,
    pub payload: MigrationTask,
    /// Tries so far, including this one.
    pub attempts: i32,
    pub reserved_at: DateTime<Utc>,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Publish a task that becomes reservable after `delay`.
    async fn enqueue(
        &self,
        queue: &str,
        task: &MigrationTask,
        delay: Duration,
    ) -> Result<TaskId, DbError>;

    /// Claim the next ready task, counting one try against it.
    async fn reserve(&self, queue: &str) -> Result<Option<ReservedTask>, DbError>;

    /// Acknowledge a finished task.
    async fn delete(&self, id: TaskId) -> Result<(), DbError>;

    /// Drop the claim and make the task reservable again after `delay`.
    async fn release(&self, id: TaskId, delay: Duration) -> Result<(), DbError>;

    /// Move a task that exhausted its tries out of the queue.
    async fn bury(&self, task: &ReservedTask, error: &str) -> Result<(), DbError>;

    /// Claims taken before `reserved_before`.
    async fn stale_claims(&self, reserved_before: DateTime<Utc>)
    -> Result<Vec<StaleClaim>, DbError>;

    /// Clear claims taken before `reserved_before`, counting one try against
    /// each. Returns the claims that were cleared.
    async fn clear_stale_claims(
        &self,
        reserved_before: DateTime<Utc>,
    ) -> Result<Vec<StaleClaim>, DbError>;

    async fn stats(&self, queue: &str) -> Result<QueueStats, DbError>;
}

/// `delay` as a chrono offset; zero if it does not fit.
pub(crate) fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chrono_delay_converts_seconds() {
        assert_eq!(
            chrono_delay(Duration::from_secs(300)),
            chrono::Duration::seconds(300)
        );
    }

    #[test]
    fn chrono_delay_is_zero_on_overflow() {
        assert_eq!(chrono_delay(Duration::MAX), chrono::Duration::zero());
    }
}
