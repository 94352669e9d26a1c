// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! PostgreSQL-backed task queue
//!
//! Reservation uses `FOR UPDATE SKIP LOCKED` so concurrent workers never
//! claim the same row.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;

use archiver_types::{MigrationTask, QueueStats, StaleClaim, TaskId};

use super::{ReservedTask, TaskQueue, chrono_delay};
use crate::db::{Database, DbError};

#[derive(Clone)]
pub struct PgTaskQueue {
    db: Database,
}

impl PgTaskQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn row_to_stale_claim(row: &Row) -> StaleClaim {
    let payload: serde_json::Value = row.get("payload");
    StaleClaim {
        task_id: row.get("id"),
        record_id: payload.get("record_id").and_then(|v| v.as_i64()),
        attempts: row.get("attempts"),
        reserved_at: row.get("reserved_at"),
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(
        &self,
        queue: &str,
        task: &MigrationTask,
        delay: Duration,
    ) -> Result<TaskId, DbError> {
        let client = self.db.pool().get().await?;
        let payload = serde_json::to_value(task)?;
        let available_at = Utc::now() + chrono_delay(delay);

        let row = client
            .query_one(
                "INSERT INTO migration_tasks (queue, payload, attempts, available_at)
                 VALUES ($1, $2, 0, $3)
                 RETURNING id",
                &[&queue, &payload, &available_at],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn reserve(&self, queue: &str) -> Result<Option<ReservedTask>, DbError> {
        let client = self.db.pool().get().await?;

        loop {
            let now = Utc::now();
            let Some(row) = client
                .query_opt(
                    "UPDATE migration_tasks
                     SET reserved_at = $2, attempts = attempts + 1
                     WHERE id = (
                         SELECT id FROM migration_tasks
                         WHERE queue = $1 AND reserved_at IS NULL AND available_at <= $2
                         ORDER BY available_at, id
                         LIMIT 1
                         FOR UPDATE SKIP LOCKED
                     )
                     RETURNING id, queue, payload, attempts, reserved_at",
                    &[&queue, &now],
                )
                .await?
            else {
                return Ok(None);
            };

            let id: TaskId = row.get("id");
            let payload: serde_json::Value = row.get("payload");
            match serde_json::from_value::<MigrationTask>(payload.clone()) {
                Ok(task) => {
                    return Ok(Some(ReservedTask {
                        id,
                        queue: row.get("queue"),
                        payload: task,
                        attempts: row.get("attempts"),
                        reserved_at: row.get("reserved_at"),
                    }));
                }
                Err(e) => {
                    // Undecodable payloads can never succeed; move them aside
                    // and look for the next task.
                    tracing::error!(task_id = id, error = %e, "Burying malformed task payload");
                    let attempts: i32 = row.get("attempts");
                    client
                        .execute(
                            "INSERT INTO failed_migration_tasks (queue, payload, attempts, error)
                             VALUES ($1, $2, $3, $4)",
                            &[&queue, &payload, &attempts, &format!("malformed payload: {}", e)],
                        )
                        .await?;
                    client
                        .execute("DELETE FROM migration_tasks WHERE id = $1", &[&id])
                        .await?;
                }
            }
        }
    }

    async fn delete(&self, id: TaskId) -> Result<(), DbError> {
        let client = self.db.pool().get().await?;
        client
            .execute("DELETE FROM migration_tasks WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }

    async fn release(&self, id: TaskId, delay: Duration) -> Result<(), DbError> {
        let client = self.db.pool().get().await?;
        let available_at = Utc::now() + chrono_delay(delay);
        let n = client
            .execute(
                "UPDATE migration_tasks SET reserved_at = NULL, available_at = $2 WHERE id = $1",
                &[&id, &available_at],
            )
            .await?;
        if n == 0 {
            return Err(DbError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    async fn bury(&self, task: &ReservedTask, error: &str) -> Result<(), DbError> {
        let mut client = self.db.pool().get().await?;
        let payload = serde_json::to_value(task.payload)?;

        let tx = client.transaction().await?;
        tx.execute(
            "INSERT INTO failed_migration_tasks (queue, payload, attempts, error)
             VALUES ($1, $2, $3, $4)",
            &[&task.queue, &payload, &task.attempts, &error],
        )
        .await?;
        tx.execute("DELETE FROM migration_tasks WHERE id = $1", &[&task.id])
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn stale_claims(
        &self,
        reserved_before: DateTime<Utc>,
    ) -> Result<Vec<StaleClaim>, DbError> {
        let client = self.db.pool().get().await?;
        let rows = client
            .query(
                "SELECT id, payload, attempts, reserved_at FROM migration_tasks
                 WHERE reserved_at IS NOT NULL AND reserved_at <= $1
                 ORDER BY reserved_at",
                &[&reserved_before],
            )
            .await?;
        Ok(rows.iter().map(row_to_stale_claim).collect())
    }

    async fn clear_stale_claims(
        &self,
        reserved_before: DateTime<Utc>,
    ) -> Result<Vec<StaleClaim>, DbError> {
        let client = self.db.pool().get().await?;
        // RETURNING reports the pre-clear claim time via the CTE.
        let rows = client
            .query(
                "WITH stale AS (
                     SELECT id, reserved_at FROM migration_tasks
                     WHERE reserved_at IS NOT NULL AND reserved_at <= $1
                     FOR UPDATE SKIP LOCKED
                 )
                 UPDATE migration_tasks t
                 SET reserved_at = NULL, attempts = t.attempts + 1
                 FROM stale
                 WHERE t.id = stale.id
                 RETURNING t.id, t.payload, t.attempts, stale.reserved_at",
                &[&reserved_before],
            )
            .await?;
        Ok(rows.iter().map(row_to_stale_claim).collect())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, DbError> {
        let client = self.db.pool().get().await?;
        let row = client
            .query_one(
                "SELECT
                     COUNT(*) FILTER (WHERE reserved_at IS NULL AND available_at <= now()),
                     COUNT(*) FILTER (WHERE reserved_at IS NULL AND available_at > now()),
                     COUNT(*) FILTER (WHERE reserved_at IS NOT NULL)
                 FROM migration_tasks WHERE queue = $1",
                &[&queue],
            )
            .await?;
        let failed = client
            .query_one(
                "SELECT COUNT(*) FROM failed_migration_tasks WHERE queue = $1",
                &[&queue],
            )
            .await?;

        Ok(QueueStats {
            pending: row.get(0),
            delayed: row.get(1),
            reserved: row.get(2),
            failed: failed.get(0),
        })
    }
}
