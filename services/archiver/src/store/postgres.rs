// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! PostgreSQL implementation of the run and record stores

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;

use archiver_types::{
    Attachment, AttachmentId, ErrorLogEntry, MigrationRun, Record, RecordId, RunId, RunStatus,
};

use super::{BatchClaim, ClaimGuard, RecordStore, RunStore};
use crate::db::{Database, DbError};

const RUN_COLUMNS: &str = "id, total_count, processed_count, failed_count, dispatched_count, \
     last_processed_id, last_dispatched_id, status, started_at, completed_at, error_log";

const RECORD_COLUMNS: &str = "id, body, content_type, attachment_ids, migrated, attempts, \
     last_error, last_attempted_at, body_location, attachment_locations";

/// Run and record persistence over one connection pool
#[derive(Clone)]
pub struct PgStore {
    db: Database,
}

impl PgStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

/// Session advisory lock key held while an operator command drives runs
/// ("ARCHIVER" in ASCII).
const MIGRATION_LOCK_KEY: i64 = 0x4152_4348_4956_4552;

/// Advisory lock key for a run's batch-loop selection.
fn claim_lock_key(id: RunId) -> i64 {
    let mut key = [0u8; 8];
    key.copy_from_slice(&id.as_bytes()[..8]);
    i64::from_be_bytes(key)
}

fn row_to_run(row: &Row) -> Result<MigrationRun, DbError> {
    let status: String = row.get("status");
    let status = RunStatus::from_str(&status)
        .map_err(|_| DbError::InvalidRow(format!("unknown run status '{}'", status)))?;
    let error_log: serde_json::Value = row.get("error_log");

    Ok(MigrationRun {
        id: row.get("id"),
        total_count: row.get("total_count"),
        processed_count: row.get("processed_count"),
        failed_count: row.get("failed_count"),
        dispatched_count: row.get("dispatched_count"),
        last_processed_id: row.get("last_processed_id"),
        last_dispatched_id: row.get("last_dispatched_id"),
        status,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error_log: serde_json::from_value(error_log)?,
    })
}

fn row_to_record(row: &Row) -> Result<Record, DbError> {
    let attachment_ids: Option<serde_json::Value> = row.get("attachment_ids");
    let attachment_locations: Option<serde_json::Value> = row.get("attachment_locations");

    Ok(Record {
        id: row.get("id"),
        body: row.get("body"),
        content_type: row.get("content_type"),
        attachment_ids: match attachment_ids {
            Some(v) if !v.is_null() => serde_json::from_value(v)?,
            _ => Vec::new(),
        },
        migrated: row.get("migrated"),
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        last_attempted_at: row.get("last_attempted_at"),
        body_location: row.get("body_location"),
        attachment_locations: match attachment_locations {
            Some(v) if !v.is_null() => serde_json::from_value(v)?,
            _ => BTreeMap::new(),
        },
    })
}

fn error_entry_json(entry: &ErrorLogEntry) -> Result<serde_json::Value, DbError> {
    Ok(serde_json::Value::Array(vec![serde_json::to_value(entry)?]))
}

/// Open transaction holding the run's advisory lock.
struct PgClaimGuard {
    client: Option<deadpool_postgres::Object>,
}

#[async_trait]
impl ClaimGuard for PgClaimGuard {
    async fn release(&mut self) -> Result<(), DbError> {
        if let Some(client) = self.client.take() {
            client.batch_execute("COMMIT").await?;
        }
        Ok(())
    }
}

impl Drop for PgClaimGuard {
    fn drop(&mut self) {
        // The transaction cannot be finished from a synchronous drop, so the
        // connection is detached from the pool and closed; the server then
        // rolls back and frees the advisory lock.
        if let Some(client) = self.client.take() {
            tracing::warn!("Batch claim dropped without release, closing its connection");
            drop(deadpool_postgres::Object::take(client));
        }
    }
}

/// Session holding the migration lock.
struct PgSessionLock {
    client: Option<deadpool_postgres::Object>,
}

#[async_trait]
impl ClaimGuard for PgSessionLock {
    async fn release(&mut self) -> Result<(), DbError> {
        if let Some(client) = self.client.take() {
            client
                .execute("SELECT pg_advisory_unlock($1)", &[&MIGRATION_LOCK_KEY])
                .await?;
        }
        Ok(())
    }
}

impl Drop for PgSessionLock {
    fn drop(&mut self) {
        // Closing the session frees the lock; returning the connection to
        // the pool would keep it held.
        if let Some(client) = self.client.take() {
            drop(deadpool_postgres::Object::take(client));
        }
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn insert_run(&self, run: &MigrationRun) -> Result<(), DbError> {
        let client = self.db.pool().get().await?;
        let error_log = serde_json::to_value(&run.error_log)?;

        client
            .execute(
                "INSERT INTO migration_runs (id, total_count, processed_count, failed_count,
                     dispatched_count, last_processed_id, last_dispatched_id, status,
                     started_at, completed_at, error_log)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                &[
                    &run.id,
                    &run.total_count,
                    &run.processed_count,
                    &run.failed_count,
                    &run.dispatched_count,
                    &run.last_processed_id,
                    &run.last_dispatched_id,
                    &run.status.to_string(),
                    &run.started_at,
                    &run.completed_at,
                    &error_log,
                ],
            )
            .await?;

        Ok(())
    }

    async fn get_run(&self, id: RunId) -> Result<Option<MigrationRun>, DbError> {
        let client = self.db.pool().get().await?;
        let query = format!("SELECT {} FROM migration_runs WHERE id = $1", RUN_COLUMNS);

        client
            .query_opt(&query, &[&id])
            .await?
            .map(|row| row_to_run(&row))
            .transpose()
    }

    async fn list_runs(&self, limit: i64) -> Result<Vec<MigrationRun>, DbError> {
        let client = self.db.pool().get().await?;
        let query = format!(
            "SELECT {} FROM migration_runs ORDER BY started_at DESC LIMIT $1",
            RUN_COLUMNS
        );

        let rows = client.query(&query, &[&limit]).await?;
        rows.iter().map(row_to_run).collect()
    }

    async fn mark_processing(&self, id: RunId) -> Result<bool, DbError> {
        let client = self.db.pool().get().await?;
        let n = client
            .execute(
                "UPDATE migration_runs SET status = 'processing'
                 WHERE id = $1 AND status IN ('pending', 'failed')",
                &[&id],
            )
            .await?;
        Ok(n == 1)
    }

    async fn mark_failed(&self, id: RunId, entry: &ErrorLogEntry) -> Result<bool, DbError> {
        let client = self.db.pool().get().await?;
        let entry = error_entry_json(entry)?;
        let n = client
            .execute(
                "UPDATE migration_runs
                 SET status = 'failed', error_log = error_log || $2::jsonb
                 WHERE id = $1 AND status IN ('pending', 'processing')",
                &[&id, &entry],
            )
            .await?;
        Ok(n == 1)
    }

    async fn append_error(&self, id: RunId, entry: &ErrorLogEntry) -> Result<(), DbError> {
        let client = self.db.pool().get().await?;
        let entry = error_entry_json(entry)?;
        let n = client
            .execute(
                "UPDATE migration_runs SET error_log = error_log || $2::jsonb WHERE id = $1",
                &[&id, &entry],
            )
            .await?;
        if n == 0 {
            return Err(DbError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn add_outcomes(&self, id: RunId, processed: i64, failed: i64) -> Result<(), DbError> {
        let client = self.db.pool().get().await?;
        let n = client
            .execute(
                "UPDATE migration_runs
                 SET processed_count = processed_count + $2,
                     failed_count = failed_count + $3
                 WHERE id = $1",
                &[&id, &processed, &failed],
            )
            .await?;
        if n == 0 {
            return Err(DbError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn advance_processed_cursor(&self, id: RunId, cursor: RecordId) -> Result<(), DbError> {
        let client = self.db.pool().get().await?;
        let n = client
            .execute(
                "UPDATE migration_runs
                 SET last_processed_id = GREATEST(last_processed_id, $2)
                 WHERE id = $1",
                &[&id, &cursor],
            )
            .await?;
        if n == 0 {
            return Err(DbError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn advance_dispatch_cursor(
        &self,
        id: RunId,
        expected: RecordId,
        cursor: RecordId,
        dispatched: i64,
    ) -> Result<bool, DbError> {
        let client = self.db.pool().get().await?;
        let n = client
            .execute(
                "UPDATE migration_runs
                 SET last_dispatched_id = $3,
                     dispatched_count = dispatched_count + $4
                 WHERE id = $1 AND last_dispatched_id = $2 AND $3 > $2",
                &[&id, &expected, &cursor, &dispatched],
            )
            .await?;
        Ok(n == 1)
    }

    async fn complete_if_settled(&self, id: RunId, at: DateTime<Utc>) -> Result<bool, DbError> {
        let client = self.db.pool().get().await?;
        let n = client
            .execute(
                "UPDATE migration_runs SET status = 'completed', completed_at = $2
                 WHERE id = $1
                   AND status <> 'completed'
                   AND processed_count + failed_count >= total_count",
                &[&id, &at],
            )
            .await?;
        Ok(n == 1)
    }

    async fn complete(&self, id: RunId, at: DateTime<Utc>) -> Result<bool, DbError> {
        let client = self.db.pool().get().await?;
        let n = client
            .execute(
                "UPDATE migration_runs SET status = 'completed', completed_at = $2
                 WHERE id = $1 AND status <> 'completed'",
                &[&id, &at],
            )
            .await?;
        Ok(n == 1)
    }

    async fn claim_batch(
        &self,
        id: RunId,
        limit: i64,
        max_attempts: i32,
    ) -> Result<BatchClaim, DbError> {
        let client = self.db.pool().get().await?;
        client.batch_execute("BEGIN").await?;

        let selected: Result<(RecordId, Vec<RecordId>), DbError> = async {
            client
                .execute("SELECT pg_advisory_xact_lock($1)", &[&claim_lock_key(id)])
                .await?;

            let cursor: RecordId = client
                .query_opt(
                    "SELECT last_processed_id FROM migration_runs WHERE id = $1",
                    &[&id],
                )
                .await?
                .ok_or_else(|| DbError::NotFound(id.to_string()))?
                .get(0);

            let rows = client
                .query(
                    "SELECT id FROM records
                     WHERE id > $1 AND migrated = false AND attempts < $2
                     ORDER BY id
                     LIMIT $3",
                    &[&cursor, &max_attempts, &limit],
                )
                .await?;

            Ok((cursor, rows.iter().map(|r| r.get(0)).collect()))
        }
        .await;

        match selected {
            Ok((cursor, ids)) => Ok(BatchClaim::new(
                cursor,
                ids,
                Box::new(PgClaimGuard {
                    client: Some(client),
                }),
            )),
            Err(e) => {
                if let Err(rollback) = client.batch_execute("ROLLBACK").await {
                    tracing::warn!(error = %rollback, "Failed to roll back batch claim");
                }
                Err(e)
            }
        }
    }

    async fn try_lock_migration(&self) -> Result<Option<Box<dyn ClaimGuard>>, DbError> {
        let client = self.db.pool().get().await?;
        let acquired: bool = client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&MIGRATION_LOCK_KEY])
            .await?
            .get(0);
        if !acquired {
            return Ok(None);
        }
        Ok(Some(Box::new(PgSessionLock {
            client: Some(client),
        })))
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn count_eligible(&self, max_attempts: i32) -> Result<i64, DbError> {
        let client = self.db.pool().get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM records WHERE migrated = false AND attempts < $1",
                &[&max_attempts],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn eligible_after(
        &self,
        after: RecordId,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<RecordId>, DbError> {
        let client = self.db.pool().get().await?;
        let rows = client
            .query(
                "SELECT id FROM records
                 WHERE id > $1 AND migrated = false AND attempts < $2
                 ORDER BY id
                 LIMIT $3",
                &[&after, &max_attempts, &limit],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn get_record(&self, id: RecordId) -> Result<Option<Record>, DbError> {
        let client = self.db.pool().get().await?;
        let query = format!("SELECT {} FROM records WHERE id = $1", RECORD_COLUMNS);

        client
            .query_opt(&query, &[&id])
            .await?
            .map(|row| row_to_record(&row))
            .transpose()
    }

    async fn get_attachment(&self, id: AttachmentId) -> Result<Option<Attachment>, DbError> {
        let client = self.db.pool().get().await?;
        let row = client
            .query_opt(
                "SELECT id, name, path, migrated, location FROM attachments WHERE id = $1",
                &[&id],
            )
            .await?;

        Ok(row.map(|row| Attachment {
            id: row.get("id"),
            name: row.get("name"),
            path: row.get("path"),
            migrated: row.get("migrated"),
            location: row.get("location"),
        }))
    }

    async fn mark_attachment_migrated(
        &self,
        id: AttachmentId,
        location: &str,
    ) -> Result<(), DbError> {
        let client = self.db.pool().get().await?;
        let n = client
            .execute(
                "UPDATE attachments SET location = $2, migrated = true WHERE id = $1",
                &[&id, &location],
            )
            .await?;
        if n == 0 {
            return Err(DbError::NotFound(format!("attachment {}", id)));
        }
        Ok(())
    }

    async fn mark_migrated(
        &self,
        id: RecordId,
        body_location: &str,
        attachment_locations: &BTreeMap<AttachmentId, String>,
        at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let client = self.db.pool().get().await?;
        let locations = serde_json::to_value(attachment_locations)?;
        let n = client
            .execute(
                "UPDATE records
                 SET body_location = $2,
                     attachment_locations = $3,
                     migrated = true,
                     last_attempted_at = $4
                 WHERE id = $1 AND migrated = false",
                &[&id, &body_location, &locations, &at],
            )
            .await?;
        Ok(n == 1)
    }

    async fn record_failure(
        &self,
        id: RecordId,
        error: &str,
        at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<i32, DbError> {
        let client = self.db.pool().get().await?;
        let row = client
            .query_opt(
                "UPDATE records
                 SET attempts = LEAST(attempts + 1, $4),
                     last_error = $2,
                     last_attempted_at = $3
                 WHERE id = $1 AND migrated = false
                 RETURNING attempts",
                &[&id, &error, &at, &max_attempts],
            )
            .await?;
        if let Some(row) = row {
            return Ok(row.get(0));
        }

        // Migrated in the meantime: report the attempts as they stand.
        let row = client
            .query_opt("SELECT attempts FROM records WHERE id = $1", &[&id])
            .await?
            .ok_or_else(|| DbError::NotFound(format!("record {}", id)))?;
        Ok(row.get(0))
    }

    async fn force_exhausted(
        &self,
        id: RecordId,
        max_attempts: i32,
        error: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let client = self.db.pool().get().await?;
        client
            .execute(
                "UPDATE records
                 SET attempts = GREATEST(attempts, $2),
                     last_error = $3,
                     last_attempted_at = $4
                 WHERE id = $1 AND migrated = false",
                &[&id, &max_attempts, &error, &at],
            )
            .await?;
        Ok(())
    }

    async fn failed_records(&self, max_attempts: i32, limit: i64) -> Result<Vec<Record>, DbError> {
        let client = self.db.pool().get().await?;
        let query = format!(
            "SELECT {} FROM records
             WHERE migrated = false AND attempts >= $1
             ORDER BY id
             LIMIT $2",
            RECORD_COLUMNS
        );

        let rows = client.query(&query, &[&max_attempts, &limit]).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn count_failed(&self, max_attempts: i32) -> Result<i64, DbError> {
        let client = self.db.pool().get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM records WHERE migrated = false AND attempts >= $1",
                &[&max_attempts],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn reset_attempts(
        &self,
        ids: &[RecordId],
        max_attempts: i32,
    ) -> Result<Vec<RecordId>, DbError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.db.pool().get().await?;
        let rows = client
            .query(
                "UPDATE records SET attempts = 0, last_error = NULL
                 WHERE id = ANY($1) AND migrated = false AND attempts >= $2
                 RETURNING id",
                &[&ids, &max_attempts],
            )
            .await?;
        let mut reset: Vec<RecordId> = rows.iter().map(|row| row.get(0)).collect();
        reset.sort_unstable();
        Ok(reset)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn migration_lock_key_spells_archiver() {
        assert_eq!(&MIGRATION_LOCK_KEY.to_be_bytes(), b"ARCHIVER");
    }

    #[test]
    fn claim_lock_key_is_stable_per_run() {
        let id = Uuid::new_v4();
        assert_eq!(claim_lock_key(id), claim_lock_key(id));
        assert_eq!(claim_lock_key(Uuid::nil()), 0);
    }

    #[test]
    fn claim_lock_key_uses_leading_bytes() {
        let id = Uuid::from_bytes([0, 0, 0, 0, 0, 0, 0, 7, 9, 9, 9, 9, 9, 9, 9, 9]);
        assert_eq!(claim_lock_key(id), 7);
    }

    #[test]
    fn error_entries_are_appended_as_single_element_arrays() {
        let entry = ErrorLogEntry {
            at: Utc::now(),
            record_id: Some(3),
            message: "upload failed".to_string(),
        };
        let json = error_entry_json(&entry).expect("serializable");
        let items = json.as_array().expect("array");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["record_id"], 3);
        assert_eq!(items[0]["message"], "upload failed");
    }
}
