// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Per-record migration state machine
//!
//! For one record id:
//!
//! 1. Load the record. Missing records are logged and skipped.
//! 2. Already migrated: no-op. This is the only guard against duplicate
//!    fan-out publishes.
//! 3. At the attempt cap: skip without uploading or touching attempts.
//! 4. Upload the body to its deterministic key.
//! 5. Upload every attachment. A missing attachment fails the whole record.
//! 6. Flip `migrated` and store all locations in one atomic update.
//! 7. On any failure in 4-6, count one attempt and keep the error text.
//!
//! Uploads are not transactional; a retry overwrites the same keys.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, warn};

use archiver_types::{AttachmentId, Record, RecordId};

use super::coordinator::Disposition;
use super::keys::KeyLayout;
use super::{MigrationError, truncate_error};
use crate::metrics;
use crate::object_store::ObjectStore;
use crate::store::RecordStore;

/// What happened to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Body and attachments uploaded and the record marked migrated
    Migrated { uploads: usize },
    /// Nothing to do; someone else already migrated it
    AlreadyMigrated,
    /// No such record
    Missing,
    /// Skipped: the record was already at the attempt cap
    Exhausted { attempts: i32 },
    /// Failed below the attempt cap; another try may succeed
    TransientFailure { error: String, attempts: i32 },
    /// Failed and reached the attempt cap
    PermanentFailure { error: String, attempts: i32 },
}

impl RecordOutcome {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            RecordOutcome::Migrated { .. } => "migrated",
            RecordOutcome::AlreadyMigrated => "already_migrated",
            RecordOutcome::Missing => "missing",
            RecordOutcome::Exhausted { .. } => "exhausted",
            RecordOutcome::TransientFailure { .. } => "transient_failure",
            RecordOutcome::PermanentFailure { .. } => "permanent_failure",
        }
    }

    /// Which run counter this outcome moves, if any.
    pub fn disposition(&self) -> Option<Disposition> {
        match self {
            RecordOutcome::Migrated { .. } => Some(Disposition::Processed),
            RecordOutcome::Exhausted { .. }
            | RecordOutcome::TransientFailure { .. }
            | RecordOutcome::PermanentFailure { .. } => Some(Disposition::Failed),
            RecordOutcome::AlreadyMigrated | RecordOutcome::Missing => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RecordOutcome::TransientFailure { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            RecordOutcome::TransientFailure { error, .. }
            | RecordOutcome::PermanentFailure { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Migrates single records into the object store.
pub struct RecordMigrator {
    records: Arc<dyn RecordStore>,
    store: Arc<dyn ObjectStore>,
    keys: KeyLayout,
    attachment_root: PathBuf,
    max_attempts: i32,
}

impl RecordMigrator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        store: Arc<dyn ObjectStore>,
        keys: KeyLayout,
        attachment_root: impl Into<PathBuf>,
        max_attempts: i32,
    ) -> Self {
        Self {
            records,
            store,
            keys,
            attachment_root: attachment_root.into(),
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    /// Migrate one record.
    ///
    /// Record-scoped failures are returned as an outcome after the attempt
    /// has been persisted. `Err` means the failure could not even be
    /// recorded.
    pub async fn migrate(&self, record_id: RecordId) -> Result<RecordOutcome, MigrationError> {
        let started = Instant::now();
        let outcome = self.run(record_id).await?;
        metrics::record_outcome(outcome.label(), started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    async fn run(&self, record_id: RecordId) -> Result<RecordOutcome, MigrationError> {
        let Some(record) = self.records.get_record(record_id).await? else {
            warn!(record_id, "Record not found, skipping");
            return Ok(RecordOutcome::Missing);
        };

        if record.migrated {
            debug!(record_id, "Record already migrated");
            return Ok(RecordOutcome::AlreadyMigrated);
        }

        if record.attempts >= self.max_attempts {
            warn!(
                record_id,
                attempts = record.attempts,
                "Record exceeded max attempts, skipping"
            );
            return Ok(RecordOutcome::Exhausted {
                attempts: record.attempts,
            });
        }

        let stored = match self.upload(&record).await {
            Ok((body_location, attachment_locations)) => self
                .records
                .mark_migrated(
                    record.id,
                    &body_location,
                    &attachment_locations,
                    Utc::now(),
                )
                .await
                .map(|changed| (changed, attachment_locations.len() + 1))
                .map_err(MigrationError::from),
            Err(e) => Err(e),
        };

        match stored {
            Ok((true, uploads)) => {
                info!(record_id, uploads, "Record migrated");
                Ok(RecordOutcome::Migrated { uploads })
            }
            Ok((false, _)) => {
                debug!(record_id, "Record migrated concurrently by another worker");
                Ok(RecordOutcome::AlreadyMigrated)
            }
            Err(e) => self.fail(&record, &e).await,
        }
    }

    async fn upload(
        &self,
        record: &Record,
    ) -> Result<(String, BTreeMap<AttachmentId, String>), MigrationError> {
        let body_key = self.keys.body_key(record);
        let body_location = self
            .store
            .put_content(
                Bytes::from(record.body.clone()),
                &body_key,
                &record.content_type,
            )
            .await?;
        metrics::record_upload("body", record.body.len() as u64);

        let mut attachment_locations = BTreeMap::new();
        for &attachment_id in &record.attachment_ids {
            let location = self.upload_attachment(record.id, attachment_id).await?;
            attachment_locations.insert(attachment_id, location);
        }

        Ok((body_location, attachment_locations))
    }

    async fn upload_attachment(
        &self,
        record_id: RecordId,
        attachment_id: AttachmentId,
    ) -> Result<String, MigrationError> {
        let attachment = self
            .records
            .get_attachment(attachment_id)
            .await?
            .ok_or_else(|| MigrationError::AttachmentNotFound {
                record_id,
                attachment_id,
                detail: "no attachment row".to_string(),
            })?;

        // Shared attachments may already be stored by another record.
        if let Some(location) = attachment.location.as_ref().filter(|_| attachment.migrated) {
            let stored = self.store.exists(location).await?;
            if stored {
                debug!(record_id, attachment_id, %location, "Attachment already stored");
                return Ok(location.clone());
            }
        }

        let local_path = self.attachment_root.join(&attachment.path);
        let size = match tokio::fs::metadata(&local_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => {
                return Err(MigrationError::AttachmentNotFound {
                    record_id,
                    attachment_id,
                    detail: format!("file not found: {}", local_path.display()),
                });
            }
        };

        let key = self.keys.attachment_key(&attachment);
        let location = self.store.put_file(&local_path, &key).await?;
        metrics::record_upload("attachment", size);

        self.records
            .mark_attachment_migrated(attachment_id, &location)
            .await?;
        Ok(location)
    }

    async fn fail(
        &self,
        record: &Record,
        err: &MigrationError,
    ) -> Result<RecordOutcome, MigrationError> {
        let error = truncate_error(&err.to_string());
        let attempts = self
            .records
            .record_failure(record.id, &error, Utc::now(), self.max_attempts)
            .await?;

        warn!(
            record_id = record.id,
            attempts,
            max_attempts = self.max_attempts,
            error = %error,
            "Record migration failed"
        );

        if attempts >= self.max_attempts {
            Ok(RecordOutcome::PermanentFailure { error, attempts })
        } else {
            Ok(RecordOutcome::TransientFailure { error, attempts })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::{MemoryObjectStore, MemoryStore};
    use archiver_types::Attachment;
    use pretty_assertions::assert_eq;

    struct Fixture {
        records: Arc<MemoryStore>,
        store: Arc<MemoryObjectStore>,
        migrator: RecordMigrator,
        root: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let records = Arc::new(MemoryStore::new());
        let store = Arc::new(MemoryObjectStore::new("test-bucket"));
        let root = tempfile::tempdir().unwrap();
        let migrator = RecordMigrator::new(
            records.clone(),
            store.clone(),
            KeyLayout::default(),
            root.path(),
            3,
        );
        Fixture {
            records,
            store,
            migrator,
            root,
        }
    }

    impl Fixture {
        fn attachment_file(&self, id: AttachmentId, name: &str, contents: &str) {
            let rel = format!("uploads/{}", name);
            let path = self.root.path().join(&rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, contents).unwrap();
            self.records.insert_attachment(Attachment::new(id, name, rel));
        }
    }

    #[tokio::test]
    async fn migrates_body_and_attachments() {
        let fx = fixture();
        fx.attachment_file(10, "a.pdf", "pdf bytes");
        fx.attachment_file(11, "b.png", "png bytes");
        fx.records
            .insert_record(Record::new(1500, "<p>hello</p>", "text/html").with_attachments([10, 11]));

        let outcome = fx.migrator.migrate(1500).await.unwrap();
        assert_eq!(outcome, RecordOutcome::Migrated { uploads: 3 });

        let record = fx.records.record(1500).unwrap();
        assert!(record.migrated);
        assert_eq!(record.body_location.as_deref(), Some("records/1/1500.html"));
        assert_eq!(
            record.attachment_locations.get(&10).map(String::as_str),
            Some("attachments/0/10/a.pdf")
        );
        assert_eq!(record.attachment_locations.len(), 2);
        assert!(fx.records.attachment(11).unwrap().migrated);

        let body = fx.store.object("records/1/1500.html").unwrap();
        assert_eq!(body.body, Bytes::from("<p>hello</p>"));
        assert_eq!(body.content_type.as_deref(), Some("text/html"));
        assert_eq!(
            fx.store.object("attachments/0/11/b.png").unwrap().body,
            Bytes::from("png bytes")
        );
    }

    #[tokio::test]
    async fn second_migration_is_a_no_op() {
        let fx = fixture();
        fx.records.insert_record(Record::new(1, "body", "text/plain"));

        fx.migrator.migrate(1).await.unwrap();
        let puts = fx.store.put_count();
        let before = fx.records.record(1).unwrap();

        let outcome = fx.migrator.migrate(1).await.unwrap();
        assert_eq!(outcome, RecordOutcome::AlreadyMigrated);
        assert_eq!(outcome.disposition(), None);
        assert_eq!(fx.store.put_count(), puts);
        assert_eq!(fx.records.record(1).unwrap(), before);
    }

    #[tokio::test]
    async fn exhausted_record_is_not_uploaded() {
        let fx = fixture();
        let mut record = Record::new(7, "body", "text/html");
        record.attempts = 3;
        fx.records.insert_record(record);

        let outcome = fx.migrator.migrate(7).await.unwrap();
        assert_eq!(outcome, RecordOutcome::Exhausted { attempts: 3 });
        assert_eq!(outcome.disposition(), Some(Disposition::Failed));
        assert_eq!(fx.store.put_count(), 0);
        assert_eq!(fx.records.record(7).unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn missing_record_is_skipped() {
        let fx = fixture();
        assert_eq!(fx.migrator.migrate(404).await.unwrap(), RecordOutcome::Missing);
        assert_eq!(fx.store.put_count(), 0);
    }

    #[tokio::test]
    async fn upload_failure_counts_an_attempt() {
        let fx = fixture();
        fx.records.insert_record(Record::new(2, "body", "text/html"));
        fx.store.fail_key("records/0/2.html");

        let outcome = fx.migrator.migrate(2).await.unwrap();
        assert!(outcome.is_transient());
        assert_eq!(outcome.disposition(), Some(Disposition::Failed));

        let record = fx.records.record(2).unwrap();
        assert!(!record.migrated);
        assert_eq!(record.attempts, 1);
        assert!(record.last_error.unwrap().contains("injected failure"));
        assert!(record.last_attempted_at.is_some());
    }

    #[tokio::test]
    async fn failure_at_the_cap_is_permanent() {
        let fx = fixture();
        let mut record = Record::new(3, "body", "text/html");
        record.attempts = 2;
        fx.records.insert_record(record);
        fx.store.fail_key("records/0/3.html");

        let outcome = fx.migrator.migrate(3).await.unwrap();
        assert!(matches!(
            outcome,
            RecordOutcome::PermanentFailure { attempts: 3, .. }
        ));
        assert_eq!(fx.records.record(3).unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn missing_attachment_file_fails_the_whole_record() {
        let fx = fixture();
        fx.records
            .insert_attachment(Attachment::new(20, "gone.pdf", "uploads/gone.pdf"));
        fx.records
            .insert_record(Record::new(4, "body", "text/html").with_attachments([20]));

        let outcome = fx.migrator.migrate(4).await.unwrap();
        let error = outcome.error().unwrap().to_string();
        assert!(error.contains("Attachment 20 of record 4 not found"), "{error}");

        let record = fx.records.record(4).unwrap();
        assert!(!record.migrated);
        assert!(record.body_location.is_none());
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn missing_attachment_row_fails_the_whole_record() {
        let fx = fixture();
        fx.records
            .insert_record(Record::new(5, "body", "text/html").with_attachments([99]));

        let outcome = fx.migrator.migrate(5).await.unwrap();
        assert!(outcome.error().unwrap().contains("no attachment row"));
        assert!(!fx.records.record(5).unwrap().migrated);
    }

    #[tokio::test]
    async fn stored_attachment_is_reused() {
        let fx = fixture();
        fx.attachment_file(30, "shared.txt", "shared");
        fx.records
            .insert_record(Record::new(6, "one", "text/plain").with_attachments([30]));
        fx.records
            .insert_record(Record::new(8, "two", "text/plain").with_attachments([30]));

        fx.migrator.migrate(6).await.unwrap();
        let puts = fx.store.put_count();
        fx.migrator.migrate(8).await.unwrap();

        // Only the second body is written.
        assert_eq!(fx.store.put_count(), puts + 1);
        assert_eq!(
            fx.records.record(8).unwrap().attachment_locations.get(&30),
            fx.records.record(6).unwrap().attachment_locations.get(&30)
        );
    }

    #[tokio::test]
    async fn failed_state_update_counts_an_attempt() {
        let fx = fixture();
        fx.records.insert_record(Record::new(9, "body", "text/html"));
        fx.records.set_fail_mark_migrated(true);

        let outcome = fx.migrator.migrate(9).await.unwrap();
        assert!(outcome.is_transient());
        let record = fx.records.record(9).unwrap();
        assert!(!record.migrated);
        assert_eq!(record.attempts, 1);

        // The retry overwrites the same key.
        fx.records.set_fail_mark_migrated(false);
        assert_eq!(
            fx.migrator.migrate(9).await.unwrap(),
            RecordOutcome::Migrated { uploads: 1 }
        );
        assert_eq!(fx.store.keys(), vec!["records/0/9.html".to_string()]);
    }
}
