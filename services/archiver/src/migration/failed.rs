// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Operator tooling: permanently failed records and the dry-run plan

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use archiver_types::{AttachmentId, Record, RecordId};

use super::MigrationError;
use super::keys::KeyLayout;
use crate::store::RecordStore;

/// Records that reached the attempt cap without migrating.
pub struct FailedRecords {
    records: Arc<dyn RecordStore>,
    max_attempts: i32,
}

impl FailedRecords {
    pub fn new(records: Arc<dyn RecordStore>, max_attempts: i32) -> Self {
        Self {
            records,
            max_attempts,
        }
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<Record>, MigrationError> {
        Ok(self.records.failed_records(self.max_attempts, limit).await?)
    }

    pub async fn count(&self) -> Result<i64, MigrationError> {
        Ok(self.records.count_failed(self.max_attempts).await?)
    }

    /// Make the given failed records eligible again by zeroing their
    /// attempts and clearing the error. Ids that are no longer failed are
    /// left alone. Returns the ids that were reset.
    pub async fn reset(&self, ids: &[RecordId]) -> Result<Vec<RecordId>, MigrationError> {
        let reset = self.records.reset_attempts(ids, self.max_attempts).await?;
        info!(requested = ids.len(), reset = reset.len(), "Reset attempt counters");
        Ok(reset)
    }
}

/// One upload a migration would perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedUpload {
    pub attachment_id: AttachmentId,
    /// `None` when the attachment row is missing
    pub key: Option<String>,
    pub local_path: Option<PathBuf>,
    /// Whether the local file is present; a missing file fails the record
    pub file_present: bool,
}

/// What migrating one record would upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordPlan {
    pub record_id: RecordId,
    pub body_key: String,
    pub body_bytes: usize,
    pub attachments: Vec<PlannedUpload>,
}

impl RecordPlan {
    /// Whether every attachment can be resolved.
    pub fn is_complete(&self) -> bool {
        self.attachments.iter().all(|a| a.file_present)
    }
}

/// Compute the uploads for the first `limit` eligible records without
/// touching any state.
pub async fn plan(
    records: &dyn RecordStore,
    keys: &KeyLayout,
    attachment_root: &std::path::Path,
    max_attempts: i32,
    limit: i64,
) -> Result<Vec<RecordPlan>, MigrationError> {
    let ids = records.eligible_after(0, limit, max_attempts).await?;
    let mut plans = Vec::with_capacity(ids.len());

    for id in ids {
        let Some(record) = records.get_record(id).await? else {
            continue;
        };

        let mut attachments = Vec::with_capacity(record.attachment_ids.len());
        for &attachment_id in &record.attachment_ids {
            let planned = match records.get_attachment(attachment_id).await? {
                Some(attachment) => {
                    let local_path = attachment_root.join(&attachment.path);
                    let file_present = tokio::fs::metadata(&local_path)
                        .await
                        .map(|m| m.is_file())
                        .unwrap_or(false);
                    PlannedUpload {
                        attachment_id,
                        key: Some(keys.attachment_key(&attachment)),
                        local_path: Some(local_path),
                        file_present,
                    }
                }
                None => PlannedUpload {
                    attachment_id,
                    key: None,
                    local_path: None,
                    file_present: false,
                },
            };
            attachments.push(planned);
        }

        plans.push(RecordPlan {
            record_id: record.id,
            body_key: keys.body_key(&record),
            body_bytes: record.body.len(),
            attachments,
        });
    }

    Ok(plans)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use archiver_types::Attachment;
    use pretty_assertions::assert_eq;

    fn failed(id: RecordId, attempts: i32) -> Record {
        let mut record = Record::new(id, "b", "text/html");
        record.attempts = attempts;
        record.last_error = Some("boom".to_string());
        record
    }

    #[tokio::test]
    async fn lists_only_records_at_the_cap() {
        let store = Arc::new(MemoryStore::new());
        store.insert_record(failed(1, 3));
        store.insert_record(failed(2, 1));
        let mut migrated = failed(3, 3);
        migrated.migrated = true;
        store.insert_record(migrated);

        let failed_records = FailedRecords::new(store.clone(), 3);
        let listed: Vec<RecordId> = failed_records.list(10).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(listed, vec![1]);
        assert_eq!(failed_records.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reset_makes_records_eligible_again() {
        let store = Arc::new(MemoryStore::new());
        for id in 1..=3 {
            store.insert_record(failed(id, 3));
        }

        let failed_records = FailedRecords::new(store.clone(), 3);
        assert_eq!(failed_records.reset(&[1, 2]).await.unwrap(), vec![1, 2]);

        let record = store.record(1).unwrap();
        assert_eq!(record.attempts, 0);
        assert!(record.last_error.is_none());
        assert!(record.is_eligible(3));
        assert_eq!(store.record(3).unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn reset_skips_ids_no_longer_failed() {
        let store = Arc::new(MemoryStore::new());
        store.insert_record(failed(1, 3));
        store.insert_record(failed(2, 3));
        let failed_records = FailedRecords::new(store.clone(), 3);
        let confirmed: Vec<RecordId> =
            failed_records.list(10).await.unwrap().iter().map(|r| r.id).collect();

        // Between listing and confirming, record 2 migrated and record 4
        // reached the cap.
        let mut migrated = failed(2, 3);
        migrated.migrated = true;
        store.insert_record(migrated);
        store.insert_record(failed(4, 3));

        assert_eq!(failed_records.reset(&confirmed).await.unwrap(), vec![1]);
        assert_eq!(store.record(2).unwrap().attempts, 3);
        assert_eq!(store.record(4).unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn plan_reports_keys_without_mutating() {
        let store = MemoryStore::new();
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.txt"), "x").unwrap();
        store.insert_attachment(Attachment::new(5, "a.txt", "a.txt"));
        store.insert_attachment(Attachment::new(6, "b.txt", "b.txt"));
        store.insert_record(Record::new(1, "hello", "text/plain").with_attachments([5, 6, 7]));
        store.insert_record(failed(2, 3));

        let plans = plan(&store, &KeyLayout::default(), root.path(), 3, 10)
            .await
            .unwrap();

        assert_eq!(plans.len(), 1);
        let plan = &plans[0];
        assert_eq!(plan.body_key, "records/0/1.txt");
        assert_eq!(plan.body_bytes, 5);
        assert_eq!(plan.attachments[0].key.as_deref(), Some("attachments/0/5/a.txt"));
        assert!(plan.attachments[0].file_present);
        assert!(!plan.attachments[1].file_present);
        assert_eq!(plan.attachments[2].key, None);
        assert!(!plan.is_complete());

        assert!(!store.record(1).unwrap().migrated);
        assert!(!store.attachment(5).unwrap().migrated);
    }
}
