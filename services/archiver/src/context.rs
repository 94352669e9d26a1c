// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Explicit wiring of the engine's capabilities

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::config::ArchiverConfig;
use crate::db::Database;
use crate::migration::{
    BatchDispatcher, Coordinator, FailedRecords, FanOutDispatcher, QueueWorker, RecordMigrator,
    RunTracker, StaleClaimReaper, WorkerSettings,
};
use crate::object_store::{ObjectStore, S3ObjectStore};
use crate::queue::{PgTaskQueue, TaskQueue};
use crate::store::{PgStore, RecordStore, RunStore};

/// Every capability the engine needs, resolved once at process start.
#[derive(Clone)]
pub struct ArchiverContext {
    pub config: ArchiverConfig,
    pub runs: Arc<dyn RunStore>,
    pub records: Arc<dyn RecordStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub objects: Arc<dyn ObjectStore>,
}

impl ArchiverContext {
    /// Connect to PostgreSQL and S3 as configured.
    pub async fn connect(config: ArchiverConfig) -> Result<Self> {
        let db = Database::new(&config.database_url)
            .await
            .with_context(|| format!("Failed to connect to {}", config.database_url_display()))?;
        let store = Arc::new(PgStore::new(db.clone()));
        let queue = Arc::new(PgTaskQueue::new(db));
        let objects = Arc::new(S3ObjectStore::connect(&config.s3).await);

        Ok(Self::from_parts(config, store.clone(), store, queue, objects))
    }

    pub fn from_parts(
        config: ArchiverConfig,
        runs: Arc<dyn RunStore>,
        records: Arc<dyn RecordStore>,
        queue: Arc<dyn TaskQueue>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            runs,
            records,
            queue,
            objects,
        }
    }

    pub fn tracker(&self) -> RunTracker {
        RunTracker::new(self.runs.clone())
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(self.tracker())
    }

    pub fn migrator(&self) -> Arc<RecordMigrator> {
        Arc::new(RecordMigrator::new(
            self.records.clone(),
            self.objects.clone(),
            self.config.key_layout(),
            self.config.attachment_root.clone(),
            self.config.max_attempts,
        ))
    }

    pub fn batch_dispatcher(&self) -> BatchDispatcher {
        BatchDispatcher::new(self.runs.clone(), self.migrator(), self.config.batch_size)
    }

    pub fn fan_out_dispatcher(&self) -> FanOutDispatcher {
        FanOutDispatcher::new(
            self.tracker(),
            self.records.clone(),
            self.queue.clone(),
            self.config.queue_name.clone(),
            self.config.max_attempts,
        )
        .with_page_size(self.config.batch_size)
        .with_stagger(self.config.dispatch_stagger())
    }

    pub fn worker(&self, settings: watch::Receiver<WorkerSettings>) -> QueueWorker {
        QueueWorker::new(
            self.queue.clone(),
            self.config.queue_name.clone(),
            self.migrator(),
            self.coordinator(),
            settings,
        )
    }

    /// Reaper using the configured claim timeout.
    pub fn reaper(&self) -> StaleClaimReaper {
        self.reaper_with_timeout(self.config.stale_claim_timeout())
    }

    pub fn reaper_with_timeout(&self, timeout: std::time::Duration) -> StaleClaimReaper {
        StaleClaimReaper::new(
            self.queue.clone(),
            self.records.clone(),
            timeout,
            self.config.max_attempts,
        )
    }

    pub fn failed_records(&self) -> FailedRecords {
        FailedRecords::new(self.records.clone(), self.config.max_attempts)
    }
}
