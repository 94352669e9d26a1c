// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Prometheus metrics for the archiver
//!
//! Exports metrics for monitoring migration progress including:
//! - Records handled by outcome
//! - Uploads by kind and bytes written to the object store
//! - Queue task dispositions (deleted, released, buried)
//! - Stale claims cleared by the reaper
//! - DB operation failures (when best-effort counter updates fail)
//!
//! There is no HTTP endpoint; the worker periodically writes the text
//! exposition to a file for a node exporter textfile collector.

use std::path::Path;

use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

// Static metric initialization uses expect because these are constant
// definitions that cannot fail in practice. A failure here is a programming
// error (e.g. an invalid metric name) and should panic at startup.
#[allow(clippy::expect_used)]
mod metrics_impl {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        /// Registry for all archiver metrics
        pub static ref REGISTRY: Registry = Registry::new();

        /// Records handled, by outcome
        pub static ref RECORDS_TOTAL: CounterVec = CounterVec::new(
            Opts::new("archiver_records_total", "Records handled by outcome"),
            &["outcome"]
        ).expect("valid metric name and labels");

        /// Objects written to the object store, by kind (body, attachment)
        pub static ref UPLOADS_TOTAL: CounterVec = CounterVec::new(
            Opts::new("archiver_uploads_total", "Objects uploaded by kind"),
            &["kind"]
        ).expect("valid metric name and labels");

        /// Bytes written to the object store
        pub static ref BYTES_UPLOADED: Counter = Counter::with_opts(
            Opts::new("archiver_bytes_uploaded_total", "Total bytes uploaded")
        ).expect("valid metric name");

        /// Per-record migration time
        pub static ref RECORD_DURATION: Histogram = Histogram::with_opts(
            HistogramOpts::new(
                "archiver_record_duration_seconds",
                "Time to migrate one record in seconds"
            )
            // Buckets: 10ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s, 30s
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
        ).expect("valid histogram opts");

        /// Queue task dispositions
        pub static ref TASKS_TOTAL: CounterVec = CounterVec::new(
            Opts::new("archiver_tasks_total", "Queue tasks by disposition"),
            &["action"]
        ).expect("valid metric name and labels");

        /// Claims cleared by the stale-claim reaper
        pub static ref STALE_CLAIMS_CLEARED: Counter = Counter::with_opts(
            Opts::new(
                "archiver_stale_claims_cleared_total",
                "Total stale queue claims cleared"
            )
        ).expect("valid metric name");

        /// Runs moved to completed by this process
        pub static ref RUNS_COMPLETED: Counter = Counter::with_opts(
            Opts::new("archiver_runs_completed_total", "Runs completed by this process")
        ).expect("valid metric name");

        /// Counter for DB operation failures (e.g., run counter increments)
        ///
        /// The record itself was handled, but run progress tracking is
        /// degraded until a later completion check catches up.
        pub static ref DB_OPERATION_FAILURES: Counter = Counter::with_opts(
            Opts::new(
                "archiver_db_operation_failures_total",
                "Total DB operation failures (e.g., failed to increment run counters)"
            )
        ).expect("valid metric name");
    }
}

pub use metrics_impl::{
    BYTES_UPLOADED, DB_OPERATION_FAILURES, RECORD_DURATION, RECORDS_TOTAL, REGISTRY,
    RUNS_COMPLETED, STALE_CLAIMS_CLEARED, TASKS_TOTAL, UPLOADS_TOTAL,
};

/// Register all metrics with the registry
///
/// Should be called once during application startup.
/// Panics if registration fails (indicates a programming error).
#[allow(clippy::expect_used)]
pub fn register_metrics() {
    REGISTRY
        .register(Box::new(RECORDS_TOTAL.clone()))
        .expect("Failed to register RECORDS_TOTAL");
    REGISTRY
        .register(Box::new(UPLOADS_TOTAL.clone()))
        .expect("Failed to register UPLOADS_TOTAL");
    REGISTRY
        .register(Box::new(BYTES_UPLOADED.clone()))
        .expect("Failed to register BYTES_UPLOADED");
    REGISTRY
        .register(Box::new(RECORD_DURATION.clone()))
        .expect("Failed to register RECORD_DURATION");
    REGISTRY
        .register(Box::new(TASKS_TOTAL.clone()))
        .expect("Failed to register TASKS_TOTAL");
    REGISTRY
        .register(Box::new(STALE_CLAIMS_CLEARED.clone()))
        .expect("Failed to register STALE_CLAIMS_CLEARED");
    REGISTRY
        .register(Box::new(RUNS_COMPLETED.clone()))
        .expect("Failed to register RUNS_COMPLETED");
    REGISTRY
        .register(Box::new(DB_OPERATION_FAILURES.clone()))
        .expect("Failed to register DB_OPERATION_FAILURES");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

/// Write the text exposition to `path`, replacing it atomically.
pub async fn write_textfile(path: &Path) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, gather_metrics()).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Record the outcome of one record migration
pub fn record_outcome(outcome: &str, duration_secs: f64) {
    RECORDS_TOTAL.with_label_values(&[outcome]).inc();
    RECORD_DURATION.observe(duration_secs);
}

/// Record one object written to the store
pub fn record_upload(kind: &str, bytes: u64) {
    UPLOADS_TOTAL.with_label_values(&[kind]).inc();
    BYTES_UPLOADED.inc_by(bytes as f64);
}

/// Record what a worker did with a reserved task
pub fn record_task_action(action: &str) {
    TASKS_TOTAL.with_label_values(&[action]).inc();
}

pub fn record_stale_claims_cleared(count: usize) {
    STALE_CLAIMS_CLEARED.inc_by(count as f64);
}

pub fn record_run_completed() {
    RUNS_COMPLETED.inc();
}

/// Record a DB operation failure
///
/// Call this when a best-effort update like a run counter increment fails.
/// The record's own outcome is unaffected.
pub fn record_db_operation_failure() {
    DB_OPERATION_FAILURES.inc();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_db_operation_failure_counter() {
        let before = DB_OPERATION_FAILURES.get();
        record_db_operation_failure();
        record_db_operation_failure();
        let after = DB_OPERATION_FAILURES.get();

        // Other tests may record failures concurrently.
        assert!(after - before >= 2.0);
    }

    #[test]
    fn test_record_outcome_labels() {
        let before = RECORDS_TOTAL.with_label_values(&["migrated"]).get();
        let samples = RECORD_DURATION.get_sample_count();
        record_outcome("migrated", 0.2);
        assert!(RECORDS_TOTAL.with_label_values(&["migrated"]).get() - before >= 1.0);
        assert!(RECORD_DURATION.get_sample_count() > samples);
    }

    #[tokio::test]
    async fn test_write_textfile_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archiver.prom");
        tokio::fs::write(&path, "stale").await.unwrap();

        write_textfile(&path).await.unwrap();

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert_ne!(written, "stale");
        assert!(!dir.path().join("archiver.prom.tmp").exists());
    }
}
