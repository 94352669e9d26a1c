// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Derived run statistics for status output

use chrono::{DateTime, Utc};
use serde::Serialize;

use archiver_types::{MigrationRun, RunId, RunStatus};

/// A run snapshot plus progress figures computed against a clock.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub total: i64,
    pub processed: i64,
    pub failed: i64,
    pub dispatched: i64,
    pub remaining: i64,
    /// Settled records as a percentage of the total
    pub completion_percent: f64,
    /// Processed records as a percentage of settled records
    pub success_rate: f64,
    pub elapsed_secs: i64,
    /// Settled records per minute since the run started
    pub rate_per_minute: f64,
    /// Seconds until the remaining records settle at the current rate
    pub eta_secs: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn new(run: &MigrationRun, now: DateTime<Utc>) -> Self {
        let settled = run.settled_count();
        let remaining = run.remaining();

        let completion_percent = if run.total_count > 0 {
            (settled as f64 / run.total_count as f64 * 100.0).min(100.0)
        } else {
            100.0
        };

        let success_rate = if settled > 0 {
            run.processed_count as f64 / settled as f64 * 100.0
        } else {
            0.0
        };

        let end = run.completed_at.unwrap_or(now);
        let elapsed_secs = (end - run.started_at).num_seconds().max(0);

        let rate_per_minute = if elapsed_secs > 0 {
            settled as f64 / (elapsed_secs as f64 / 60.0)
        } else {
            0.0
        };

        let eta_secs = if run.is_completed() || remaining == 0 {
            Some(0)
        } else if rate_per_minute > 0.0 {
            Some((remaining as f64 / rate_per_minute * 60.0).ceil() as i64)
        } else {
            None
        };

        Self {
            run_id: run.id,
            status: run.status,
            total: run.total_count,
            processed: run.processed_count,
            failed: run.failed_count,
            dispatched: run.dispatched_count,
            remaining,
            completion_percent,
            success_rate,
            elapsed_secs,
            rate_per_minute,
            eta_secs,
            started_at: run.started_at,
            completed_at: run.completed_at,
        }
    }
}

/// `1h 02m 03s` style duration.
pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn run_at(total: i64, processed: i64, failed: i64) -> (MigrationRun, DateTime<Utc>) {
        let started = Utc::now() - Duration::minutes(10);
        let mut run = MigrationRun::new(total, started);
        run.processed_count = processed;
        run.failed_count = failed;
        run.status = RunStatus::Processing;
        (run, started + Duration::minutes(10))
    }

    #[test]
    fn progress_figures() {
        let (run, now) = run_at(1000, 450, 50);
        let report = RunReport::new(&run, now);

        assert_eq!(report.remaining, 500);
        assert!((report.completion_percent - 50.0).abs() < f64::EPSILON);
        assert!((report.success_rate - 90.0).abs() < 1e-9);
        assert_eq!(report.elapsed_secs, 600);
        assert!((report.rate_per_minute - 50.0).abs() < 1e-9);
        assert_eq!(report.eta_secs, Some(600));
    }

    #[test]
    fn fresh_run_has_no_eta() {
        let (run, now) = run_at(10, 0, 0);
        let report = RunReport::new(&run, now);
        assert_eq!(report.eta_secs, None);
        assert_eq!(report.success_rate, 0.0);
    }

    #[test]
    fn empty_run_is_fully_complete() {
        let (run, now) = run_at(0, 0, 0);
        let report = RunReport::new(&run, now);
        assert_eq!(report.completion_percent, 100.0);
        assert_eq!(report.eta_secs, Some(0));
    }

    #[test]
    fn completed_run_stops_the_clock() {
        let (mut run, now) = run_at(4, 4, 0);
        run.status = RunStatus::Completed;
        run.completed_at = Some(run.started_at + Duration::minutes(2));
        let report = RunReport::new(&run, now + Duration::hours(1));
        assert_eq!(report.elapsed_secs, 120);
        assert_eq!(report.eta_secs, Some(0));
    }

    #[test]
    fn durations_are_compact() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(65), "1m 05s");
        assert_eq!(format_duration(3723), "1h 02m 03s");
    }
}
