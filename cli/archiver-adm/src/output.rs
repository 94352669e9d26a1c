// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Table and JSON output

use anyhow::Result;
use chrono::{DateTime, Utc};
use comfy_table::{Table, presets::NOTHING};
use serde::Serialize;

use archiver::report::{RunReport, format_duration};
use archiver_types::{MigrationRun, QueueStats, Record, RunStatus, StaleClaim};

/// Create a new table with headers
pub fn create_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_header(headers);
    table
}

pub fn print_table(table: Table) {
    println!("{table}");
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn percent(value: i64, total: i64) -> String {
    if total == 0 {
        return "0%".to_string();
    }
    format!("{:.2}%", value as f64 / total as f64 * 100.0)
}

/// Shorten an error for a table cell.
pub fn excerpt(text: Option<&str>, max: usize) -> String {
    let Some(text) = text else {
        return "-".to_string();
    };
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max {
        return line.to_string();
    }
    let cut: String = line.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut)
}

pub fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "Pending",
        RunStatus::Processing => "Processing",
        RunStatus::Completed => "Completed",
        RunStatus::Failed => "Failed",
    }
}

pub fn print_runs(runs: &[MigrationRun]) {
    let mut table = create_table(&[
        "ID",
        "STATUS",
        "TOTAL",
        "PROCESSED",
        "FAILED",
        "STARTED",
        "COMPLETED",
    ]);
    for run in runs {
        table.add_row(vec![
            run.id.to_string(),
            status_label(run.status).to_string(),
            run.total_count.to_string(),
            run.processed_count.to_string(),
            run.failed_count.to_string(),
            timestamp(Some(run.started_at)),
            timestamp(run.completed_at),
        ]);
    }
    print_table(table);
}

pub fn print_report(report: &RunReport) {
    println!("Run:    {}", report.run_id);
    println!("Status: {}", status_label(report.status));
    println!();

    let mut counts = create_table(&["CATEGORY", "COUNT", "PERCENTAGE"]);
    counts.add_row(vec!["Total".to_string(), report.total.to_string(), "100%".to_string()]);
    counts.add_row(vec![
        "Dispatched".to_string(),
        report.dispatched.to_string(),
        percent(report.dispatched, report.total),
    ]);
    counts.add_row(vec![
        "Processed".to_string(),
        report.processed.to_string(),
        percent(report.processed, report.total),
    ]);
    counts.add_row(vec![
        "Failed".to_string(),
        report.failed.to_string(),
        percent(report.failed, report.total),
    ]);
    counts.add_row(vec![
        "Remaining".to_string(),
        report.remaining.to_string(),
        percent(report.remaining, report.total),
    ]);
    print_table(counts);
    println!();

    let eta = match report.eta_secs {
        Some(secs) => format_duration(secs),
        None => "unknown".to_string(),
    };
    let mut perf = create_table(&["METRIC", "VALUE"]);
    perf.add_row(vec![
        "Completion".to_string(),
        format!("{:.2}%", report.completion_percent),
    ]);
    perf.add_row(vec![
        "Success rate".to_string(),
        format!("{:.2}%", report.success_rate),
    ]);
    perf.add_row(vec![
        "Processing rate".to_string(),
        format!("{:.2} records/min", report.rate_per_minute),
    ]);
    perf.add_row(vec![
        "Elapsed".to_string(),
        format_duration(report.elapsed_secs),
    ]);
    perf.add_row(vec!["Estimated remaining".to_string(), eta]);
    print_table(perf);

    if let Some(at) = report.completed_at {
        println!();
        println!("Completed at {}", timestamp(Some(at)));
    }
}

pub fn print_failed_records(records: &[Record]) {
    let mut table = create_table(&["ID", "ATTEMPTS", "LAST ATTEMPT", "ERROR"]);
    for record in records {
        table.add_row(vec![
            record.id.to_string(),
            record.attempts.to_string(),
            timestamp(record.last_attempted_at),
            excerpt(record.last_error.as_deref(), 60),
        ]);
    }
    print_table(table);
}

pub fn print_queue_stats(queue: &str, stats: &QueueStats) {
    println!("Queue: {}", queue);
    println!();
    let mut table = create_table(&["METRIC", "VALUE"]);
    table.add_row(vec!["Pending".to_string(), stats.pending.to_string()]);
    table.add_row(vec!["Delayed".to_string(), stats.delayed.to_string()]);
    table.add_row(vec!["Being processed".to_string(), stats.reserved.to_string()]);
    table.add_row(vec!["Failed (buried)".to_string(), stats.failed.to_string()]);
    table.add_row(vec![
        "Active workers (est.)".to_string(),
        stats.active_workers_estimate().to_string(),
    ]);
    print_table(table);
}

pub fn print_stale_claims(claims: &[StaleClaim]) {
    let mut table = create_table(&["TASK", "RECORD", "ATTEMPTS", "RESERVED AT"]);
    for claim in claims {
        table.add_row(vec![
            claim.task_id.to_string(),
            claim
                .record_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            claim.attempts.to_string(),
            timestamp(Some(claim.reserved_at)),
        ]);
    }
    print_table(table);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_keeps_short_text() {
        assert_eq!(excerpt(Some("boom"), 10), "boom");
        assert_eq!(excerpt(None, 10), "-");
    }

    #[test]
    fn excerpt_cuts_long_text_and_extra_lines() {
        assert_eq!(excerpt(Some("abcdefghijkl"), 8), "abcde...");
        assert_eq!(excerpt(Some("first\nsecond"), 20), "first");
    }

    #[test]
    fn percent_handles_empty_total() {
        assert_eq!(percent(5, 0), "0%");
        assert_eq!(percent(1, 4), "25.00%");
    }
}
