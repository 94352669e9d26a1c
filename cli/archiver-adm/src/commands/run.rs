// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Run commands: start, resume, status, list

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use uuid::Uuid;

use archiver::context::ArchiverContext;
use archiver::migration::{MigrationError, RecordPlan, failed};
use archiver::report::RunReport;
use archiver::store::RecordStore;
use archiver_types::{DispatchMode, MigrationRun, ProcessingResult, Record};

use crate::output;

/// Failed records listed under a status report
const STATUS_FAILED_LIMIT: i64 = 10;

#[derive(Subcommand)]
pub enum RunCommand {
    /// Create a run over every eligible record and drive it
    Start {
        /// Dispatch mode (defaults to ARCHIVER_DISPATCH_MODE)
        #[arg(long)]
        mode: Option<DispatchMode>,

        /// Print the planned uploads without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Records included in the dry-run plan
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Continue an interrupted or failed run
    Resume {
        /// Run identifier
        id: Uuid,

        /// Dispatch mode (defaults to ARCHIVER_DISPATCH_MODE)
        #[arg(long)]
        mode: Option<DispatchMode>,
    },

    /// Show progress of a run (the latest one by default)
    Status {
        /// Run identifier
        id: Option<Uuid>,

        /// Refresh until the run completes
        #[arg(long)]
        watch: bool,

        /// Seconds between refreshes
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },

    /// List recent runs
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

pub async fn execute(ctx: &ArchiverContext, command: RunCommand, json: bool) -> Result<()> {
    match command {
        RunCommand::Start {
            mode,
            dry_run,
            limit,
        } => {
            let mode = mode.unwrap_or(ctx.config.dispatch_mode);
            if dry_run {
                plan(ctx, limit, json).await
            } else {
                with_migration_lock(ctx, start(ctx, mode, json)).await
            }
        }
        RunCommand::Resume { id, mode } => {
            let mode = mode.unwrap_or(ctx.config.dispatch_mode);
            with_migration_lock(ctx, resume(ctx, id, mode, json)).await
        }
        RunCommand::Status {
            id,
            watch,
            interval,
        } => status(ctx, id, watch, interval, json).await,
        RunCommand::List { limit } => {
            let runs = ctx.tracker().list_runs(limit).await?;
            if json {
                output::print_json(&runs)
            } else if runs.is_empty() {
                println!("No migration runs found.");
                Ok(())
            } else {
                output::print_runs(&runs);
                Ok(())
            }
        }
    }
}

/// Drive `work` while holding the migration lock, so only one command
/// starts or resumes runs at a time.
async fn with_migration_lock(
    ctx: &ArchiverContext,
    work: impl Future<Output = Result<()>>,
) -> Result<()> {
    let lock = ctx
        .tracker()
        .lock_migration()
        .await
        .context("Cannot start the migration")?;
    let result = work.await;
    if let Err(e) = lock.release().await {
        tracing::warn!(error = %e, "Failed to release the migration lock");
    }
    result
}

#[derive(Serialize)]
struct DryRun {
    eligible: i64,
    plans: Vec<RecordPlan>,
}

async fn plan(ctx: &ArchiverContext, limit: i64, json: bool) -> Result<()> {
    let eligible = ctx
        .records
        .count_eligible(ctx.config.max_attempts)
        .await
        .context("Failed to count eligible records")?;
    let plans = failed::plan(
        ctx.records.as_ref(),
        &ctx.config.key_layout(),
        &ctx.config.attachment_root,
        ctx.config.max_attempts,
        limit,
    )
    .await?;

    if json {
        return output::print_json(&DryRun { eligible, plans });
    }

    println!("DRY RUN: nothing will be uploaded or changed.");
    println!("{} eligible records; showing the first {}.", eligible, plans.len());
    println!();

    let mut table = output::create_table(&["RECORD", "KEY", "BYTES", "ATTACHMENTS", "READY"]);
    for plan in &plans {
        table.add_row(vec![
            plan.record_id.to_string(),
            plan.body_key.clone(),
            plan.body_bytes.to_string(),
            plan.attachments.len().to_string(),
            if plan.is_complete() { "yes" } else { "no" }.to_string(),
        ]);
    }
    output::print_table(table);

    let problems: Vec<_> = plans
        .iter()
        .flat_map(|p| p.attachments.iter().map(move |a| (p.record_id, a)))
        .filter(|(_, a)| !a.file_present)
        .collect();
    if !problems.is_empty() {
        println!();
        println!("Attachments that would fail their record:");
        for (record_id, attachment) in problems {
            match &attachment.local_path {
                Some(path) => println!(
                    "  record {} attachment {}: {} missing",
                    record_id,
                    attachment.attachment_id,
                    path.display()
                ),
                None => println!(
                    "  record {} attachment {}: no attachment row",
                    record_id, attachment.attachment_id
                ),
            }
        }
    }
    Ok(())
}

async fn start(ctx: &ArchiverContext, mode: DispatchMode, json: bool) -> Result<()> {
    let eligible = ctx
        .records
        .count_eligible(ctx.config.max_attempts)
        .await
        .context("Failed to count eligible records")?;
    let run = ctx.tracker().create_run(eligible).await?;
    if !json {
        println!(
            "Created run {} over {} eligible records ({} mode)",
            run.id, eligible, mode
        );
    }
    drive(ctx, run, mode, json).await
}

async fn resume(ctx: &ArchiverContext, id: Uuid, mode: DispatchMode, json: bool) -> Result<()> {
    let run = match ctx.tracker().resume(id).await {
        Ok(run) => run,
        Err(MigrationError::RunCompleted(_)) => {
            let run = ctx.tracker().find_run(id).await?;
            return if json {
                output::print_json(&RunReport::new(&run, Utc::now()))
            } else {
                println!("Run {} is already completed.", id);
                Ok(())
            };
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to resume run {}", id)),
    };

    if !json {
        println!(
            "Resuming run {} ({} of {} settled, {} mode)",
            run.id,
            run.settled_count(),
            run.total_count,
            mode
        );
    }
    drive(ctx, run, mode, json).await
}

async fn drive(
    ctx: &ArchiverContext,
    run: MigrationRun,
    mode: DispatchMode,
    json: bool,
) -> Result<()> {
    match mode {
        DispatchMode::Batch => {
            let total = run_batches(ctx, &run, json).await?;
            let run = ctx.tracker().find_run(run.id).await?;
            if json {
                output::print_json(&RunReport::new(&run, Utc::now()))
            } else {
                println!(
                    "Processed {} records, {} failed.",
                    total.processed, total.failed
                );
                println!();
                output::print_report(&RunReport::new(&run, Utc::now()));
                Ok(())
            }
        }
        DispatchMode::FanOut => {
            let published = ctx
                .fan_out_dispatcher()
                .dispatch_all(run.id)
                .await
                .with_context(|| format!("Dispatch failed for run {}", run.id))?;
            let run = ctx.tracker().find_run(run.id).await?;
            if json {
                output::print_json(&RunReport::new(&run, Utc::now()))
            } else {
                println!(
                    "Published {} tasks to queue '{}'.",
                    published, ctx.config.queue_name
                );
                if !run.is_completed() {
                    println!("Workers complete the run; follow it with `run status {} --watch`.", run.id);
                }
                Ok(())
            }
        }
    }
}

async fn run_batches(
    ctx: &ArchiverContext,
    run: &MigrationRun,
    json: bool,
) -> Result<ProcessingResult> {
    let progress = if json {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(run.total_count.max(0) as u64)
    };
    progress.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} ({percent}%) {msg} [{elapsed}]")?
            .progress_chars("=> "),
    );
    progress.set_position(run.settled_count().max(0) as u64);

    let mut failed_so_far = run.failed_count;
    let result = ctx
        .batch_dispatcher()
        .run_to_completion(run.id, |slice| {
            failed_so_far += slice.failed as i64;
            progress.inc(slice.processed + slice.failed);
            progress.set_message(format!("{} failed", failed_so_far));
        })
        .await;

    match result {
        Ok(total) => {
            progress.finish_and_clear();
            Ok(total)
        }
        Err(e) => {
            progress.abandon();
            Err(e).with_context(|| {
                format!(
                    "Run {} stopped; continue it with `run resume {}`",
                    run.id, run.id
                )
            })
        }
    }
}

#[derive(Serialize)]
struct StatusOutput {
    #[serde(flatten)]
    report: RunReport,
    failed_records: Vec<Record>,
}

async fn status(
    ctx: &ArchiverContext,
    id: Option<Uuid>,
    watch: bool,
    interval: u64,
    json: bool,
) -> Result<()> {
    let tracker = ctx.tracker();
    let id = match id {
        Some(id) => id,
        None => match tracker.list_runs(1).await?.first() {
            Some(run) => run.id,
            None => {
                println!("No migration runs found.");
                return Ok(());
            }
        },
    };

    loop {
        let run = tracker.find_run(id).await?;
        let report = RunReport::new(&run, Utc::now());
        let failed_records = ctx.failed_records().list(STATUS_FAILED_LIMIT).await?;

        if json {
            output::print_json(&StatusOutput {
                report,
                failed_records,
            })?;
        } else {
            if watch {
                // Clear screen
                print!("\x1B[2J\x1B[1;1H");
            }
            output::print_report(&report);
            if !failed_records.is_empty() {
                println!();
                println!("Permanently failed records (first {}):", STATUS_FAILED_LIMIT);
                output::print_failed_records(&failed_records);
            }
        }

        if !watch || run.is_completed() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(interval.max(1))).await;
    }
}
