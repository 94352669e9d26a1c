// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Queue commands: status, clean-stale

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Subcommand;

use archiver::context::ArchiverContext;
use archiver::queue::TaskQueue;

use crate::output;

#[derive(Subcommand)]
pub enum QueueCommand {
    /// Show queue depth and the active worker estimate
    Status,

    /// Release claims held by workers that stopped responding
    CleanStale {
        /// Claim timeout in seconds (defaults to ARCHIVER_STALE_CLAIM_SECS)
        #[arg(long)]
        timeout: Option<u64>,

        /// Only list the stale claims
        #[arg(long)]
        dry_run: bool,
    },
}

pub async fn execute(ctx: &ArchiverContext, command: QueueCommand, json: bool) -> Result<()> {
    match command {
        QueueCommand::Status => {
            let queue = &ctx.config.queue_name;
            let stats = ctx
                .queue
                .stats(queue)
                .await
                .with_context(|| format!("Failed to read stats for queue '{}'", queue))?;
            if json {
                output::print_json(&stats)
            } else {
                output::print_queue_stats(queue, &stats);
                Ok(())
            }
        }

        QueueCommand::CleanStale { timeout, dry_run } => {
            let reaper = match timeout {
                Some(secs) => ctx.reaper_with_timeout(Duration::from_secs(secs)),
                None => ctx.reaper(),
            };
            let report = reaper.sweep(dry_run).await?;

            if json {
                return output::print_json(&report.claims);
            }

            if report.claims.is_empty() {
                println!("No stale claims older than {}.", report.threshold);
                return Ok(());
            }

            output::print_stale_claims(&report.claims);
            println!();
            if report.cleared {
                println!(
                    "Released {} stale claims; their tasks will be retried.",
                    report.claims.len()
                );
            } else {
                println!(
                    "DRY RUN: {} stale claims would be released.",
                    report.claims.len()
                );
            }
            Ok(())
        }
    }
}
