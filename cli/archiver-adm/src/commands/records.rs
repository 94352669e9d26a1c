// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Record commands: failed, retry-failed

use anyhow::Result;
use clap::Subcommand;
use dialoguer::Confirm;

use archiver::context::ArchiverContext;
use archiver_types::RecordId;

use crate::output;

/// Rows shown when listing candidates without `--reset`
const PREVIEW_ROWS: usize = 20;

#[derive(Subcommand)]
pub enum RecordsCommand {
    /// List records that reached the attempt cap without migrating
    Failed {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Make permanently failed records eligible for the next run
    RetryFailed {
        /// Records to consider
        #[arg(long, default_value_t = 100)]
        limit: i64,

        /// Reset the attempt counter and clear the last error
        #[arg(long)]
        reset: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

pub async fn execute(ctx: &ArchiverContext, command: RecordsCommand, json: bool) -> Result<()> {
    let failed = ctx.failed_records();

    match command {
        RecordsCommand::Failed { limit } => {
            let records = failed.list(limit).await?;
            if json {
                return output::print_json(&records);
            }
            if records.is_empty() {
                println!("No failed records found.");
                return Ok(());
            }
            let total = failed.count().await?;
            output::print_failed_records(&records);
            if total > records.len() as i64 {
                println!();
                println!("Showing {} of {} failed records.", records.len(), total);
            }
            Ok(())
        }

        RecordsCommand::RetryFailed { limit, reset, yes } => {
            let records = failed.list(limit).await?;
            if records.is_empty() {
                if json {
                    return output::print_json(&Vec::<i64>::new());
                }
                println!("No failed records found.");
                return Ok(());
            }

            if !reset {
                if json {
                    return output::print_json(&records);
                }
                println!("Found {} failed records.", records.len());
                println!("Run with --reset to reset their attempt counters.");
                println!();
                let shown = records.len().min(PREVIEW_ROWS);
                output::print_failed_records(&records[..shown]);
                if records.len() > shown {
                    println!("... and {} more", records.len() - shown);
                }
                return Ok(());
            }

            if !yes
                && !Confirm::new()
                    .with_prompt(format!(
                        "Reset the attempt counter for {} records?",
                        records.len()
                    ))
                    .default(false)
                    .interact()?
            {
                println!("Operation cancelled.");
                return Ok(());
            }

            let confirmed: Vec<RecordId> = records.iter().map(|r| r.id).collect();
            let ids = failed.reset(&confirmed).await?;
            if json {
                return output::print_json(&ids);
            }
            println!("Reset attempt counters for {} records.", ids.len());
            println!("Start a new run to migrate them: archiver-adm run start");
            Ok(())
        }
    }
}
