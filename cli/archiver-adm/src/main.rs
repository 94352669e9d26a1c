// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Archiver administration CLI
//!
//! Starts, resumes and inspects migration runs, reports on the task queue,
//! and manages permanently failed records.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::queue::QueueCommand;
use commands::records::RecordsCommand;
use commands::run::RunCommand;

#[derive(Parser)]
#[command(name = "archiver-adm")]
#[command(about = "Record archiver administration utility", long_about = None)]
#[command(version)]
struct Cli {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL", hide_env_values = true, global = true)]
    database_url: Option<String>,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migration run operations
    Run {
        #[command(subcommand)]
        action: RunCommand,
    },

    /// Task queue operations
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },

    /// Record operations
    Records {
        #[command(subcommand)]
        action: RecordsCommand,
    },

    /// Database schema operations
    Schema {
        #[command(subcommand)]
        action: SchemaAction,
    },
}

#[derive(Subcommand)]
enum SchemaAction {
    /// Create the archiver's run and queue tables
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "archiver_adm=warn,archiver=warn".to_string()),
        ))
        .with_writer(std::io::stderr)
        .init();

    let config = commands::load_config(cli.database_url.as_deref())?;
    tracing::debug!(database = %config.database_url_display(), "Configuration loaded");

    if let Commands::Schema {
        action: SchemaAction::Init,
    } = cli.command
    {
        return commands::init_schema(&config).await;
    }

    let ctx = commands::connect(config).await?;

    match cli.command {
        Commands::Run { action } => commands::run::execute(&ctx, action, cli.json).await,
        Commands::Queue { action } => commands::queue::execute(&ctx, action, cli.json).await,
        Commands::Records { action } => commands::records::execute(&ctx, action, cli.json).await,
        Commands::Schema { .. } => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use assert_cmd::Command;
    use escargot::CargoBuild;
    use predicates::prelude::*;

    /// Build the binary and return a Command to run it.
    fn build_cmd() -> Command {
        let cargo_build = CargoBuild::new()
            .bin("archiver-adm")
            .current_release()
            .run()
            .expect("failed to build archiver-adm");
        let mut cmd = Command::from_std(cargo_build.command());
        cmd.env_remove("DATABASE_URL");
        cmd
    }

    /// Test that running with no arguments shows usage information.
    #[test]
    fn no_params() {
        build_cmd()
            .assert()
            .failure()
            .stderr(predicate::str::contains("Usage:"))
            .stderr(predicate::str::contains("archiver-adm"));
    }

    #[test]
    fn version_flag() {
        build_cmd()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("archiver-adm"));
    }

    /// Test that `run` lists its subcommands when none is given.
    #[test]
    fn run_no_params() {
        build_cmd()
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("start"))
            .stderr(predicate::str::contains("resume"))
            .stderr(predicate::str::contains("status"));
    }

    /// Test that `run resume` requires a run id.
    #[test]
    fn run_resume_no_params() {
        build_cmd()
            .args(["run", "resume"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("<ID>"))
            .stderr(predicate::str::contains("required"));
    }

    /// Test that `run resume` rejects an id that is not a UUID.
    #[test]
    fn run_resume_bad_id() {
        build_cmd()
            .args(["run", "resume", "not-a-uuid"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("invalid value"));
    }

    /// Test that `--mode` only accepts known dispatch modes.
    #[test]
    fn run_start_bad_mode() {
        build_cmd()
            .args(["run", "start", "--mode", "sideways"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("invalid value"));
    }

    /// Test that `queue list` is not a known subcommand.
    #[test]
    fn queue_unknown_subcommand() {
        build_cmd()
            .args(["queue", "list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unrecognized subcommand"));
    }

    /// Test that `records failed` rejects unexpected arguments.
    #[test]
    fn records_failed_extra_params() {
        build_cmd()
            .args(["records", "failed", "extra"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unexpected argument"));
    }

    /// Test that commands fail cleanly without a database URL.
    #[test]
    fn missing_database_url() {
        build_cmd()
            .args(["run", "list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("DATABASE_URL"));
    }
}
