// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Archiver worker
//!
//! Consumes fan-out migration tasks from the queue. Each process runs
//! `ARCHIVER_WORKER_CONCURRENCY` worker loops, optionally a periodic
//! stale-claim reaper, and optionally writes Prometheus metrics to a
//! textfile. Ctrl-C stops the loops after their current task.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use archiver::config::ArchiverConfig;
use archiver::context::ArchiverContext;
use archiver::metrics;
use archiver::migration::WorkerSettings;

/// How often the metrics textfile is rewritten.
const METRICS_WRITE_INTERVAL: Duration = Duration::from_secs(15);

fn print_version() {
    let version = env!("CARGO_PKG_VERSION");
    let name = env!("CARGO_PKG_NAME");
    let buildstamp = option_env!("STAMP").unwrap_or("no-STAMP");
    println!("{} {} ({})", name, version, buildstamp);
}

fn print_help(program: &str) {
    print_version();
    println!("Usage: {} [OPTIONS]", program);
    println!();
    println!("Options:");
    println!("  -h, --help       Display this information");
    println!("  -V, --version    Display the program's version number");
    println!();
    println!("Environment variables:");
    println!("  DATABASE_URL                   PostgreSQL connection URL (required)");
    println!("  S3_BUCKET                      Target bucket (default: record-archive)");
    println!("  S3_REGION                      Bucket region (default: us-east-1)");
    println!("  S3_ENDPOINT                    Custom S3 endpoint, enables path-style (optional)");
    println!("  S3_SERVER_SIDE_ENCRYPTION      Request AES256 SSE (default: true)");
    println!("  ARCHIVER_BODY_PREFIX           Body key prefix (default: records/)");
    println!("  ARCHIVER_ATTACHMENT_PREFIX     Attachment key prefix (default: attachments/)");
    println!("  ARCHIVER_ATTACHMENT_ROOT       Local attachment root (default: ./storage)");
    println!("  ARCHIVER_QUEUE                 Queue name (default: record-migration)");
    println!("  ARCHIVER_MAX_ATTEMPTS          Record attempt cap (default: 3)");
    println!("  ARCHIVER_TASK_MAX_TRIES        Tries per task (default: 3)");
    println!("  ARCHIVER_TASK_BACKOFF_SECS     Delay before a retry (default: 300)");
    println!("  ARCHIVER_POLL_INTERVAL_MS      Idle poll interval (default: 1000)");
    println!("  ARCHIVER_WORKER_CONCURRENCY    Worker loops (default: 1)");
    println!("  ARCHIVER_STALE_CLAIM_SECS      Claim timeout (default: 300)");
    println!("  ARCHIVER_REAPER_INTERVAL_SECS  Stale-claim sweep interval, 0 = off (default: 0)");
    println!("  METRICS_FILE                   Prometheus textfile path (optional)");
    println!("  CONFIG_FILE                    JSON config file for SIGUSR1 reloading (optional)");
    println!("  RUST_LOG                       Log filter (default: archiver=info)");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --version and --help
    let args: Vec<String> = std::env::args().collect();
    #[allow(clippy::never_loop)] // Intentional: early return on first recognized arg
    for arg in &args[1..] {
        match arg.as_str() {
            "-V" | "--version" => {
                print_version();
                return Ok(());
            }
            "-h" | "--help" => {
                print_help(&args[0]);
                return Ok(());
            }
            _ => {
                eprintln!("Unknown option: {}", arg);
                std::process::exit(1);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "archiver=info".to_string()),
        ))
        .init();

    print_version();

    let config = ArchiverConfig::from_env().context("Failed to load configuration")?;
    info!("Database URL: {}", config.database_url_display());
    info!(
        bucket = %config.s3.bucket,
        queue = %config.queue_name,
        concurrency = config.worker_concurrency,
        "Worker configuration loaded"
    );

    metrics::register_metrics();

    let (settings_tx, settings_rx) = watch::channel(WorkerSettings::from(&config));

    // Start config file watcher if CONFIG_FILE is set (Unix only)
    #[cfg(unix)]
    if let Ok(config_file) = std::env::var("CONFIG_FILE") {
        let config_path = PathBuf::from(&config_file);
        if tokio::fs::try_exists(&config_path).await.unwrap_or(false) {
            let (config_tx, mut config_rx) = watch::channel(config.clone());
            tokio::spawn(ArchiverConfig::start_config_watcher(
                config_path,
                config.clone(),
                config_tx,
            ));
            tokio::spawn(async move {
                while config_rx.changed().await.is_ok() {
                    let settings = WorkerSettings::from(&*config_rx.borrow_and_update());
                    settings_tx.send_replace(settings);
                }
            });
            info!(
                config_file = %config_file,
                "Config watcher started - send SIGUSR1 to reload"
            );
        } else {
            warn!(
                config_file = %config_file,
                "CONFIG_FILE specified but file does not exist, config reloading disabled"
            );
        }
    }

    let ctx = ArchiverContext::connect(config.clone())
        .await
        .context("Failed to create archiver context")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    for _ in 0..config.worker_concurrency {
        let worker = ctx.worker(settings_rx.clone());
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { worker.run(shutdown).await });
    }

    if config.reaper_interval_secs > 0 {
        let reaper = ctx.reaper();
        let interval = Duration::from_secs(config.reaper_interval_secs);
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { reaper.run_periodic(interval, shutdown).await });
        info!(interval_secs = config.reaper_interval_secs, "Stale claim reaper started");
    }

    if let Some(path) = config.metrics_file.clone() {
        let mut shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(METRICS_WRITE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {}
                }
                if let Err(e) = metrics::write_textfile(&path).await {
                    warn!(path = %path.display(), error = %e, "Failed to write metrics file");
                }
                if *shutdown.borrow() {
                    break;
                }
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, finishing in-flight tasks");
    let _ = shutdown_tx.send(true);

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Worker task ended abnormally");
        }
    }

    info!("Archiver worker stopped");
    Ok(())
}
