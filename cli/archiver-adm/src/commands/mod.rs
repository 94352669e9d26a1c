// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

pub mod queue;
pub mod records;
pub mod run;

use anyhow::{Context, Result};

use archiver::config::ArchiverConfig;
use archiver::context::ArchiverContext;
use archiver::db::Database;

/// Load the configuration, letting `--database-url` override the environment.
pub fn load_config(database_url: Option<&str>) -> Result<ArchiverConfig> {
    ArchiverConfig::from_lookup(|name| match (name, database_url) {
        ("DATABASE_URL", Some(url)) => Some(url.to_string()),
        _ => std::env::var(name).ok(),
    })
    .context("Failed to load configuration")
}

pub async fn connect(config: ArchiverConfig) -> Result<ArchiverContext> {
    ArchiverContext::connect(config).await
}

/// Create the engine-owned tables.
pub async fn init_schema(config: &ArchiverConfig) -> Result<()> {
    let db = Database::new(&config.database_url)
        .await
        .with_context(|| format!("Failed to connect to {}", config.database_url_display()))?;
    db.init_schema()
        .await
        .context("Failed to create archiver tables")?;
    println!("Archiver tables are ready.");
    Ok(())
}
