//! # classhub
//!
//! Classroom session hub binary: loads settings, opens the store and serves
//! the WebSocket and reporting endpoints until interrupted.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use classhub_server::{HttpDirectory, IdentityService, UnitDirectory};
use classhub_settings::{load_settings, load_settings_from_path, resolve_path, settings_dir};
use classhub_store::{SqliteStore, UnitStore};
use classhub_telemetry::{init_telemetry, TelemetryConfig};

/// Classroom session hub.
#[derive(Parser, Debug)]
#[command(name = "classhub", about = "Classroom session hub")]
struct Cli {
    /// Settings file (defaults to `~/.classhub/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to bind (0 for auto-assign). Overrides settings.
    #[arg(long)]
    port: Option<u16>,

    /// Path to the `SQLite` database. Overrides settings.
    #[arg(long)]
    db_path: Option<PathBuf>,
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => load_settings().context("Failed to load settings")?,
    };
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let base = settings_dir();
    let telemetry = init_telemetry(TelemetryConfig {
        filter: settings.logging.level.clone(),
        json: settings.logging.json,
        log_to_sqlite: settings.logging.sqlite_sink,
        log_db_path: resolve_path(&base, &settings.logging.db_path),
    });
    if let Some(path) = telemetry.log_db() {
        tracing::info!(path = %path.display(), "persisting warn+ logs");
    }

    let db_path = cli
        .db_path
        .unwrap_or_else(|| resolve_path(&base, &settings.store.db_path));
    ensure_parent_dir(&db_path)?;
    let store: Arc<dyn UnitStore> = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?,
    );
    tracing::info!(path = %db_path.display(), "database opened");

    let http = Arc::new(
        HttpDirectory::new(settings.services.clone()).context("Failed to build HTTP client")?,
    );
    let identity: Arc<dyn IdentityService> = http.clone();
    let directory: Arc<dyn UnitDirectory> = http;

    let handle = classhub_server::start(&settings.server, store, identity, directory)
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port, "classhub ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown();
    Ok(())
}
