mod logging;

pub use logging::{SqliteLogLayer, SqliteLogSink};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default filter directive (e.g. `info` or `info,classhub_server=debug`).
    /// Overridden by `RUST_LOG`.
    pub filter: String,
    /// JSON lines on stdout; plain text otherwise.
    pub json: bool,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: true,
            log_to_sqlite: false,
            log_db_path: PathBuf::from("logs.db"),
        }
    }
}

/// What `init_telemetry` ended up installing.
pub struct TelemetryGuard {
    log_db: Option<PathBuf>,
}

impl TelemetryGuard {
    /// Where warn+ events are persisted, if the SQLite sink opened.
    pub fn log_db(&self) -> Option<&Path> {
        self.log_db.as_deref()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let sqlite_layer = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => Some(SqliteLogLayer::new(Arc::new(sink))),
            Err(e) => {
                eprintln!("classhub-telemetry: failed to open log DB: {e}");
                None
            }
        }
    } else {
        None
    };
    let log_db = sqlite_layer.as_ref().map(|_| config.log_db_path.clone());

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init()
    {
        eprintln!("classhub-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard { log_db }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_reports_the_log_database() {
        let dir = std::env::temp_dir().join(format!("classhub-telemetry-{}", uuid::Uuid::now_v7()));
        let path = dir.join("logs.db");
        let guard = init_telemetry(TelemetryConfig {
            log_to_sqlite: true,
            log_db_path: path.clone(),
            ..Default::default()
        });
        assert_eq!(guard.log_db(), Some(path.as_path()));
        assert!(path.exists());
    }
}
