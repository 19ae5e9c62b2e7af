//! Settings type definitions.
//!
//! Field names are camelCase in JSON. Every section is `#[serde(default)]`
//! so a partial file only overrides what it names.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassHubSettings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub services: ServiceSettings,
    pub logging: LoggingSettings,
}

impl ClassHubSettings {
    /// Reject combinations the connection actors can't run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.server;
        if s.ping_period_ms >= s.pong_wait_ms {
            return Err(SettingsError::InvalidValue(format!(
                "pingPeriodMs ({}) must be below pongWaitMs ({})",
                s.ping_period_ms, s.pong_wait_ms
            )));
        }
        if s.outbound_queue == 0 || s.hub_queue == 0 || s.ink_channel_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "queue sizes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Listener and connection-actor limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Per-connection outbound queue capacity.
    pub outbound_queue: usize,
    /// Hub command channel capacity.
    pub hub_queue: usize,
    /// Buffered handwriting-subscription events.
    pub ink_channel_capacity: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
    pub write_wait_ms: u64,
    pub pong_wait_ms: u64,
    pub ping_period_ms: u64,
    /// Window for the first valid Register message.
    pub registration_timeout_ms: u64,
    /// How long the Hub waits on a full outbound queue before dropping.
    pub hub_send_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            outbound_queue: 256,
            hub_queue: 1024,
            ink_channel_capacity: 256,
            max_message_size: 512,
            write_wait_ms: 10_000,
            pong_wait_ms: 60_000,
            ping_period_ms: 54_000,
            registration_timeout_ms: 10_000,
            hub_send_timeout_ms: 1_000,
        }
    }
}

impl ServerSettings {
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    pub fn hub_send_timeout(&self) -> Duration {
        Duration::from_millis(self.hub_send_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// SQLite file. Relative paths resolve against the settings directory.
    pub db_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: "classhub.db".to_string(),
        }
    }
}

/// External identity and unit-directory endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceSettings {
    /// Base URL of the course API.
    pub api_domain: String,
    /// Token introspection endpoint; `?token=` is appended.
    pub tokeninfo_url: String,
    /// Public unit lookup. `:unit_id` is substituted.
    pub unit_info_url: String,
    /// Client-credentials token used for directory calls.
    pub system_token: String,
    pub request_timeout_ms: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            api_domain: "http://127.0.0.1:9000".to_string(),
            tokeninfo_url: "http://127.0.0.1:9000/oauth2/tokeninfo".to_string(),
            unit_info_url: "http://127.0.0.1:9000/v1/units/:unit_id/info".to_string(),
            system_token: String::new(),
            request_timeout_ms: 5_000,
        }
    }
}

impl ServiceSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    /// Persist WARN and above to SQLite.
    pub sqlite_sink: bool,
    pub db_path: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            sqlite_sink: false,
            db_path: "logs.db".to_string(),
        }
    }
}

/// Resolve `path` against `base` unless it is already absolute.
pub fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_connection_limits() {
        let s = ClassHubSettings::default();
        assert_eq!(s.server.outbound_queue, 256);
        assert_eq!(s.server.pong_wait(), Duration::from_secs(60));
        assert_eq!(s.server.ping_period(), Duration::from_secs(54));
        assert_eq!(s.server.write_wait(), Duration::from_secs(10));
        assert_eq!(s.server.registration_timeout(), Duration::from_secs(10));
        assert!(s.validate().is_ok());
    }

    #[test]
    fn camel_case_json() {
        let value = serde_json::to_value(ClassHubSettings::default()).unwrap();
        assert!(value["server"]["pongWaitMs"].is_u64());
        assert!(value["services"]["tokeninfoUrl"].is_string());
        assert!(value["logging"]["sqliteSink"].is_boolean());
    }

    #[test]
    fn ping_must_beat_pong() {
        let mut s = ClassHubSettings::default();
        s.server.ping_period_ms = s.server.pong_wait_ms;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn resolve_relative_and_absolute() {
        let base = Path::new("/srv/classhub");
        assert_eq!(resolve_path(base, "hub.db"), PathBuf::from("/srv/classhub/hub.db"));
        assert_eq!(resolve_path(base, "/var/hub.db"), PathBuf::from("/var/hub.db"));
    }
}
