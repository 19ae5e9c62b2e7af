//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::ClassHubSettings;

/// `~/.classhub`, or `/tmp/.classhub` without a home directory.
pub fn settings_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".classhub")
}

/// Resolve the path to the settings file (`~/.classhub/settings.json`).
pub fn settings_path() -> PathBuf {
    settings_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ClassHubSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ClassHubSettings> {
    let defaults = serde_json::to_value(ClassHubSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ClassHubSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `CLASSHUB_*` overrides. Values that fail to parse or fall out of
/// range are ignored with a warning.
pub fn apply_env_overrides(settings: &mut ClassHubSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup.
pub fn apply_overrides_from<F>(settings: &mut ClassHubSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("CLASSHUB_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("CLASSHUB_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize("CLASSHUB_MAX_MESSAGE_SIZE", 128, 16 * 1024 * 1024) {
        settings.server.max_message_size = v;
    }
    if let Some(v) = env.usize("CLASSHUB_OUTBOUND_QUEUE", 1, 65_536) {
        settings.server.outbound_queue = v;
    }
    if let Some(v) = env.u64("CLASSHUB_REGISTRATION_TIMEOUT_MS", 100, 600_000) {
        settings.server.registration_timeout_ms = v;
    }

    if let Some(v) = env.string("CLASSHUB_DB_PATH") {
        settings.store.db_path = v;
    }

    if let Some(v) = env.string("CLASSHUB_API_DOMAIN") {
        settings.services.api_domain = v;
    }
    if let Some(v) = env.string("CLASSHUB_TOKENINFO_URL") {
        settings.services.tokeninfo_url = v;
    }
    if let Some(v) = env.string("CLASSHUB_UNIT_INFO_URL") {
        settings.services.unit_info_url = v;
    }
    if let Some(v) = env.string("CLASSHUB_SYSTEM_TOKEN") {
        settings.services.system_token = v;
    }

    if let Some(v) = env.string("CLASSHUB_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("CLASSHUB_LOG_JSON") {
        settings.logging.json = v;
    }
    if let Some(v) = env.bool("CLASSHUB_LOG_SQLITE") {
        settings.logging.sqlite_sink = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn temp_file(content: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("classhub-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3]}),
            serde_json::json!({"items": [4]}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.port, ClassHubSettings::default().server.port);
    }

    #[test]
    fn load_partial_json_overrides() {
        let (dir, path) = temp_file(r#"{"server": {"port": 9191}, "store": {"dbPath": "/data/hub.db"}}"#);
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.server.port, 9191);
        assert_eq!(settings.server.outbound_queue, 256);
        assert_eq!(settings.store.db_path, "/data/hub.db");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let (dir, path) = temp_file("not valid json");
        let result = load_settings_from_path(&path);
        assert!(matches!(result, Err(SettingsError::Json(_))));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn load_rejects_ping_slower_than_pong() {
        let (dir, path) = temp_file(r#"{"server": {"pingPeriodMs": 70000}}"#);
        let result = load_settings_from_path(&path);
        assert!(matches!(result, Err(SettingsError::InvalidValue(_))));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn overrides_apply_valid_values_only() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CLASSHUB_PORT", "9000"),
            ("CLASSHUB_OUTBOUND_QUEUE", "0"),
            ("CLASSHUB_LOG_SQLITE", "yes"),
            ("CLASSHUB_LOG_JSON", "maybe"),
            ("CLASSHUB_SYSTEM_TOKEN", "sys-abc"),
            ("CLASSHUB_HOST", ""),
        ]);
        let mut settings = ClassHubSettings::default();
        apply_overrides_from(&mut settings, |k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.outbound_queue, 256);
        assert!(settings.logging.sqlite_sink);
        assert!(settings.logging.json);
        assert_eq!(settings.services.system_token, "sys-abc");
        assert_eq!(settings.server.host, "0.0.0.0");
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("2"), None);
        assert_eq!(parse_u16_range("0", 1, 10), None);
        assert_eq!(parse_u64_range("500", 100, 600), Some(500));
        assert_eq!(parse_usize_range("x", 1, 2), None);
    }
}
