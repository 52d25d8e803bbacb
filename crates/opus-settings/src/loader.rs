//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`GatewaySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `OPUS_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{ChatPolicy, GatewaySettings, LogFormat, LogLevel};

/// Resolve the settings file path.
///
/// `$OPUS_HOME/settings.json` when `OPUS_HOME` is set, otherwise
/// `~/.opus/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(home) = std::env::var_os("OPUS_HOME") {
        return PathBuf::from(home).join("settings.json");
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".opus").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<GatewaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. A file that exists but cannot be read or
/// parsed is an error.
pub fn load_settings_from_path(path: &Path) -> Result<GatewaySettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<GatewaySettings> {
    let defaults = serde_json::to_value(GatewaySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
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
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `OPUS_*` environment variable overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut GatewaySettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable source.
///
/// Invalid values are ignored with a warning and leave the file/default
/// value in place.
pub fn apply_overrides_from<F>(settings: &mut GatewaySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("OPUS_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("OPUS_PORT") {
        match v.parse::<u16>() {
            Ok(port) => settings.server.port = port,
            Err(_) => warn!(key = "OPUS_PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("OPUS_OUTBOUND_CAPACITY") {
        match parse_usize_range(&v, 1, 1_000_000) {
            Some(n) => settings.server.outbound_capacity = n,
            None => warn!(key = "OPUS_OUTBOUND_CAPACITY", value = %v, "invalid capacity env var, ignoring"),
        }
    }
    if let Some(v) = read("OPUS_MAX_MESSAGE_SIZE") {
        match parse_usize_range(&v, 64, 256 * 1024 * 1024) {
            Some(n) => settings.server.max_message_size = n,
            None => warn!(key = "OPUS_MAX_MESSAGE_SIZE", value = %v, "invalid size env var, ignoring"),
        }
    }
    if let Some(v) = read("OPUS_HEARTBEAT_INTERVAL_MS") {
        match parse_u64_range(&v, 100, 600_000) {
            Some(n) => settings.server.heartbeat_interval_ms = n,
            None => warn!(key = "OPUS_HEARTBEAT_INTERVAL_MS", value = %v, "invalid interval env var, ignoring"),
        }
    }
    if let Some(v) = read("OPUS_ALLOWED_ORIGINS") {
        settings.server.allowed_origins = parse_list(&v);
    }
    if let Some(v) = read("OPUS_CHAT_POLICY") {
        match parse_enum::<ChatPolicy>(&v) {
            Some(policy) => settings.server.chat_policy = policy,
            None => warn!(key = "OPUS_CHAT_POLICY", value = %v, "unknown chat policy, ignoring"),
        }
    }
    if let Some(v) = read("OPUS_LOG_LEVEL") {
        match parse_enum::<LogLevel>(&v.to_lowercase()) {
            Some(level) => settings.logging.level = level,
            None => warn!(key = "OPUS_LOG_LEVEL", value = %v, "unknown log level, ignoring"),
        }
    }
    if let Some(v) = read("OPUS_LOG_FORMAT") {
        match parse_enum::<LogFormat>(&v.to_lowercase()) {
            Some(format) => settings.logging.format = format,
            None => warn!(key = "OPUS_LOG_FORMAT", value = %v, "unknown log format, ignoring"),
        }
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Split a comma separated list, trimming entries and dropping blanks.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_enum<T: serde::de::DeserializeOwned>(val: &str) -> Option<T> {
    serde_json::from_value(Value::String(val.trim().to_string())).ok()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::errors::SettingsError;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override_keeps_siblings() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "0.0.0.0"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_array_replaced_not_concatenated() {
        let target = serde_json::json!({"allowedOrigins": ["a", "b"]});
        let source = serde_json::json!({"allowedOrigins": ["c"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["allowedOrigins"], serde_json::json!(["c"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1});
        let source = serde_json::json!({"a": null});
        assert_eq!(deep_merge(target, source)["a"], 1);
    }

    // ── load_settings_from_path ─────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let settings = load_file_layer(Path::new("/nonexistent/opus/settings.json")).unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.outbound_capacity, 256);
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9191, "allowedOrigins": ["https://store.example"]}, "logging": {"format": "json"}}"#,
        )
        .unwrap();

        let settings = load_file_layer(&path).unwrap();
        assert_eq!(settings.server.port, 9191);
        assert_eq!(settings.server.allowed_origins, vec!["https://store.example"]);
        assert_eq!(settings.server.outbound_capacity, 256);
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert_eq!(settings.logging.level, LogLevel::Info);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "server = 1").unwrap();

        let err = load_file_layer(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn wrong_type_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": "eighty"}}"#).unwrap();

        assert!(load_file_layer(&path).is_err());
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_applied() {
        let mut settings = GatewaySettings::default();
        apply_overrides_from(
            &mut settings,
            env(&[
                ("OPUS_HOST", "127.0.0.1"),
                ("OPUS_PORT", "7000"),
                ("OPUS_OUTBOUND_CAPACITY", "32"),
                ("OPUS_ALLOWED_ORIGINS", "https://a.example, https://b.example ,"),
                ("OPUS_CHAT_POLICY", "membersOnly"),
                ("OPUS_LOG_LEVEL", "DEBUG"),
                ("OPUS_LOG_FORMAT", "json"),
            ]),
        );
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 7000);
        assert_eq!(settings.server.outbound_capacity, 32);
        assert_eq!(
            settings.server.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert_eq!(settings.server.chat_policy, ChatPolicy::MembersOnly);
        assert_eq!(settings.logging.level, LogLevel::Debug);
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut settings = GatewaySettings::default();
        apply_overrides_from(
            &mut settings,
            env(&[
                ("OPUS_PORT", "99999"),
                ("OPUS_OUTBOUND_CAPACITY", "0"),
                ("OPUS_CHAT_POLICY", "closed"),
                ("OPUS_LOG_LEVEL", "loud"),
            ]),
        );
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.outbound_capacity, 256);
        assert_eq!(settings.server.chat_policy, ChatPolicy::Open);
        assert_eq!(settings.logging.level, LogLevel::Info);
    }

    #[test]
    fn empty_env_value_ignored() {
        let mut settings = GatewaySettings::default();
        apply_overrides_from(&mut settings, env(&[("OPUS_HOST", "")]));
        assert_eq!(settings.server.host, "0.0.0.0");
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u64_range("500", 100, 1000), Some(500));
        assert_eq!(parse_u64_range("50", 100, 1000), None);
        assert_eq!(parse_usize_range(" 12 ", 1, 100), Some(12));
        assert_eq!(parse_usize_range("abc", 1, 100), None);
    }

    #[test]
    fn parse_list_drops_blanks() {
        assert_eq!(parse_list(" a ,, b"), vec!["a", "b"]);
        assert!(parse_list(" , ").is_empty());
    }
}
