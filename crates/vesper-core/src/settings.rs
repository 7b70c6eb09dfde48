//! Client settings with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`VesperSettings::default()`]
//! 2. If `~/.vesper/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `VESPER_*` environment overrides (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

/// Errors that can occur when loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct VesperSettings {
    pub api: ApiSettings,
    pub transport: TransportSettings,
    pub session: SessionSettings,
    pub realtime: RealtimeSettings,
    pub bootstrap: BootstrapSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSettings {
    pub origin: String,
    pub identity_path: String,
    pub refresh_path: String,
    pub logout_path: String,
    pub health_path: String,
    pub request_timeout_ms: u64,
    /// Backend can refresh from an http-only cookie without a stored refresh token.
    pub cookie_refresh: bool,
    /// SQLite credential file. `None` keeps credentials in memory only.
    pub credentials_path: Option<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            origin: "http://localhost:8000".into(),
            identity_path: "/v1/whoami".into(),
            refresh_path: "/v1/auth/refresh".into(),
            logout_path: "/v1/auth/logout".into(),
            health_path: "/healthz".into(),
            request_timeout_ms: 10_000,
            cookie_refresh: true,
            credentials_path: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    pub max_server_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    pub default_retry_after_ms: u64,
    pub max_retry_after_ms: u64,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_server_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_factor: 0.2,
            default_retry_after_ms: 1_000,
            max_retry_after_ms: 30_000,
            breaker_threshold: 3,
            breaker_cooldown_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub check_timeout_ms: u64,
    pub guard_ttl_ms: u64,
    pub oscillation_window_ms: u64,
    pub oscillation_threshold: u32,
    pub oscillation_cooldown_ms: u64,
    /// Used when a 429 carries neither Retry-After nor a reset header.
    pub rate_limit_fallback_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            check_timeout_ms: 8_000,
            guard_ttl_ms: 60_000,
            oscillation_window_ms: 10_000,
            oscillation_threshold: 4,
            oscillation_cooldown_ms: 30_000,
            rate_limit_fallback_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    pub max_queue: usize,
    /// Append the access token as `?token=` when header auth is active.
    pub legacy_token_query: bool,
    pub topics: Vec<TopicSettings>,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.15,
            max_queue: 256,
            legacy_token_query: false,
            topics: vec![
                TopicSettings {
                    name: "music".into(),
                    path: "/v1/ws/music".into(),
                    subscribe: Some(json!({"type": "subscribe", "topic": "music"})),
                },
                TopicSettings {
                    name: "care".into(),
                    path: "/v1/ws/care".into(),
                    subscribe: None,
                },
            ],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TopicSettings {
    pub name: String,
    pub path: String,
    /// Handshake sent before anything else on every open.
    #[serde(default)]
    pub subscribe: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BootstrapSettings {
    pub health_poll_interval_ms: u64,
    pub health_timeout_ms: u64,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            health_poll_interval_ms: 15_000,
            health_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

/// Resolve the path to the settings file (`~/.vesper/settings.json`).
pub fn settings_path() -> PathBuf {
    vesper_home().join("settings.json")
}

/// `~/.vesper`, falling back to `/tmp/.vesper` without a home directory.
pub fn vesper_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".vesper")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<VesperSettings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<VesperSettings, SettingsError> {
    let defaults = serde_json::to_value(VesperSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: VesperSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, nulls in
/// `source` are skipped.
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

/// Apply `VESPER_*` environment overrides. Invalid values are ignored.
pub fn apply_env_overrides(settings: &mut VesperSettings) {
    apply_overrides_with(settings, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup.
pub fn apply_overrides_with<F>(settings: &mut VesperSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |name: &str| -> Option<String> { lookup(name).filter(|v| !v.is_empty()) };
    let number = |name: &str, min: u64, max: u64| -> Option<u64> {
        let raw = lookup(name)?;
        let parsed = parse_u64_range(&raw, min, max);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %raw, "invalid numeric env var, ignoring");
        }
        parsed
    };

    if let Some(v) = string("VESPER_API_ORIGIN") {
        settings.api.origin = v;
    }
    if let Some(v) = string("VESPER_CREDENTIALS_PATH") {
        settings.api.credentials_path = Some(v);
    }
    if let Some(v) = number("VESPER_REQUEST_TIMEOUT_MS", 100, 600_000) {
        settings.api.request_timeout_ms = v;
    }
    if let Some(v) = number("VESPER_BREAKER_THRESHOLD", 1, 1_000) {
        settings.transport.breaker_threshold = v as u32;
    }
    if let Some(v) = number("VESPER_BREAKER_COOLDOWN_MS", 100, 3_600_000) {
        settings.transport.breaker_cooldown_ms = v;
    }
    if let Some(v) = number("VESPER_REALTIME_MAX_DELAY_MS", 100, 3_600_000) {
        settings.realtime.max_delay_ms = v;
    }
    if let Some(v) = string("VESPER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(raw) = lookup("VESPER_LOG_JSON") {
        match parse_bool(&raw) {
            Some(v) => settings.logging.json = v,
            None => tracing::warn!(value = %raw, "invalid boolean VESPER_LOG_JSON, ignoring"),
        }
    }
}

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Longest wait any setting can express (one week).
pub const MAX_WAIT_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// A millisecond setting as a [`Duration`], clamped to [`MAX_WAIT_MS`] so
/// deadlines built from it stay representable.
pub fn clamped_millis(ms: u64) -> Duration {
    Duration::from_millis(ms.min(MAX_WAIT_MS))
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn waits_are_clamped() {
        assert_eq!(clamped_millis(1_500), Duration::from_millis(1_500));
        assert_eq!(clamped_millis(u64::MAX), Duration::from_millis(MAX_WAIT_MS));
    }

    #[test]
    fn merge_nested_override() {
        let target = json!({"api": {"origin": "a", "healthPath": "/h"}});
        let source = json!({"api": {"origin": "b"}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["api"]["origin"], "b");
        assert_eq!(merged["api"]["healthPath"], "/h");
    }

    #[test]
    fn merge_skips_nulls_and_replaces_arrays() {
        let target = json!({"a": 1, "list": [1, 2, 3]});
        let source = json!({"a": null, "list": [9]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["list"], json!([9]));
    }

    #[test]
    fn defaults_have_two_topics() {
        let settings = VesperSettings::default();
        let names: Vec<_> = settings.realtime.topics.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["music", "care"]);
        assert!(settings.realtime.topics[0].subscribe.is_some());
        assert!(settings.realtime.topics[1].subscribe.is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = PathBuf::from("/nonexistent/vesper/settings.json");
        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.transport.breaker_threshold, 3);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = std::env::temp_dir().join(format!("vesper-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(
            &path,
            r#"{"api": {"origin": "https://assistant.example"}, "session": {"guardTtlMs": 5000}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.session.guard_ttl_ms, 5000);
        assert_eq!(settings.session.check_timeout_ms, 8_000);
        assert_eq!(settings.api.identity_path, "/v1/whoami");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = std::env::temp_dir().join(format!("vesper-settings-bad-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::Json(_))
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("VESPER_API_ORIGIN", "https://tv.local"),
            ("VESPER_BREAKER_THRESHOLD", "5"),
            ("VESPER_BREAKER_COOLDOWN_MS", "not-a-number"),
            ("VESPER_LOG_JSON", "yes"),
        ]);
        let mut settings = VesperSettings::default();
        apply_overrides_with(&mut settings, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.api.origin, "https://tv.local");
        assert_eq!(settings.transport.breaker_threshold, 5);
        assert_eq!(settings.transport.breaker_cooldown_ms, 30_000);
        assert!(settings.logging.json);
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_u64_range("10", 1, 5), None);
        assert_eq!(parse_u64_range("3", 1, 5), Some(3));
    }
}
