//! Settings loading: compiled defaults, then `~/.linkup/settings.json`
//! deep-merged on top, then `LINKUP_*` environment overrides.
//!
//! Merge rules: objects merge per key, arrays and primitives are replaced,
//! `null` in the user file keeps the default.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::LinkupSettings;

/// Path of the user settings file (`~/.linkup/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".linkup").join("settings.json")
}

/// Load settings from the default path.
pub fn load_settings() -> Result<LinkupSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path`, applying environment overrides.
///
/// A missing file yields defaults; an unreadable or malformed file is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LinkupSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

/// Defaults merged with the file at `path`, without environment overrides.
pub fn read_settings_file(path: &Path) -> Result<LinkupSettings> {
    let defaults = serde_json::to_value(LinkupSettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "no settings file, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Recursively merge `source` into `target`.
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

/// Apply `LINKUP_*` overrides read through `lookup`.
///
/// Out-of-range or unparsable values are logged and ignored.
pub fn apply_env_overrides<F>(settings: &mut LinkupSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.list("LINKUP_ENDPOINTS") {
        settings.server.endpoints = v;
    }
    if let Some(v) = env.string("LINKUP_CERTIFICATE") {
        settings.server.certificate_path = Some(v);
    }
    if let Some(v) = env.string("LINKUP_PRIVATE_KEY") {
        settings.server.private_key_path = Some(v);
    }
    if let Some(v) = env.list("LINKUP_ALLOWED_DOMAINS") {
        settings.server.allowed_domains = v;
    }
    if let Some(v) = env.u64("LINKUP_AUTH_TIMEOUT_MS", 0, 3_600_000) {
        settings.server.authentication_timeout_ms = v;
    }
    if let Some(v) = env.u64("LINKUP_SESSION_TIMEOUT_MS", 0, 86_400_000) {
        settings.server.session_timeout_ms = v;
    }
    if let Some(v) = env.u64("LINKUP_LONG_POLL_INACTIVITY_MS", 500, 600_000) {
        settings.server.long_poll_inactivity_ms = v;
    }
    if let Some(v) = env.u16("LINKUP_METRICS_PORT", 1, 65535) {
        settings.server.metrics_port = Some(v);
    }
    if let Some(v) = env.u64("LINKUP_POLL_INTERVAL_MS", 10, 60_000) {
        settings.client.poll_interval_ms = v;
    }
    if let Some(v) = env.string("LINKUP_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing helpers ────────────────────────────────────────────────────

/// Parse a `u16` within `[min, max]`.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a `u64` within `[min, max]`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Split a comma-separated list, dropping empty items.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn list(&self, name: &str) -> Option<Vec<String>> {
        let items = parse_list(&self.string(name)?);
        (!items.is_empty()).then_some(items)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let parsed = parse_u16_range(&val, min, max);
        if parsed.is_none() {
            warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        parsed
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn merge_nested_override() {
        let merged = deep_merge(
            serde_json::json!({"server": {"a": 1, "b": 2}}),
            serde_json::json!({"server": {"b": 3}}),
        );
        assert_eq!(merged, serde_json::json!({"server": {"a": 1, "b": 3}}));
    }

    #[test]
    fn merge_null_keeps_target_and_arrays_replace() {
        let merged = deep_merge(
            serde_json::json!({"a": 1, "list": [1, 2, 3]}),
            serde_json::json!({"a": null, "list": [9]}),
        );
        assert_eq!(merged, serde_json::json!({"a": 1, "list": [9]}));
    }

    #[test]
    fn missing_file_returns_defaults() {
        let settings = read_settings_file(Path::new("/nonexistent/linkup/settings.json")).unwrap();
        assert_eq!(settings, LinkupSettings::default());
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"endpoints": ["ws://0.0.0.0:5652/"], "allowedDomains": ["tests"]}}"#,
        )
        .unwrap();

        let settings = read_settings_file(&path).unwrap();
        assert_eq!(settings.server.endpoints, vec!["ws://0.0.0.0:5652/"]);
        assert_eq!(settings.server.allowed_domains, vec!["tests"]);
        assert_eq!(settings.server.long_poll_inactivity_ms, 5_000);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(read_settings_file(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let mut settings = LinkupSettings::default();
        apply_env_overrides(
            &mut settings,
            env(&[
                ("LINKUP_ENDPOINTS", "tcp://0.0.0.0:1/, ws://0.0.0.0:2/"),
                ("LINKUP_AUTH_TIMEOUT_MS", "0"),
                ("LINKUP_METRICS_PORT", "9100"),
                ("LINKUP_LOG_LEVEL", "debug"),
            ]),
        );
        assert_eq!(settings.server.endpoints, vec!["tcp://0.0.0.0:1/", "ws://0.0.0.0:2/"]);
        assert_eq!(settings.server.authentication_timeout_ms, 0);
        assert_eq!(settings.server.metrics_port, Some(9100));
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut settings = LinkupSettings::default();
        apply_env_overrides(
            &mut settings,
            env(&[
                ("LINKUP_METRICS_PORT", "0"),
                ("LINKUP_LONG_POLL_INACTIVITY_MS", "abc"),
                ("LINKUP_ENDPOINTS", " , "),
                ("LINKUP_LOG_LEVEL", ""),
            ]),
        );
        assert_eq!(settings, LinkupSettings::default());
    }

    #[test]
    fn range_parsers() {
        assert_eq!(parse_u16_range("65535", 1, 65535), Some(65535));
        assert_eq!(parse_u16_range("99999", 1, 65535), None);
        assert_eq!(parse_u64_range(" 500 ", 500, 600), Some(500));
        assert_eq!(parse_u64_range("499", 500, 600), None);
        assert_eq!(parse_list("a,,b"), vec!["a", "b"]);
    }
}
