//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`PrlensSettings::default()`]
//! 2. If `~/.prlens/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `PRLENS_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::PrlensSettings;

/// Resolve the path to the settings file (`~/.prlens/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".prlens").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<PrlensSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid override is an error.
pub fn load_settings_from_path(path: &Path) -> Result<PrlensSettings> {
    load_settings_with(path, |key| std::env::var(key).ok())
}

/// [`load_settings_from_path`] with an explicit environment lookup.
pub fn load_settings_with<F>(path: &Path, env: F) -> Result<PrlensSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(PrlensSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: PrlensSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env)?;
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
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PRLENS_*` overrides read through `env`.
///
/// Empty values are treated as unset. Unparseable values are errors.
pub fn apply_env_overrides<F>(settings: &mut PrlensSettings, env: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let read = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = read("PRLENS_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("PRLENS_PORT") {
        settings.server.port = parse_range("PRLENS_PORT", &v, 1, u16::MAX)?;
    }
    if let Some(v) = read("PRLENS_UPSTREAM_URL") {
        settings.upstream.base_url = v.trim_end_matches('/').to_string();
    }
    if let Some(v) = read("PRLENS_UPSTREAM_DIRECTORY") {
        settings.upstream.directory = Some(v);
    }
    if let Some(v) = read("PRLENS_QUEUE_CAPACITY") {
        settings.router.queue_capacity = parse_range("PRLENS_QUEUE_CAPACITY", &v, 1, 1_000_000)?;
    }
    if let Some(v) = read("PRLENS_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("PRLENS_LOG_JSON") {
        settings.logging.json = parse_bool(&v).ok_or_else(|| SettingsError::InvalidEnv {
            key: "PRLENS_LOG_JSON".into(),
            value: v.clone(),
            reason: "expected true/false/1/0/yes/no/on/off".into(),
        })?;
    }
    Ok(())
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_range<T>(key: &str, val: &str, min: T, max: T) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    val.trim()
        .parse::<T>()
        .ok()
        .filter(|n| *n >= min && *n <= max)
        .ok_or_else(|| SettingsError::InvalidEnv {
            key: key.to_string(),
            value: val.to_string(),
            reason: format!("expected an integer in {min}..={max}"),
        })
}
