//! Settings loading.
//!
//! Three layers, later ones winning: compiled [`ReefSettings::default()`],
//! the user file at [`settings_path`], and `REEF_*` environment variables.
//! The finished value is validated before it is returned.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::ReefSettings;

/// `$HOME/.reef/settings.json`, under the temp dir when `HOME` is unset.
pub fn settings_path() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(std::env::temp_dir, PathBuf::from)
        .join(".reef")
        .join("settings.json")
}

/// Settings from the user file and the process environment.
pub fn load_settings() -> Result<ReefSettings> {
    load_settings_with(&settings_path(), |key| std::env::var(key).ok())
}

/// Settings from `path` and the process environment.
pub fn load_settings_from_path(path: &Path) -> Result<ReefSettings> {
    load_settings_with(path, |key| std::env::var(key).ok())
}

/// Settings from `path`, with `REEF_*` variables resolved through `lookup`.
///
/// An absent file contributes nothing. An unreadable or malformed one is
/// an error, and so is a result that fails [`validate`].
pub fn load_settings_with<F>(path: &Path, lookup: F) -> Result<ReefSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let mut layered = serde_json::to_value(ReefSettings::default())?;
    match std::fs::read_to_string(path) {
        Ok(content) => {
            debug!(path = %path.display(), "overlaying settings file");
            overlay(&mut layered, serde_json::from_str(&content)?);
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file");
        }
        Err(e) => return Err(e.into()),
    }

    let mut settings: ReefSettings = serde_json::from_value(layered)?;
    apply_overrides(&mut settings, lookup);
    validate(&settings)?;
    Ok(settings)
}

/// Write `layer` over `base` in place.
///
/// Objects are combined key by key. Any other value replaces what was
/// there, except `null`, which leaves it alone.
pub fn overlay(base: &mut Value, layer: Value) {
    match (base, layer) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(layer_map)) => {
            for (key, value) in layer_map {
                match base_map.get_mut(&key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        let _ = base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Reject values the engine cannot run with.
pub fn validate(settings: &ReefSettings) -> Result<()> {
    if settings.database.url.trim().is_empty() {
        return Err(SettingsError::InvalidValue("database.url is empty".into()));
    }
    if settings.database.pool_size == 0 {
        return Err(SettingsError::InvalidValue(
            "database.poolSize must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Apply `REEF_*` overrides read through `lookup`.
///
/// Unparseable values are logged and skipped.
pub fn apply_overrides<F>(settings: &mut ReefSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let read = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if let Some(v) = read("REEF_DATABASE_URL") {
        settings.database.url = v;
    }
    if let Some(v) = read("REEF_ECHO") {
        match parse_bool(&v) {
            Some(b) => settings.database.echo = b,
            None => warn!(key = "REEF_ECHO", value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = read("REEF_POOL_SIZE") {
        match parse_u32_range(&v, 1, 64) {
            Some(n) => settings.database.pool_size = n,
            None => warn!(key = "REEF_POOL_SIZE", value = %v, "invalid pool size, ignoring"),
        }
    }
    if let Some(v) = read("REEF_BUSY_TIMEOUT_MS") {
        match parse_u32_range(&v, 0, 600_000) {
            Some(n) => settings.database.busy_timeout_ms = n,
            None => warn!(key = "REEF_BUSY_TIMEOUT_MS", value = %v, "invalid timeout, ignoring"),
        }
    }
    if let Some(v) = read("REEF_AUTOFLUSH") {
        match parse_bool(&v) {
            Some(b) => settings.session.autoflush = b,
            None => warn!(key = "REEF_AUTOFLUSH", value = %v, "invalid boolean env var, ignoring"),
        }
    }
    if let Some(v) = read("REEF_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("REEF_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.logging.json = b,
            None => warn!(key = "REEF_LOG_JSON", value = %v, "invalid boolean env var, ignoring"),
        }
    }
}

/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, case-insensitive.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u32` within `min..=max`.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}
