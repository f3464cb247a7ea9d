//! Layered settings resolution.
//!
//! Compiled defaults are serialized to JSON, the user file (if any) is
//! overlaid key by key, `LOOM_*` variables are applied on top, and the
//! result is validated. Overlay rules: objects recurse, anything else in the
//! user file replaces the default wholesale, and `null` leaves the default
//! in place.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::LoomSettings;

fn loom_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
        .join(".loom")
}

/// `~/.loom/settings.json`.
pub fn settings_path() -> PathBuf {
    loom_dir().join("settings.json")
}

/// Configured database file, or `~/.loom/loom.db` when none is set.
pub fn database_path(settings: &LoomSettings) -> PathBuf {
    match settings.storage.database_path.as_str() {
        "" => loom_dir().join("loom.db"),
        configured => PathBuf::from(configured),
    }
}

/// [`load_settings_from_path`] on [`settings_path`].
pub fn load_settings() -> Result<LoomSettings> {
    load_settings_from_path(&settings_path())
}

/// Resolve settings with `path` as the user layer.
///
/// A missing file is not an error; an unreadable or malformed one is.
pub fn load_settings_from_path(path: &Path) -> Result<LoomSettings> {
    let mut document = serde_json::to_value(LoomSettings::default())?;

    match std::fs::read_to_string(path) {
        Ok(text) => {
            debug!(path = %path.display(), "overlaying settings file");
            let user: Value = serde_json::from_str(&text)?;
            document = deep_merge(document, user);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file, using defaults");
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    let mut settings: LoomSettings = serde_json::from_value(document)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Overlay `overlay` onto `base` using the module's merge rules.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => Value::Object(merge_maps(base, overlay)),
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

fn merge_maps(mut base: Map<String, Value>, overlay: Map<String, Value>) -> Map<String, Value> {
    for (key, value) in overlay {
        let merged = match base.remove(&key) {
            Some(existing) => deep_merge(existing, value),
            None if value.is_null() => continue,
            None => value,
        };
        let _ = base.insert(key, merged);
    }
    base
}

/// Reject settings the store cannot run with.
pub fn validate(settings: &LoomSettings) -> Result<()> {
    let invalid = |field, reason| Err(SettingsError::Invalid { field, reason });
    if settings.storage.pool_size == 0 {
        return invalid("storage.poolSize", "must be at least 1");
    }
    if settings.cache.max_conversations == 0 {
        return invalid("cache.maxConversations", "must be at least 1");
    }
    if settings.compaction.enabled && settings.compaction.interval_secs == 0 {
        return invalid("compaction.intervalSecs", "must be positive while compaction is enabled");
    }
    if settings.compaction.min_events < 1 {
        return invalid("compaction.minEvents", "must be at least 1");
    }
    Ok(())
}

/// Apply `LOOM_*` environment overrides. Unparseable values are logged and
/// skipped.
pub fn apply_env_overrides(settings: &mut LoomSettings) {
    let storage = &mut settings.storage;
    if let Some(v) = env_string("LOOM_DB_PATH") {
        storage.database_path = v;
    }
    if let Some(v) = env_in_range("LOOM_POOL_SIZE", 1..=256) {
        storage.pool_size = v;
    }
    if let Some(v) = env_in_range("LOOM_BUSY_TIMEOUT_MS", 0..=600_000) {
        storage.busy_timeout_ms = v;
    }

    if let Some(v) = env_in_range("LOOM_CACHE_CAPACITY", 1..=100_000) {
        settings.cache.max_conversations = v;
    }

    let compaction = &mut settings.compaction;
    if let Some(v) = env_flag("LOOM_COMPACTION_ENABLED") {
        compaction.enabled = v;
    }
    if let Some(v) = env_in_range("LOOM_COMPACTION_INTERVAL_SECS", 1..=604_800) {
        compaction.interval_secs = v;
    }
    if let Some(v) = env_in_range("LOOM_COMPACTION_MIN_EVENTS", 1..=10_000_000) {
        compaction.min_events = v;
    }
    if let Some(v) = env_flag("LOOM_COMPACTION_STRIP_DEBUG") {
        compaction.strip_debug_payloads = v;
    }

    if let Some(v) = env_string("LOOM_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env_flag("LOOM_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Interpret a flag value: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`,
/// any case.
pub fn parse_flag(raw: &str) -> Option<bool> {
    const ON: [&str; 4] = ["true", "1", "yes", "on"];
    const OFF: [&str; 4] = ["false", "0", "no", "off"];
    let raw = raw.trim();
    if ON.iter().any(|v| raw.eq_ignore_ascii_case(v)) {
        Some(true)
    } else if OFF.iter().any(|v| raw.eq_ignore_ascii_case(v)) {
        Some(false)
    } else {
        None
    }
}

/// Parse `raw` as a `T` and keep it only if it lies in `bounds`.
pub fn parse_in_range<T: FromStr + PartialOrd>(raw: &str, bounds: &RangeInclusive<T>) -> Option<T> {
    raw.trim().parse().ok().filter(|n| bounds.contains(n))
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T>(name: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!(key = name, value = %raw, "ignoring unusable environment override");
    }
    parsed
}

fn env_flag(name: &str) -> Option<bool> {
    env_parsed(name, parse_flag)
}

fn env_in_range<T: FromStr + PartialOrd>(name: &str, bounds: RangeInclusive<T>) -> Option<T> {
    env_parsed(name, |raw| parse_in_range(raw, &bounds))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
