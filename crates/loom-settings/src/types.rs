//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a partial
//! JSON file only needs the keys it overrides.

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "storage": { "databasePath": "/var/lib/loom/loom.db" },
///   "compaction": { "minEvents": 5000 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoomSettings {
    /// Settings schema version.
    pub version: String,
    /// Database location and connection pool tuning.
    pub storage: StorageSettings,
    /// Materialized conversation cache.
    pub cache: CacheSettings,
    /// Event log compaction.
    pub compaction: CompactionSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl Default for LoomSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            storage: StorageSettings::default(),
            cache: CacheSettings::default(),
            compaction: CompactionSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// `SQLite` database settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// Path to the database file. Empty means `~/.loom/loom.db`.
    pub database_path: String,
    /// Maximum pooled connections.
    pub pool_size: u32,
    /// `SQLite` busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Page cache size in KiB.
    pub cache_size_kib: i64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: String::new(),
            pool_size: 16,
            busy_timeout_ms: 30_000,
            cache_size_kib: 8192,
        }
    }
}

/// Conversation cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Maximum number of materialized conversations kept in memory.
    pub max_conversations: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_conversations: 256,
        }
    }
}

/// Event log compaction settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompactionSettings {
    /// Run the background compaction task.
    pub enabled: bool,
    /// Seconds between background sweeps.
    pub interval_secs: u64,
    /// Conversations with fewer logged events are skipped.
    pub min_events: i64,
    /// Drop raw provider debug payloads instead of keeping them.
    pub strip_debug_payloads: bool,
    /// Attachments and debug payloads larger than this move to the blob store.
    /// Zero disables externalization.
    pub externalize_threshold_bytes: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 3600,
            min_events: 2000,
            strip_debug_payloads: false,
            externalize_threshold_bytes: 64 * 1024,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let settings: LoomSettings =
            serde_json::from_str(r#"{"storage": {"poolSize": 4}}"#).unwrap();
        assert_eq!(settings.storage.pool_size, 4);
        assert_eq!(settings.storage.busy_timeout_ms, 30_000);
        assert_eq!(settings.cache.max_conversations, 256);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(LoomSettings::default()).unwrap();
        assert!(json["compaction"].get("externalizeThresholdBytes").is_some());
        assert!(json["storage"].get("databasePath").is_some());
    }
}
