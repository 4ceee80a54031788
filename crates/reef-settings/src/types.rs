//! Settings value types.
//!
//! All structs serialize as camelCase and fill missing keys from
//! [`Default`], so a partial `settings.json` is always valid.

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReefSettings {
    /// Database target and pool options.
    pub database: DatabaseSettings,
    /// Unit-of-work behaviour.
    pub session: SessionSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// Database target and engine options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// Target string, e.g. `sqlite+pysqlite:///:memory:`.
    pub url: String,
    /// Log every emitted statement at INFO.
    pub echo: bool,
    /// Maximum pooled connections for file databases.
    pub pool_size: u32,
    /// `SQLite` busy timeout.
    pub busy_timeout_ms: u32,
    /// How long a checkout waits for a free connection.
    pub connection_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite+pysqlite:///:memory:".to_string(),
            echo: false,
            pool_size: 5,
            busy_timeout_ms: 5_000,
            connection_timeout_secs: 5,
        }
    }
}

/// Session defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Flush pending changes before queries.
    pub autoflush: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { autoflush: true }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
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
    fn defaults() {
        let s = ReefSettings::default();
        assert_eq!(s.database.url, "sqlite+pysqlite:///:memory:");
        assert!(!s.database.echo);
        assert_eq!(s.database.pool_size, 5);
        assert!(s.session.autoflush);
        assert_eq!(s.logging.level, "info");
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(ReefSettings::default()).unwrap();
        assert_eq!(json["database"]["poolSize"], 5);
        assert_eq!(json["database"]["busyTimeoutMs"], 5000);
        assert!(json["database"].get("pool_size").is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: ReefSettings =
            serde_json::from_str(r#"{"database": {"echo": true}}"#).unwrap();
        assert!(s.database.echo);
        assert_eq!(s.database.pool_size, 5);
        assert!(s.session.autoflush);
    }
}
