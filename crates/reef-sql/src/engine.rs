//! Process-wide engine: a parsed target plus an `r2d2` pool.
//!
//! Building an engine opens nothing. The first checkout opens the first
//! physical connection, and [`PragmaCustomizer`] prepares every new one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use reef_settings::DatabaseSettings;
use tracing::{info, instrument, warn};

use crate::connection::Connection;
use crate::errors::{DbError, Result};
use crate::url::{DatabaseUrl, Location};

/// Pool type behind an [`Engine`].
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// A connection checked out of the pool.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Engine construction options.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Log every statement at INFO instead of DEBUG.
    pub echo: bool,
    /// Pool ceiling for file databases. In-memory targets always use one.
    pub pool_size: u32,
    /// `SQLite` busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// How long a checkout waits for a free connection.
    pub connection_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&DatabaseSettings::default())
    }
}

impl From<&DatabaseSettings> for EngineOptions {
    fn from(settings: &DatabaseSettings) -> Self {
        Self {
            echo: settings.echo,
            pool_size: settings.pool_size.max(1),
            busy_timeout_ms: settings.busy_timeout_ms,
            connection_timeout: Duration::from_secs(settings.connection_timeout_secs.max(1)),
        }
    }
}

#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u32,
    wal: bool,
}

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA foreign_keys = ON;\
             PRAGMA busy_timeout = {};",
            self.busy_timeout_ms
        ))?;
        if self.wal {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        }
        Ok(())
    }
}

/// Handle to one database target. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Engine {
    url: Arc<DatabaseUrl>,
    pool: ConnectionPool,
    echo: bool,
}

/// Parse `url` and build an engine with default options.
pub fn create_engine(url: &str) -> Result<Engine> {
    Engine::create(url, EngineOptions::default())
}

impl Engine {
    /// Parse `url` and build the pool. Does not connect.
    #[instrument(skip(options), fields(echo = options.echo))]
    pub fn create(url: &str, options: EngineOptions) -> Result<Self> {
        let parsed = DatabaseUrl::parse(url)?;

        let (manager, max_size, wal) = match &parsed.location {
            Location::Memory => (SqliteConnectionManager::memory(), 1, false),
            Location::File(path) => (SqliteConnectionManager::file(path), options.pool_size.max(1), true),
        };

        let mut builder = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(0))
            .connection_timeout(options.connection_timeout)
            .connection_customizer(Box::new(PragmaCustomizer {
                busy_timeout_ms: options.busy_timeout_ms,
                wal,
            }));
        if parsed.is_memory() {
            // The single connection *is* the database; it must never be reaped.
            builder = builder.idle_timeout(None).max_lifetime(None);
        }
        let pool = builder.build_unchecked(manager);

        info!(url = %parsed, max_size, "engine created");
        Ok(Self {
            url: Arc::new(parsed),
            pool,
            echo: options.echo,
        })
    }

    /// Build from the `database` settings section.
    pub fn from_settings(settings: &DatabaseSettings) -> Result<Self> {
        Self::create(&settings.url, EngineOptions::from(settings))
    }

    /// Check out a connection. The physical connection returns to the pool
    /// when the [`Connection`] drops.
    pub fn connect(&self) -> Result<Connection> {
        let conn = self.pool.get()?;
        Ok(Connection::new(conn, self.echo))
    }

    /// Run `f` in a transaction: COMMIT on `Ok`, ROLLBACK on `Err`.
    pub fn begin<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Connection) -> std::result::Result<T, E>,
        E: From<DbError>,
    {
        let mut conn = self.connect()?;
        conn.begin()?;
        match f(&mut conn) {
            Ok(value) => {
                conn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = conn.rollback() {
                    warn!(error = %rb, "rollback after failed block also failed");
                }
                Err(e)
            }
        }
    }

    /// Whether a table named `name` exists.
    pub fn has_table(&self, name: &str) -> Result<bool> {
        let conn = self.connect()?;
        let count: i64 = conn.raw().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// User table names, sorted.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.raw().prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    /// The parsed target.
    pub fn url(&self) -> &DatabaseUrl {
        &self.url
    }

    /// Whether statements are echoed at INFO.
    pub fn echo(&self) -> bool {
        self.echo
    }

    /// Pool ceiling.
    pub fn pool_size(&self) -> u32 {
        self.pool.max_size()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("url", &self.url.to_string())
            .field("pool_size", &self.pool.max_size())
            .field("echo", &self.echo)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::statement::text;

    #[test]
    fn memory_engine_uses_one_connection() {
        let engine = create_engine("sqlite+pysqlite:///:memory:").unwrap();
        assert_eq!(engine.pool_size(), 1);
        assert!(engine.url().is_memory());
    }

    #[test]
    fn creating_engine_does_not_connect() {
        let engine = create_engine("sqlite://").unwrap();
        assert_eq!(engine.pool.state().connections, 0);
        let _conn = engine.connect().unwrap();
        assert_eq!(engine.pool.state().connections, 1);
    }

    #[test]
    fn memory_database_survives_checkouts() {
        let engine = create_engine("sqlite://").unwrap();
        engine
            .begin(|conn| conn.execute(&text("CREATE TABLE t (x int)"), ()).map(|_| ()))
            .unwrap();
        assert!(engine.has_table("t").unwrap());
        assert_eq!(engine.table_names().unwrap(), vec!["t".to_string()]);
    }

    #[test]
    fn foreign_keys_enabled() {
        let engine = create_engine("sqlite://").unwrap();
        let conn = engine.connect().unwrap();
        let fk: i64 = conn
            .raw()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn file_engine_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:///{}", dir.path().join("blog.db").display());
        let engine = Engine::create(&url, EngineOptions { pool_size: 3, ..Default::default() }).unwrap();
        assert_eq!(engine.pool_size(), 3);
        let conn = engine.connect().unwrap();
        let mode: String = conn
            .raw()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn begin_rolls_back_on_error() {
        let engine = create_engine("sqlite://").unwrap();
        engine
            .begin(|conn| conn.execute(&text("CREATE TABLE t (x int)"), ()).map(|_| ()))
            .unwrap();

        let result: Result<()> = engine.begin(|conn| {
            let _ = conn.execute(&text("INSERT INTO t (x) VALUES (1)"), ())?;
            Err(DbError::InvalidOperation("abort".into()))
        });
        assert_matches!(result, Err(DbError::InvalidOperation(_)));

        let mut conn = engine.connect().unwrap();
        let count = conn.execute(&text("SELECT COUNT(*) FROM t"), ()).unwrap();
        assert_eq!(count.scalars::<i64>().unwrap(), vec![0]);
    }

    #[test]
    fn options_from_settings() {
        let settings = DatabaseSettings {
            echo: true,
            pool_size: 0,
            ..Default::default()
        };
        let options = EngineOptions::from(&settings);
        assert!(options.echo);
        assert_eq!(options.pool_size, 1);
    }
}
