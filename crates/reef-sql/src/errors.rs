//! Error types for engine, statement, schema and session operations.

use thiserror::Error;

/// Errors raised by `reef-sql`.
#[derive(Debug, Error)]
pub enum DbError {
    /// `SQLite` error, including constraint violations.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool checkout failed.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// The database target string could not be parsed.
    #[error("invalid database url {url:?}: {reason}")]
    InvalidUrl {
        /// The rejected target string.
        url: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The target names a backend other than `SQLite`.
    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// A statement placeholder had no bound value.
    #[error("missing value for bound parameter :{0}")]
    MissingParameter(String),

    /// No table with this name is known.
    #[error("no such table: {0}")]
    NoSuchTable(String),

    /// The table has no column with this name.
    #[error("table {table} has no column {column}")]
    NoSuchColumn {
        /// Table searched.
        table: String,
        /// Column requested.
        column: String,
    },

    /// A table with this name is already registered.
    #[error("table {0} is already defined in this metadata")]
    DuplicateTable(String),

    /// An entity definition does not line up with its table.
    #[error("mapping error for {entity}: {detail}")]
    Mapping {
        /// Entity table name.
        entity: &'static str,
        /// What does not match.
        detail: String,
    },

    /// A stored value could not be decoded into the entity field.
    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        /// Source table.
        table: String,
        /// Source column.
        column: String,
        /// Decode failure.
        detail: String,
    },

    /// The operation is not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl DbError {
    /// Whether this wraps a `SQLite` constraint failure (NOT NULL, FOREIGN KEY, UNIQUE).
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

/// Convenience alias for `reef-sql` results.
pub type Result<T> = std::result::Result<T, DbError>;
