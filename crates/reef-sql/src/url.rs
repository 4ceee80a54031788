//! Database target strings: `dialect[+driver]://[/database]`.

use std::fmt;
use std::path::PathBuf;

use crate::errors::{DbError, Result};

/// Where a `SQLite` database lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    /// Private in-memory database.
    Memory,
    /// Database file, relative or absolute.
    File(PathBuf),
}

/// A parsed database target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseUrl {
    /// Backend name, always `sqlite` once parsed.
    pub dialect: String,
    /// Optional driver suffix after `+`; recorded, not interpreted.
    pub driver: Option<String>,
    /// Database location.
    pub location: Location,
}

impl DatabaseUrl {
    /// Parse a target string.
    ///
    /// `sqlite://` and `sqlite:///:memory:` are in-memory, `sqlite:///x.db`
    /// is relative and `sqlite:////abs/x.db` is absolute.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| DbError::InvalidUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| invalid("expected dialect://"))?;
        if scheme.is_empty() {
            return Err(invalid("empty dialect"));
        }

        let (dialect, driver) = match scheme.split_once('+') {
            Some((d, drv)) if !drv.is_empty() => (d, Some(drv.to_string())),
            Some(_) => return Err(invalid("empty driver after '+'")),
            None => (scheme, None),
        };
        if dialect != "sqlite" {
            return Err(DbError::UnsupportedBackend(dialect.to_string()));
        }

        let location = match rest {
            "" => Location::Memory,
            _ => {
                let path = rest
                    .strip_prefix('/')
                    .ok_or_else(|| invalid("sqlite urls take no host, use sqlite:///path"))?;
                match path {
                    "" | ":memory:" => Location::Memory,
                    p => Location::File(PathBuf::from(p)),
                }
            }
        };

        Ok(Self {
            dialect: dialect.to_string(),
            driver,
            location,
        })
    }

    /// Whether this is an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.location == Location::Memory
    }
}

impl fmt::Display for DatabaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dialect)?;
        if let Some(driver) = &self.driver {
            write!(f, "+{driver}")?;
        }
        match &self.location {
            Location::Memory => f.write_str(":///:memory:"),
            Location::File(p) => write!(f, ":///{}", p.display()),
        }
    }
}
