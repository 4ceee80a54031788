//! Executable statements.

use std::fmt;

use crate::errors::Result;
use crate::params::{ParamMap, Params};

/// SQL text plus the values a builder embedded in it.
#[derive(Clone, Debug, PartialEq)]
pub struct Compiled {
    /// SQL with `:name` placeholders.
    pub sql: String,
    /// Values fixed at build time; execution-time params override them.
    pub embedded: ParamMap,
}

/// Anything a [`crate::Connection`] can run.
pub trait Executable {
    /// Render SQL. `params` is what the caller will execute with, so builders
    /// that derive their column list from it (bare `insert`) can see it.
    fn compile(&self, params: &Params) -> Result<Compiled>;
}

/// Literal SQL with named `:placeholders`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextClause {
    sql: String,
}

/// Wrap literal SQL.
pub fn text(sql: impl Into<String>) -> TextClause {
    TextClause { sql: sql.into() }
}

impl TextClause {
    /// The SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl Executable for TextClause {
    fn compile(&self, _params: &Params) -> Result<Compiled> {
        Ok(Compiled {
            sql: self.sql.clone(),
            embedded: ParamMap::new(),
        })
    }
}

impl fmt::Display for TextClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

impl<T: Executable + ?Sized> Executable for &T {
    fn compile(&self, params: &Params) -> Result<Compiled> {
        (**self).compile(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_compiles_verbatim() {
        let stmt = text("SELECT x, y FROM some_table WHERE y > :y");
        let compiled = stmt.compile(&Params::None).unwrap();
        assert_eq!(compiled.sql, "SELECT x, y FROM some_table WHERE y > :y");
        assert!(compiled.embedded.is_empty());
        assert_eq!(stmt.to_string(), stmt.sql());
    }

    #[test]
    fn borrowed_statement_compiles_the_same() {
        let stmt = text("DELETE FROM t");
        let by_ref = (&stmt).compile(&Params::None).unwrap();
        assert_eq!(by_ref, stmt.compile(&Params::None).unwrap());
    }
}
