//! Scoped connection with autobegin transactions.
//!
//! The first statement on an idle [`Connection`] emits `BEGIN`; nothing is
//! durable until [`Connection::commit`]. Dropping a connection inside a
//! transaction rolls it back before the physical connection returns to the
//! pool.

use std::sync::Arc;

use rusqlite::Statement;
use tracing::{debug, info, warn};

use crate::engine::PooledConnection;
use crate::errors::{DbError, Result};
use crate::params::{ParamMap, Params, Value};
use crate::result::{QueryResult, Row, render_value};
use crate::statement::{Compiled, Executable};

/// A checked-out connection.
pub struct Connection {
    conn: PooledConnection,
    echo: bool,
}

impl Connection {
    pub(crate) fn new(conn: PooledConnection, echo: bool) -> Self {
        Self { conn, echo }
    }

    /// Run `stmt` once per parameter set.
    ///
    /// Row-returning statements buffer their rows; others report
    /// `rows_affected`. Every placeholder must have a value.
    pub fn execute<S: Executable>(&mut self, stmt: S, params: impl Into<Params>) -> Result<QueryResult> {
        let params = params.into();
        let compiled = stmt.compile(&params)?;
        self.run(&compiled, params.into_sets())
    }

    /// Open a transaction if none is active.
    pub fn begin(&mut self) -> Result<()> {
        if self.conn.is_autocommit() {
            self.log_sql("BEGIN (implicit)", None);
            self.conn.execute_batch("BEGIN")?;
        }
        Ok(())
    }

    /// Commit the active transaction, if any.
    pub fn commit(&mut self) -> Result<()> {
        if self.in_transaction() {
            self.log_sql("COMMIT", None);
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    /// Roll back the active transaction, if any.
    pub fn rollback(&mut self) -> Result<()> {
        if self.in_transaction() {
            self.log_sql("ROLLBACK", None);
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    /// Whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// The underlying `rusqlite` connection.
    pub fn raw(&self) -> &rusqlite::Connection {
        &self.conn
    }

    pub(crate) fn run(&mut self, compiled: &Compiled, sets: Vec<ParamMap>) -> Result<QueryResult> {
        self.begin()?;

        let mut stmt = self.conn.prepare_cached(&compiled.sql)?;
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
            .into();
        let is_insert = compiled
            .sql
            .trim_start()
            .get(..6)
            .is_some_and(|kw| kw.eq_ignore_ascii_case("insert"));

        let mut result = QueryResult::rows(columns.clone(), Vec::new());
        for set in sets {
            let mut bound = compiled.embedded.clone();
            bound.extend(&set);
            log_statement(self.echo, &compiled.sql, &bound);
            bind(&mut stmt, &bound)?;

            if columns.is_empty() {
                let changed = stmt.raw_execute()?;
                let rowid = is_insert.then(|| self.conn.last_insert_rowid());
                result.absorb(QueryResult::affected(changed, rowid));
            } else {
                let mut rows = stmt.raw_query();
                let mut buffered = Vec::new();
                while let Some(row) = rows.next()? {
                    let values = (0..columns.len())
                        .map(|i| row.get::<_, Value>(i))
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    buffered.push(Row::new(columns.clone(), values));
                }
                result.absorb(QueryResult::rows(columns.clone(), buffered));
            }
        }
        Ok(result)
    }

    fn log_sql(&self, sql: &str, params: Option<&ParamMap>) {
        log_statement(self.echo, sql, params.unwrap_or(&ParamMap::new()));
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.in_transaction() {
            if let Err(e) = self.rollback() {
                warn!(error = %e, "rollback on connection release failed");
            }
        }
    }
}

fn bind(stmt: &mut Statement<'_>, params: &ParamMap) -> Result<()> {
    for idx in 1..=stmt.parameter_count() {
        let name = stmt.parameter_name(idx).map(str::to_owned).ok_or_else(|| {
            DbError::InvalidOperation("positional placeholders are not supported, use :name".into())
        })?;
        let key = name.trim_start_matches([':', '@', '$']);
        let value = params
            .get(key)
            .ok_or_else(|| DbError::MissingParameter(key.to_string()))?;
        stmt.raw_bind_parameter(idx, value)?;
    }
    Ok(())
}

fn log_statement(echo: bool, sql: &str, params: &ParamMap) {
    let rendered = render_params(params);
    if echo {
        info!(target: "reef_sql::engine", params = %rendered, "{sql}");
    } else {
        debug!(target: "reef_sql::engine", params = %rendered, "{sql}");
    }
}

fn render_params(params: &ParamMap) -> String {
    let parts: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{k}={}", render_value(v)))
        .collect();
    format!("({})", parts.join(", "))
}
