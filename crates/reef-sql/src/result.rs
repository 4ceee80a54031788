//! Result rows.
//!
//! Rows are buffered when the statement runs, so a [`QueryResult`] outlives
//! the connection checkout that produced it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rusqlite::types::{FromSql, ValueRef};

use crate::errors::{DbError, Result};
use crate::params::Value;

/// One result row, addressable by position or column name.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

/// Column name → value view of a [`Row`].
pub type RowMapping = BTreeMap<String, Value>;

impl Row {
    pub(crate) fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let (columns, values): (Vec<String>, Vec<Value>) =
            pairs.into_iter().map(|(k, v)| (k.into(), v)).unzip();
        Self {
            columns: columns.into(),
            values,
        }
    }

    /// Column names in select order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Raw values in select order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value at `idx`.
    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Raw value of column `name`.
    pub fn value_by_name(&self, name: &str) -> Option<&Value> {
        self.position(name).and_then(|idx| self.values.get(idx))
    }

    /// Typed value at `idx`.
    pub fn get<T: FromSql>(&self, idx: usize) -> Result<T> {
        let value = self.values.get(idx).ok_or_else(|| {
            DbError::InvalidOperation(format!(
                "column index {idx} out of range for {} columns",
                self.values.len()
            ))
        })?;
        let column = self.columns.get(idx).map_or("?", String::as_str);
        decode(value, column)
    }

    /// Typed value of column `name`.
    pub fn get_by_name<T: FromSql>(&self, name: &str) -> Result<T> {
        let idx = self.position(name).ok_or_else(|| DbError::NoSuchColumn {
            table: "<result>".to_string(),
            column: name.to_string(),
        })?;
        self.get(idx)
    }

    /// Copy into a column → value mapping.
    pub fn to_mapping(&self) -> RowMapping {
        self.columns
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect()
    }

    /// Replace the value of `name`, appending the column if absent.
    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(idx) = self.position(name) {
            self.values[idx] = value;
        } else {
            let mut columns = self.columns.to_vec();
            columns.push(name.to_string());
            self.columns = columns.into();
            self.values.push(value);
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        // Accept `table.column` lookups against bare column names.
        let bare = name.rsplit('.').next().unwrap_or(name);
        self.columns.iter().position(|c| c == name || c == bare)
    }
}

fn decode<T: FromSql>(value: &Value, column: &str) -> Result<T> {
    T::column_result(ValueRef::from(value)).map_err(|e| DbError::CorruptRow {
        table: "<result>".to_string(),
        column: column.to_string(),
        detail: e.to_string(),
    })
}

/// Render a value the way a SQL literal reads.
pub(crate) fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        Value::Text(s) => format!("'{s}'"),
        Value::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(&render_value(v))?;
        }
        if self.values.len() == 1 {
            f.write_str(",")?;
        }
        f.write_str(")")
    }
}

/// Outcome of executing a statement.
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    columns: Arc<[String]>,
    rows: Vec<Row>,
    rows_affected: usize,
    last_insert_rowid: Option<i64>,
}

impl QueryResult {
    pub(crate) fn rows(columns: Arc<[String]>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: 0,
            last_insert_rowid: None,
        }
    }

    pub(crate) fn affected(rows_affected: usize, last_insert_rowid: Option<i64>) -> Self {
        Self {
            columns: Arc::from(Vec::new()),
            rows: Vec::new(),
            rows_affected,
            last_insert_rowid,
        }
    }

    /// Fold another execution of the same statement into this result.
    pub(crate) fn absorb(&mut self, other: QueryResult) {
        if self.columns.is_empty() {
            self.columns = other.columns;
        }
        self.rows.extend(other.rows);
        self.rows_affected += other.rows_affected;
        if other.last_insert_rowid.is_some() {
            self.last_insert_rowid = other.last_insert_rowid;
        }
    }

    /// Result column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows changed by INSERT/UPDATE/DELETE, summed across parameter sets.
    pub fn rows_affected(&self) -> usize {
        self.rows_affected
    }

    /// Rowid assigned by the last INSERT executed.
    pub fn inserted_primary_key(&self) -> Option<i64> {
        self.last_insert_rowid
    }

    /// Iterate rows by reference.
    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }

    /// Number of rows returned.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows were returned.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First row, if any.
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Exactly one row.
    pub fn one(&self) -> Result<&Row> {
        match self.rows.as_slice() {
            [row] => Ok(row),
            rows => Err(DbError::InvalidOperation(format!(
                "expected exactly one row, got {}",
                rows.len()
            ))),
        }
    }

    /// All rows.
    pub fn all(self) -> Vec<Row> {
        self.rows
    }

    /// Rows as column → value mappings.
    pub fn mappings(&self) -> Vec<RowMapping> {
        self.rows.iter().map(Row::to_mapping).collect()
    }

    /// First column of every row, typed.
    pub fn scalars<T: FromSql>(&self) -> Result<Vec<T>> {
        self.rows.iter().map(|r| r.get(0)).collect()
    }
}

impl IntoIterator for QueryResult {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a QueryResult {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Row {
        Row::from_pairs([
            ("id", Value::Integer(1)),
            ("name", Value::Text("spongebob".into())),
            ("fullname", Value::Null),
        ])
    }

    #[test]
    fn access_by_position_and_name() {
        let row = sample();
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
        assert_eq!(row.get_by_name::<String>("name").unwrap(), "spongebob");
        assert_eq!(row.get_by_name::<Option<String>>("fullname").unwrap(), None);
        assert_eq!(row.get_by_name::<i64>("user_account.id").unwrap(), 1);
    }

    #[test]
    fn unknown_column_errors() {
        assert!(matches!(
            sample().get_by_name::<i64>("nope"),
            Err(DbError::NoSuchColumn { .. })
        ));
        assert!(sample().get::<i64>(9).is_err());
    }

    #[test]
    fn type_mismatch_is_corrupt_row() {
        assert!(matches!(
            sample().get::<i64>(1),
            Err(DbError::CorruptRow { column, .. }) if column == "name"
        ));
    }

    #[test]
    fn mapping_view() {
        let map = sample().to_mapping();
        assert_eq!(map["id"], Value::Integer(1));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn display_like_tuple() {
        assert_eq!(sample().to_string(), "(1, 'spongebob', None)");
        let single = Row::from_pairs([("x", Value::Integer(4))]);
        assert_eq!(single.to_string(), "(4,)");
    }

    #[test]
    fn set_replaces_or_appends() {
        let mut row = sample();
        row.set("fullname", Value::Text("Sponge".into()));
        row.set("extra", Value::Integer(7));
        assert_eq!(row.get_by_name::<String>("fullname").unwrap(), "Sponge");
        assert_eq!(row.len(), 4);
    }

    #[test]
    fn one_requires_single_row() {
        let cols: Arc<[String]> = Arc::from(vec!["x".to_string()]);
        let result = QueryResult::rows(cols.clone(), vec![]);
        assert!(result.one().is_err());
        let result = QueryResult::rows(cols.clone(), vec![Row::new(cols, vec![Value::Integer(1)])]);
        assert_eq!(result.one().unwrap().get::<i64>(0).unwrap(), 1);
        assert_eq!(result.scalars::<i64>().unwrap(), vec![1]);
    }
}
