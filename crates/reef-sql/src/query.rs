//! Statement builders over [`Table`] definitions.
//!
//! Builders render SQL with `:name` placeholders and carry the values they
//! were given as embedded parameters, so nothing is ever interpolated.

use std::collections::HashMap;
use std::fmt;

use crate::errors::{DbError, Result};
use crate::params::{IntoValue, ParamMap, Params, Value};
use crate::schema::{ColumnRef, Table};
use crate::statement::{Compiled, Executable};

/// Comparison operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl Op {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Test {
    Compare(Op, Value),
    IsNull,
    IsNotNull,
}

/// A `WHERE` term on one column.
#[derive(Clone, Debug, PartialEq)]
pub struct Predicate {
    column: ColumnRef,
    test: Test,
}

impl ColumnRef {
    fn compare(&self, op: Op, value: impl IntoValue) -> Predicate {
        Predicate {
            column: self.clone(),
            test: Test::Compare(op, value.into_value()),
        }
    }

    /// `column = value`
    pub fn equals(&self, value: impl IntoValue) -> Predicate {
        self.compare(Op::Eq, value)
    }

    /// `column != value`
    pub fn not_equals(&self, value: impl IntoValue) -> Predicate {
        self.compare(Op::Ne, value)
    }

    /// `column < value`
    pub fn lt(&self, value: impl IntoValue) -> Predicate {
        self.compare(Op::Lt, value)
    }

    /// `column <= value`
    pub fn le(&self, value: impl IntoValue) -> Predicate {
        self.compare(Op::Le, value)
    }

    /// `column > value`
    pub fn gt(&self, value: impl IntoValue) -> Predicate {
        self.compare(Op::Gt, value)
    }

    /// `column >= value`
    pub fn ge(&self, value: impl IntoValue) -> Predicate {
        self.compare(Op::Ge, value)
    }

    /// `column IS NULL`
    pub fn is_null(&self) -> Predicate {
        Predicate {
            column: self.clone(),
            test: Test::IsNull,
        }
    }

    /// `column IS NOT NULL`
    pub fn is_not_null(&self) -> Predicate {
        Predicate {
            column: self.clone(),
            test: Test::IsNotNull,
        }
    }
}

/// Allocates `<column>_<n>` parameter names.
#[derive(Default)]
struct Binder {
    counters: HashMap<String, usize>,
    params: ParamMap,
}

impl Binder {
    fn bind(&mut self, column: &str, value: Value) -> String {
        let n = self.counters.entry(column.to_string()).or_insert(0);
        *n += 1;
        let name = format!("{column}_{n}");
        self.params.insert(name.clone(), value);
        name
    }

    fn where_clause(&mut self, predicates: &[Predicate]) -> String {
        if predicates.is_empty() {
            return String::new();
        }
        let terms: Vec<String> = predicates
            .iter()
            .map(|p| match &p.test {
                Test::Compare(op, value) => {
                    let name = self.bind(&p.column.column, value.clone());
                    format!("{} {} :{name}", p.column, op.as_sql())
                }
                Test::IsNull => format!("{} IS NULL", p.column),
                Test::IsNotNull => format!("{} IS NOT NULL", p.column),
            })
            .collect();
        format!(" WHERE {}", terms.join(" AND "))
    }
}

fn check_predicates(table: &Table, predicates: &[Predicate]) -> Result<()> {
    for p in predicates {
        if p.column.table != table.name() || table.column(&p.column.column).is_none() {
            return Err(DbError::NoSuchColumn {
                table: table.name().to_string(),
                column: p.column.to_string(),
            });
        }
    }
    Ok(())
}

/// Keep `names` that are columns of `table`, in table order.
fn ordered_columns<'a>(table: &'a Table, names: &ParamMap) -> Result<Vec<&'a str>> {
    for name in names.names() {
        if table.column(name).is_none() {
            return Err(DbError::NoSuchColumn {
                table: table.name().to_string(),
                column: name.to_string(),
            });
        }
    }
    Ok(table
        .columns()
        .iter()
        .map(|c| c.name.as_str())
        .filter(|c| names.get(c).is_some())
        .collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// INSERT
// ─────────────────────────────────────────────────────────────────────────────

/// `INSERT INTO <table> ...`
#[derive(Clone, Debug)]
pub struct Insert {
    table: Table,
    values: ParamMap,
}

/// Start an INSERT.
pub fn insert(table: &Table) -> Insert {
    Insert {
        table: table.clone(),
        values: ParamMap::new(),
    }
}

impl Insert {
    /// Fix column values in the statement.
    #[must_use]
    pub fn values(mut self, values: ParamMap) -> Self {
        self.values.extend(&values);
        self
    }
}

impl Executable for Insert {
    fn compile(&self, params: &Params) -> Result<Compiled> {
        let columns: Vec<&str> = if !self.values.is_empty() {
            ordered_columns(&self.table, &self.values)?
        } else if let Some(first) = params.first() {
            ordered_columns(&self.table, first)?
        } else {
            self.table.columns().iter().map(|c| c.name.as_str()).collect()
        };

        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", self.table.name())
        } else {
            let placeholders: Vec<String> = columns.iter().map(|c| format!(":{c}")).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.table.name(),
                columns.join(", "),
                placeholders.join(", ")
            )
        };
        Ok(Compiled {
            sql,
            embedded: self.values.clone(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SELECT
// ─────────────────────────────────────────────────────────────────────────────

/// `SELECT <columns> FROM <table> ...`
#[derive(Clone, Debug)]
pub struct Select {
    table: Table,
    predicates: Vec<Predicate>,
    order_by: Vec<(ColumnRef, bool)>,
    limit: Option<u64>,
}

/// Select every column of `table`.
pub fn select(table: &Table) -> Select {
    Select {
        table: table.clone(),
        predicates: Vec::new(),
        order_by: Vec::new(),
        limit: None,
    }
}

impl Select {
    /// Add an AND-combined filter.
    #[must_use]
    pub fn where_(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Ascending sort key.
    #[must_use]
    pub fn order_by(mut self, column: ColumnRef) -> Self {
        self.order_by.push((column, false));
        self
    }

    /// Descending sort key.
    #[must_use]
    pub fn order_by_desc(mut self, column: ColumnRef) -> Self {
        self.order_by.push((column, true));
        self
    }

    /// Cap the number of rows.
    #[must_use]
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Table selected from.
    pub fn table(&self) -> &Table {
        &self.table
    }
}

impl Executable for Select {
    fn compile(&self, _params: &Params) -> Result<Compiled> {
        check_predicates(&self.table, &self.predicates)?;
        let name = self.table.name();
        let columns: Vec<String> = self
            .table
            .columns()
            .iter()
            .map(|c| format!("{name}.{}", c.name))
            .collect();

        let mut binder = Binder::default();
        let mut sql = format!("SELECT {} \nFROM {name}", columns.join(", "));
        sql.push_str(&binder.where_clause(&self.predicates));
        if !self.order_by.is_empty() {
            let keys: Vec<String> = self
                .order_by
                .iter()
                .map(|(c, desc)| if *desc { format!("{c} DESC") } else { c.to_string() })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }
        if let Some(n) = self.limit {
            sql.push_str(&format!(" LIMIT {n}"));
        }
        Ok(Compiled {
            sql,
            embedded: binder.params,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// UPDATE / DELETE
// ─────────────────────────────────────────────────────────────────────────────

/// `UPDATE <table> SET ... WHERE ...`
#[derive(Clone, Debug)]
pub struct Update {
    table: Table,
    values: ParamMap,
    predicates: Vec<Predicate>,
}

/// Start an UPDATE.
pub fn update(table: &Table) -> Update {
    Update {
        table: table.clone(),
        values: ParamMap::new(),
        predicates: Vec::new(),
    }
}

impl Update {
    /// Columns to assign.
    #[must_use]
    pub fn set(mut self, values: ParamMap) -> Self {
        self.values.extend(&values);
        self
    }

    /// Add an AND-combined filter.
    #[must_use]
    pub fn where_(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }
}

impl Executable for Update {
    fn compile(&self, params: &Params) -> Result<Compiled> {
        check_predicates(&self.table, &self.predicates)?;
        let source = if self.values.is_empty() {
            params.first().cloned().unwrap_or_default()
        } else {
            self.values.clone()
        };
        let columns = ordered_columns(&self.table, &source)?;
        if columns.is_empty() {
            return Err(DbError::InvalidOperation(format!(
                "UPDATE {} has no columns to set",
                self.table.name()
            )));
        }

        let assignments: Vec<String> = columns.iter().map(|c| format!("{c}=:{c}")).collect();
        let mut binder = Binder::default();
        let mut sql = format!("UPDATE {} SET {}", self.table.name(), assignments.join(", "));
        sql.push_str(&binder.where_clause(&self.predicates));

        let mut embedded = self.values.clone();
        embedded.extend(&binder.params);
        Ok(Compiled { sql, embedded })
    }
}

/// `DELETE FROM <table> WHERE ...`
#[derive(Clone, Debug)]
pub struct Delete {
    table: Table,
    predicates: Vec<Predicate>,
}

/// Start a DELETE.
pub fn delete(table: &Table) -> Delete {
    Delete {
        table: table.clone(),
        predicates: Vec::new(),
    }
}

impl Delete {
    /// Add an AND-combined filter.
    #[must_use]
    pub fn where_(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }
}

impl Executable for Delete {
    fn compile(&self, _params: &Params) -> Result<Compiled> {
        check_predicates(&self.table, &self.predicates)?;
        let mut binder = Binder::default();
        let mut sql = format!("DELETE FROM {}", self.table.name());
        sql.push_str(&binder.where_clause(&self.predicates));
        Ok(Compiled {
            sql,
            embedded: binder.params,
        })
    }
}

macro_rules! display_via_compile {
    ($($ty:ty),+) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    match self.compile(&Params::None) {
                        Ok(c) => f.write_str(&c.sql),
                        Err(e) => write!(f, "<uncompilable: {e}>"),
                    }
                }
            }
        )+
    };
}

display_via_compile!(Insert, Select, Update, Delete);

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::bind;
    use crate::engine::create_engine;
    use crate::schema::{Column, MetaData, SqlType};

    fn users() -> Table {
        Table::new(
            "user_account",
            vec![
                Column::new("id", SqlType::Integer).primary_key(),
                Column::new("name", SqlType::String(Some(30))),
                Column::new("fullname", SqlType::String(None)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn select_renders_qualified_columns() {
        assert_eq!(
            select(&users()).to_string(),
            "SELECT user_account.id, user_account.name, user_account.fullname \nFROM user_account"
        );
    }

    #[test]
    fn select_where_order_limit() {
        let t = users();
        let stmt = select(&t)
            .where_(t.col("name").unwrap().equals("spongebob"))
            .where_(t.col("id").unwrap().gt(0))
            .order_by_desc(t.col("id").unwrap())
            .limit(1);
        let compiled = stmt.compile(&Params::None).unwrap();
        assert!(compiled.sql.ends_with(
            " WHERE user_account.name = :name_1 AND user_account.id > :id_1 ORDER BY user_account.id DESC LIMIT 1"
        ));
        assert_eq!(compiled.embedded.get("name_1"), Some(&Value::Text("spongebob".into())));
    }

    #[test]
    fn foreign_predicate_rejected() {
        let t = users();
        let other = Table::new("address", vec![Column::new("id", SqlType::Integer)]).unwrap();
        let stmt = select(&t).where_(other.col("id").unwrap().equals(1));
        assert_matches!(stmt.compile(&Params::None), Err(DbError::NoSuchColumn { .. }));
    }

    #[test]
    fn insert_with_values() {
        let stmt = insert(&users()).values(bind! {"fullname" => "Spongebob Squarepants", "name" => "spongebob"});
        assert_eq!(
            stmt.to_string(),
            "INSERT INTO user_account (name, fullname) VALUES (:name, :fullname)"
        );
    }

    #[test]
    fn bare_insert_takes_columns_from_params() {
        let params = Params::from(vec![bind! {"name" => "sandy", "fullname" => "Sandy Cheeks"}]);
        let compiled = insert(&users()).compile(&params).unwrap();
        assert_eq!(
            compiled.sql,
            "INSERT INTO user_account (name, fullname) VALUES (:name, :fullname)"
        );
    }

    #[test]
    fn insert_unknown_column_rejected() {
        let stmt = insert(&users()).values(bind! {"nickname" => "x"});
        assert_matches!(stmt.compile(&Params::None), Err(DbError::NoSuchColumn { .. }));
    }

    #[test]
    fn update_and_delete_render() {
        let t = users();
        let up = update(&t)
            .set(bind! {"fullname" => "Sandy Squirrel"})
            .where_(t.col("id").unwrap().equals(4));
        assert_eq!(up.to_string(), "UPDATE user_account SET fullname=:fullname WHERE user_account.id = :id_1");
        let del = delete(&t).where_(t.col("name").unwrap().is_null());
        assert_eq!(del.to_string(), "DELETE FROM user_account WHERE user_account.name IS NULL");
    }

    #[test]
    fn update_without_values_errors() {
        assert_matches!(update(&users()).compile(&Params::None), Err(DbError::InvalidOperation(_)));
    }

    #[test]
    fn builders_execute_end_to_end() {
        let engine = create_engine("sqlite://").unwrap();
        let mut metadata = MetaData::new();
        let t = metadata.add_table(users()).unwrap();
        let _ = metadata.create_all(&engine).unwrap();

        let mut conn = engine.connect().unwrap();
        let first = conn
            .execute(&insert(&t).values(bind! {"name" => "spongebob", "fullname" => "Spongebob Squarepants"}), ())
            .unwrap();
        assert_eq!(first.inserted_primary_key(), Some(1));
        let many = conn
            .execute(
                &insert(&t),
                vec![
                    bind! {"name" => "sandy", "fullname" => "Sandy Cheeks"},
                    bind! {"name" => "patrick", "fullname" => "Patrick Star"},
                ],
            )
            .unwrap();
        assert_eq!(many.rows_affected(), 2);

        let changed = conn
            .execute(&update(&t).set(bind! {"fullname" => "Patrick"}).where_(t.col("name").unwrap().equals("patrick")), ())
            .unwrap();
        assert_eq!(changed.rows_affected(), 1);

        let removed = conn
            .execute(&delete(&t).where_(t.col("name").unwrap().equals("sandy")), ())
            .unwrap();
        assert_eq!(removed.rows_affected(), 1);

        let rows = conn
            .execute(&select(&t).order_by(t.col("id").unwrap()), ())
            .unwrap();
        let names: Vec<String> = rows.iter().map(|r| r.get_by_name("name").unwrap()).collect();
        assert_eq!(names, vec!["spongebob", "patrick"]);
        assert_eq!(rows.iter().nth(1).unwrap().get_by_name::<String>("fullname").unwrap(), "Patrick");
        conn.commit().unwrap();
    }
}
