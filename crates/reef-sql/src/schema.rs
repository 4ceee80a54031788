//! In-memory schema description: tables, columns and foreign keys.
//!
//! A [`MetaData`] collects related tables so DDL can be emitted in
//! dependency order and mapped entities can be checked against them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::errors::{DbError, Result};

/// Column storage type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlType {
    /// 64-bit integer.
    Integer,
    /// Variable-length string with an optional declared length.
    String(Option<u32>),
    /// Unbounded text.
    Text,
    /// Floating point.
    Real,
    /// Raw bytes.
    Blob,
}

impl SqlType {
    /// Map a declared `SQLite` type back to a [`SqlType`] using affinity rules.
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.trim().to_ascii_uppercase();
        if upper.contains("INT") {
            return Self::Integer;
        }
        if upper.starts_with("VARCHAR") || upper.contains("CHAR") {
            let len = upper
                .split_once('(')
                .and_then(|(_, rest)| rest.trim_end_matches(')').trim().parse().ok());
            return Self::String(len);
        }
        if upper.contains("CLOB") || upper.contains("TEXT") {
            return Self::Text;
        }
        if upper.contains("BLOB") || upper.is_empty() {
            return Self::Blob;
        }
        Self::Real
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => f.write_str("INTEGER"),
            Self::String(Some(n)) => write!(f, "VARCHAR({n})"),
            Self::String(None) => f.write_str("VARCHAR"),
            Self::Text => f.write_str("TEXT"),
            Self::Real => f.write_str("REAL"),
            Self::Blob => f.write_str("BLOB"),
        }
    }
}

/// Reference from a column to `table.column`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForeignKey {
    /// Referenced table.
    pub table: String,
    /// Referenced column.
    pub column: String,
}

impl ForeignKey {
    /// Parse `"table.column"`.
    pub fn parse(target: &str) -> Result<Self> {
        match target.split_once('.') {
            Some((table, column)) if !table.is_empty() && !column.is_empty() => Ok(Self {
                table: table.to_string(),
                column: column.to_string(),
            }),
            _ => Err(DbError::InvalidOperation(format!(
                "foreign key target {target:?} must look like table.column"
            ))),
        }
    }
}

/// Column definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Storage type; `None` until inherited from a foreign key target.
    pub ty: Option<SqlType>,
    /// Part of the primary key.
    pub primary_key: bool,
    /// Accepts NULL. Ignored for primary-key columns.
    pub nullable: bool,
    /// Referenced column, if any.
    pub foreign_key: Option<ForeignKey>,
}

impl Column {
    /// Nullable column of type `ty`.
    pub fn new(name: impl Into<String>, ty: SqlType) -> Self {
        Self {
            name: name.into(),
            ty: Some(ty),
            primary_key: false,
            nullable: true,
            foreign_key: None,
        }
    }

    /// Column referencing `"table.column"`, typed like its target.
    pub fn foreign(name: impl Into<String>, target: &str) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            ty: None,
            primary_key: false,
            nullable: true,
            foreign_key: Some(ForeignKey::parse(target)?),
        })
    }

    /// Mark as primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Mark NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Add a foreign key to an already typed column.
    pub fn references(mut self, target: &str) -> Result<Self> {
        self.foreign_key = Some(ForeignKey::parse(target)?);
        Ok(self)
    }

    /// Whether NULL is rejected.
    pub fn is_not_null(&self) -> bool {
        self.primary_key || !self.nullable
    }
}

/// Table definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Table {
    name: String,
    columns: Vec<Column>,
}

impl Table {
    /// Build a table; column names must be unique.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Result<Self> {
        let name = name.into();
        let mut seen = HashSet::new();
        for col in &columns {
            if !seen.insert(col.name.as_str()) {
                return Err(DbError::InvalidOperation(format!(
                    "column {} declared twice on {name}",
                    col.name
                )));
            }
        }
        Ok(Self { name, columns })
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Columns in declaration order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column definition by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Expression handle for column `name`.
    pub fn col(&self, name: &str) -> Result<ColumnRef> {
        self.column(name)
            .map(|c| ColumnRef {
                table: self.name.clone(),
                column: c.name.clone(),
            })
            .ok_or_else(|| DbError::NoSuchColumn {
                table: self.name.clone(),
                column: name.to_string(),
            })
    }

    /// Primary-key columns in declaration order.
    pub fn primary_key(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    /// Column name of the first primary-key column.
    pub fn identity_column(&self) -> Option<&str> {
        self.columns.iter().find(|c| c.primary_key).map(|c| c.name.as_str())
    }

    /// Column of this table referencing `parent`, if any.
    pub fn foreign_key_to(&self, parent: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.foreign_key.as_ref().is_some_and(|fk| fk.table == parent))
    }

    /// Names of other tables this one references.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::new();
        for fk in self.columns.iter().filter_map(|c| c.foreign_key.as_ref()) {
            if fk.table != self.name && !deps.contains(&fk.table.as_str()) {
                deps.push(&fk.table);
            }
        }
        deps
    }

    fn resolve_types(&mut self, others: &[Arc<Table>]) {
        for col in &mut self.columns {
            if col.ty.is_some() {
                continue;
            }
            if let Some(fk) = &col.foreign_key {
                col.ty = others
                    .iter()
                    .find(|t| t.name == fk.table)
                    .and_then(|t| t.column(&fk.column))
                    .and_then(|c| c.ty);
            }
        }
    }
}

/// `table.column` handle used to build predicates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnRef {
    /// Owning table.
    pub table: String,
    /// Column name.
    pub column: String,
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// Ordered collection of related tables.
#[derive(Clone, Debug, Default)]
pub struct MetaData {
    tables: Vec<Arc<Table>>,
}

impl MetaData {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a table from columns.
    pub fn table(&mut self, name: &str, columns: Vec<Column>) -> Result<Arc<Table>> {
        self.add_table(Table::new(name, columns)?)
    }

    /// Register a table. Untyped foreign-key columns inherit their target's type.
    pub fn add_table(&mut self, mut table: Table) -> Result<Arc<Table>> {
        if self.get(table.name()).is_some() {
            return Err(DbError::DuplicateTable(table.name.clone()));
        }
        table.resolve_types(&self.tables);
        let table = Arc::new(table);
        self.tables.push(Arc::clone(&table));
        self.resolve_pending();
        Ok(self.get(table.name()).unwrap_or(table))
    }

    /// Table by name.
    pub fn get(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.iter().find(|t| t.name == name).cloned()
    }

    /// Tables in declaration order.
    pub fn tables(&self) -> &[Arc<Table>] {
        &self.tables
    }

    /// Tables with every referenced table ahead of its dependents.
    ///
    /// Ties keep declaration order. Cycles are appended in declaration order.
    pub fn sorted_tables(&self) -> Vec<Arc<Table>> {
        sort_by_dependency(&self.tables)
    }

    /// Re-resolve columns declared before their foreign key target existed.
    fn resolve_pending(&mut self) {
        let needs: Vec<usize> = self
            .tables
            .iter()
            .enumerate()
            .filter(|(_, t)| t.columns.iter().any(|c| c.ty.is_none()))
            .map(|(i, _)| i)
            .collect();
        for idx in needs {
            let mut table = (*self.tables[idx]).clone();
            table.resolve_types(&self.tables);
            self.tables[idx] = Arc::new(table);
        }
    }
}

/// Kahn ordering over foreign-key edges, stable in input order.
pub(crate) fn sort_by_dependency(tables: &[Arc<Table>]) -> Vec<Arc<Table>> {
    let names: HashSet<&str> = tables.iter().map(|t| t.name()).collect();
    let mut remaining: HashMap<&str, usize> = HashMap::new();
    for table in tables {
        let deps = table
            .dependencies()
            .into_iter()
            .filter(|d| names.contains(d))
            .count();
        let _ = remaining.insert(table.name(), deps);
    }

    let mut ready: VecDeque<&Arc<Table>> = tables
        .iter()
        .filter(|t| remaining.get(t.name()) == Some(&0))
        .collect();
    let mut sorted: Vec<Arc<Table>> = Vec::with_capacity(tables.len());
    let mut placed: HashSet<&str> = HashSet::new();

    while let Some(table) = ready.pop_front() {
        if !placed.insert(table.name()) {
            continue;
        }
        sorted.push(Arc::clone(table));
        for dependent in tables {
            if placed.contains(dependent.name()) || !dependent.dependencies().contains(&table.name()) {
                continue;
            }
            if let Some(count) = remaining.get_mut(dependent.name()) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.push_back(dependent);
                }
            }
        }
    }

    if sorted.len() < tables.len() {
        warn!("foreign key cycle between tables, keeping declaration order for the rest");
        for table in tables {
            if !placed.contains(table.name()) {
                sorted.push(Arc::clone(table));
            }
        }
    }
    sorted
}
