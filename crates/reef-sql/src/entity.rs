//! Mapped entities and the declarative registry.
//!
//! An [`Entity`] is a plain Rust value whose fields correspond to the columns
//! of one table. The first primary-key column is its identity: an
//! auto-assigned integer that stays `NULL` until the row is inserted.

use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::errors::{DbError, Result};
use crate::params::Value;
use crate::result::Row;
use crate::schema::{Column, MetaData, Table};

/// A type mapped onto a table.
pub trait Entity: fmt::Debug + 'static {
    /// Table name.
    const TABLE: &'static str;

    /// Column definitions in declaration order.
    fn columns() -> Result<Vec<Column>>;

    /// Current attribute values, one per column.
    fn to_row(&self) -> Row;

    /// Rebuild from a row carrying every column.
    fn from_row(row: &Row) -> Result<Self>
    where
        Self: Sized;

    /// Hand over in-memory related entities so a session can cascade them.
    fn take_related(&mut self) -> Vec<Box<dyn AnyEntity>> {
        Vec::new()
    }

    /// Table shape built from [`Entity::columns`].
    fn table() -> Result<Table>
    where
        Self: Sized,
    {
        Table::new(Self::TABLE, Self::columns()?)
    }
}

/// Box a related collection for [`Entity::take_related`].
pub fn related<T: Entity>(items: Vec<T>) -> Vec<Box<dyn AnyEntity>> {
    items
        .into_iter()
        .map(|item| Box::new(item) as Box<dyn AnyEntity>)
        .collect()
}

/// Object-safe view of an [`Entity`], as tracked by a session.
pub trait AnyEntity: fmt::Debug {
    /// Table name.
    fn erased_table_name(&self) -> &'static str;
    /// Current attribute values.
    fn erased_to_row(&self) -> Row;
    /// Replace every attribute from `row`.
    fn erased_apply(&mut self, row: &Row) -> Result<()>;
    /// See [`Entity::take_related`].
    fn erased_take_related(&mut self) -> Vec<Box<dyn AnyEntity>>;
    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
    /// Downcast support.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Entity> AnyEntity for T {
    fn erased_table_name(&self) -> &'static str {
        T::TABLE
    }

    fn erased_to_row(&self) -> Row {
        self.to_row()
    }

    fn erased_apply(&mut self, row: &Row) -> Result<()> {
        *self = T::from_row(row)?;
        Ok(())
    }

    fn erased_take_related(&mut self) -> Vec<Box<dyn AnyEntity>> {
        self.take_related()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Integer identity held in `column` of `row`, if assigned.
pub(crate) fn identity_of(row: &Row, column: &str) -> Option<i64> {
    match row.value_by_name(column) {
        Some(Value::Integer(id)) => Some(*id),
        _ => None,
    }
}

/// Mapping configuration: which table each entity type is persisted to.
///
/// Tables declared through [`Registry::map`] are also collected in a
/// [`MetaData`] so they can be created. Sessions are opened against a
/// registry and resolve every entity type, and every foreign key that points
/// at one, through it.
#[derive(Debug, Default)]
pub struct Registry {
    metadata: MetaData,
    mapped: Vec<(&'static str, Arc<Table>)>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `T`'s table from its own column list.
    pub fn map<T: Entity>(&mut self) -> Result<Arc<Table>> {
        let table = T::table()?;
        require_identity::<T>(&table)?;
        self.reject_remap::<T>()?;
        let table = self.metadata.add_table(table)?;
        self.mapped.push((T::TABLE, Arc::clone(&table)));
        Ok(table)
    }

    /// Map `T` onto a table declared elsewhere.
    ///
    /// The table must carry the same name and the same set of columns as
    /// `T::columns()`. Its own column options (nullability, foreign keys)
    /// are what sessions use from then on.
    pub fn map_table<T: Entity>(&mut self, table: Arc<Table>) -> Result<Arc<Table>> {
        if table.name() != T::TABLE {
            return Err(DbError::Mapping {
                entity: T::TABLE,
                detail: format!("mapped onto table {}", table.name()),
            });
        }
        let expected: BTreeSet<String> = T::columns()?.into_iter().map(|c| c.name).collect();
        let actual: BTreeSet<String> = table.columns().iter().map(|c| c.name.clone()).collect();
        if expected != actual {
            let missing: Vec<&String> = expected.symmetric_difference(&actual).collect();
            return Err(DbError::Mapping {
                entity: T::TABLE,
                detail: format!("column sets differ on {missing:?}"),
            });
        }
        require_identity::<T>(&table)?;
        self.reject_remap::<T>()?;
        self.mapped.push((T::TABLE, Arc::clone(&table)));
        Ok(table)
    }

    /// Table `T` is mapped onto.
    pub fn table_for<T: Entity>(&self) -> Option<Arc<Table>> {
        self.mapped
            .iter()
            .find(|(name, _)| *name == T::TABLE)
            .map(|(_, table)| Arc::clone(table))
    }

    /// Tables declared through [`Registry::map`].
    pub fn metadata(&self) -> &MetaData {
        &self.metadata
    }

    pub(crate) fn mapped(&self) -> &[(&'static str, Arc<Table>)] {
        &self.mapped
    }

    fn reject_remap<T: Entity>(&self) -> Result<()> {
        if self.table_for::<T>().is_some() {
            return Err(DbError::Mapping {
                entity: T::TABLE,
                detail: "already mapped in this registry".into(),
            });
        }
        Ok(())
    }
}

fn require_identity<T: Entity>(table: &Table) -> Result<()> {
    if table.identity_column().is_none() {
        return Err(DbError::Mapping {
            entity: T::TABLE,
            detail: "no primary key column".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Parent/child entities shared by the session tests.

    use super::*;
    use crate::schema::SqlType;

    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct Author {
        pub id: Option<i64>,
        pub name: String,
        pub books: Vec<Book>,
    }

    impl Author {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.into(),
                ..Self::default()
            }
        }
    }

    impl Entity for Author {
        const TABLE: &'static str = "author";

        fn columns() -> Result<Vec<Column>> {
            Ok(vec![
                Column::new("id", SqlType::Integer).primary_key(),
                Column::new("name", SqlType::String(Some(30))).not_null(),
            ])
        }

        fn to_row(&self) -> Row {
            Row::from_pairs([
                ("id", self.id.map_or(Value::Null, Value::Integer)),
                ("name", Value::Text(self.name.clone())),
            ])
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_by_name("id")?,
                name: row.get_by_name("name")?,
                books: Vec::new(),
            })
        }

        fn take_related(&mut self) -> Vec<Box<dyn AnyEntity>> {
            related(std::mem::take(&mut self.books))
        }
    }

    #[derive(Debug, Clone, PartialEq, Default)]
    pub struct Book {
        pub id: Option<i64>,
        pub title: String,
        pub author_id: Option<i64>,
    }

    impl Book {
        pub fn new(title: &str) -> Self {
            Self {
                title: title.into(),
                ..Self::default()
            }
        }
    }

    impl Entity for Book {
        const TABLE: &'static str = "book";

        fn columns() -> Result<Vec<Column>> {
            Ok(vec![
                Column::new("id", SqlType::Integer).primary_key(),
                Column::new("title", SqlType::String(None)).not_null(),
                Column::new("author_id", SqlType::Integer).references("author.id")?,
            ])
        }

        fn to_row(&self) -> Row {
            Row::from_pairs([
                ("id", self.id.map_or(Value::Null, Value::Integer)),
                ("title", Value::Text(self.title.clone())),
                ("author_id", self.author_id.map_or(Value::Null, Value::Integer)),
            ])
        }

        fn from_row(row: &Row) -> Result<Self> {
            Ok(Self {
                id: row.get_by_name("id")?,
                title: row.get_by_name("title")?,
                author_id: row.get_by_name("author_id")?,
            })
        }
    }
}
