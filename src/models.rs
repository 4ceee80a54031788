//! Tutorial schema: `user_account` and `address`, declared both as Core
//! tables and as mapped entities.

use std::fmt;
use std::sync::Arc;

use reef_sql::{AnyEntity, Column, Entity, MetaData, Registry, Row, SqlType, Table, Value, related};

/// A row of `user_account`.
#[derive(Clone, PartialEq, Default)]
pub struct User {
    /// Assigned on first flush.
    pub id: Option<i64>,
    /// Login name, at most 30 characters.
    pub name: String,
    /// Display name.
    pub fullname: Option<String>,
    /// In-memory collection; a session takes ownership on `add`.
    pub addresses: Vec<Address>,
}

impl User {
    /// Transient user with no key.
    pub fn new(name: &str, fullname: &str) -> Self {
        Self {
            name: name.into(),
            fullname: Some(fullname.into()),
            ..Self::default()
        }
    }
}

impl Entity for User {
    const TABLE: &'static str = "user_account";

    fn columns() -> reef_sql::Result<Vec<Column>> {
        Ok(vec![
            Column::new("id", SqlType::Integer).primary_key(),
            Column::new("name", SqlType::String(Some(30))),
            Column::new("fullname", SqlType::String(None)),
        ])
    }

    fn to_row(&self) -> Row {
        Row::from_pairs([
            ("id", self.id.map_or(Value::Null, Value::Integer)),
            ("name", Value::Text(self.name.clone())),
            ("fullname", self.fullname.clone().map_or(Value::Null, Value::Text)),
        ])
    }

    fn from_row(row: &Row) -> reef_sql::Result<Self> {
        Ok(Self {
            id: row.get_by_name("id")?,
            name: row.get_by_name("name")?,
            fullname: row.get_by_name("fullname")?,
            addresses: Vec::new(),
        })
    }

    fn take_related(&mut self) -> Vec<Box<dyn AnyEntity>> {
        related(std::mem::take(&mut self.addresses))
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "User(id={}, name={}, fullname={})",
            repr_key(self.id),
            repr_str(&self.name),
            self.fullname.as_deref().map_or_else(|| "None".to_string(), repr_str)
        )
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A row of `address`.
#[derive(Clone, PartialEq, Default)]
pub struct Address {
    /// Assigned on first flush.
    pub id: Option<i64>,
    /// Required.
    pub email_address: String,
    /// Owning user; filled from the parent when flushed.
    pub user_id: Option<i64>,
}

impl Address {
    /// Transient address with no owner.
    pub fn new(email_address: &str) -> Self {
        Self {
            email_address: email_address.into(),
            ..Self::default()
        }
    }
}

impl Entity for Address {
    const TABLE: &'static str = "address";

    fn columns() -> reef_sql::Result<Vec<Column>> {
        Ok(vec![
            Column::new("id", SqlType::Integer).primary_key(),
            Column::new("email_address", SqlType::String(None)).not_null(),
            Column::new("user_id", SqlType::Integer).references("user_account.id")?,
        ])
    }

    fn to_row(&self) -> Row {
        Row::from_pairs([
            ("id", self.id.map_or(Value::Null, Value::Integer)),
            ("email_address", Value::Text(self.email_address.clone())),
            ("user_id", self.user_id.map_or(Value::Null, Value::Integer)),
        ])
    }

    fn from_row(row: &Row) -> reef_sql::Result<Self> {
        Ok(Self {
            id: row.get_by_name("id")?,
            email_address: row.get_by_name("email_address")?,
            user_id: row.get_by_name("user_id")?,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Address(id={}, email_address={})",
            repr_key(self.id),
            repr_str(&self.email_address)
        )
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn repr_key(id: Option<i64>) -> String {
    id.map_or_else(|| "None".to_string(), |id| id.to_string())
}

fn repr_str(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Core tables of the tutorial.
#[derive(Debug, Clone)]
pub struct CoreSchema {
    /// Owns both tables plus anything reflected later.
    pub metadata: MetaData,
    /// `user_account`
    pub user_table: Arc<Table>,
    /// `address`
    pub address_table: Arc<Table>,
}

/// Declare `user_account` and `address` as Core tables.
///
/// `address.user_id` takes its type from the foreign key target and is
/// NOT NULL here, unlike the mapped `Address`.
pub fn core_schema() -> reef_sql::Result<CoreSchema> {
    let mut metadata = MetaData::new();
    let user_table = metadata.table(
        "user_account",
        vec![
            Column::new("id", SqlType::Integer).primary_key(),
            Column::new("name", SqlType::String(Some(30))),
            Column::new("fullname", SqlType::String(None)),
        ],
    )?;
    let address_table = metadata.table(
        "address",
        vec![
            Column::new("id", SqlType::Integer).primary_key(),
            Column::foreign("user_id", "user_account.id")?.not_null(),
            Column::new("email_address", SqlType::String(None)).not_null(),
        ],
    )?;
    Ok(CoreSchema {
        metadata,
        user_table,
        address_table,
    })
}

/// Declarative registry mapping [`User`] and [`Address`].
pub fn orm_registry() -> reef_sql::Result<Registry> {
    let mut registry = Registry::new();
    let _ = registry.map::<User>()?;
    let _ = registry.map::<Address>()?;
    Ok(registry)
}

/// Registry mapping both entities onto existing Core tables.
pub fn imperative_registry(schema: &CoreSchema) -> reef_sql::Result<Registry> {
    let mut registry = Registry::new();
    let _ = registry.map_table::<User>(Arc::clone(&schema.user_table))?;
    let _ = registry.map_table::<Address>(Arc::clone(&schema.address_table))?;
    Ok(registry)
}
