//! # reef-sql
//!
//! Relational access over `SQLite` in three layers:
//!
//! - **Engine**: parsed database target plus an `r2d2` pool
//!   ([`Engine`], [`Connection`], [`text`]).
//! - **Core**: schema metadata, DDL and statement builders
//!   ([`MetaData`], [`Table`], [`insert`], [`select`], [`update`], [`delete`]).
//! - **ORM**: [`Entity`] types mapped in a [`Registry`] and tracked by a
//!   unit-of-work [`Session`].

#![deny(unsafe_code)]

pub mod connection;
pub mod ddl;
pub mod engine;
pub mod entity;
pub mod errors;
pub mod params;
pub mod query;
pub mod result;
pub mod schema;
pub mod session;
pub mod statement;
pub mod url;

pub use connection::Connection;
pub use ddl::{create_table_sql, drop_table_sql};
pub use engine::{Engine, EngineOptions, create_engine};
pub use entity::{AnyEntity, Entity, Registry, related};
pub use errors::{DbError, Result};
pub use params::{IntoValue, ParamMap, Params, Value};
pub use query::{Delete, Insert, Op, Predicate, Select, Update, delete, insert, select, update};
pub use result::{QueryResult, Row, RowMapping};
pub use schema::{Column, ColumnRef, ForeignKey, MetaData, SqlType, Table};
pub use session::{FlushReport, Handle, ObjectState, Session, SessionConfig};
pub use statement::{Compiled, Executable, TextClause, text};
pub use url::{DatabaseUrl, Location};
