//! # reef
//!
//! A guided tour of `reef-sql`: tutorial models plus a scripted walkthrough
//! from raw textual SQL up to unit-of-work relationships.

#![deny(unsafe_code)]

pub mod models;
pub mod walkthrough;

pub use models::{Address, CoreSchema, User, core_schema, imperative_registry, orm_registry};
pub use walkthrough::{WalkthroughReport, run};
