//! # reef-settings
//!
//! Layered configuration for the reef workspace: compiled defaults, then
//! `~/.reef/settings.json`, then `REEF_*` environment variables.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_overrides, load_settings, load_settings_from_path, load_settings_with, overlay, settings_path, validate,
};
pub use types::{DatabaseSettings, LoggingSettings, ReefSettings, SessionSettings};
