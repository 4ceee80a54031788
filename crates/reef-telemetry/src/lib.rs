//! # reef-telemetry
//!
//! Installs the global `tracing` subscriber. `RUST_LOG` wins over the
//! configured level; output is human-readable or JSON lines.

#![deny(unsafe_code)]

use reef_settings::LoggingSettings;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global subscriber. Call once at startup.
///
/// Fails if a global subscriber is already set.
pub fn init(settings: &LoggingSettings) -> Result<(), TryInitError> {
    let filter = build_filter(&settings.level);

    let fmt_layer = if settings.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry().with(fmt_layer).try_init()
}

/// `RUST_LOG` if set and valid, else `level`, else `info`.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_accepts_module_directives() {
        let filter = build_filter("reef_sql=debug,warn");
        assert!(!filter.to_string().is_empty());
    }

    #[test]
    fn second_init_fails() {
        let settings = LoggingSettings::default();
        let first = init(&settings);
        let second = init(&settings);
        assert!(first.is_ok());
        assert!(second.is_err());
    }
}
