/*!
 * Logging functionality for camremote.
 *
 * This module provides tracing setup and utilities for consistent logging
 * across the camremote crates.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// `RUST_LOG` takes precedence when it is set.
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "camremote_devices=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    init_from_config(&LoggingConfig {
        level: filter.to_string(),
        ..LoggingConfig::default()
    })
}

/// Initialize the logging system from the logging section of the configuration
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::logging(format!("Invalid log filter '{}': {}", config.level, e)))?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(config.with_target)
                .with_ansi(config.ansi),
        )
        .with(filter)
        .try_init()
        .map_err(|e| Error::logging(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A convenience macro for creating structured logs with fields
#[macro_export]
macro_rules! log_with_fields {
    ($level:expr, $message:expr, $($field:tt)+) => {
        tracing::event!($level, $($field)+, message = $message)
    };
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a component
///
/// # Arguments
///
/// * `name` - The name of the component
/// * `id` - An optional ID for the component instance
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

/// Create a new span for an operation
///
/// # Arguments
///
/// * `name` - The name of the operation
/// * `component` - The component performing the operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::info_span!("operation", name = %name, component = %component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // A second init in the same process fails; either outcome is fine here
        let _ = init();
    }

    #[test]
    fn test_component_span() {
        // No subscriber is guaranteed in tests, so spans may be disabled
        let span = component_span("enumerator", Some("sdk"));
        let _guard = span.enter();

        let span = component_span("enumerator", None);
        let _guard = span.enter();
    }

    #[test]
    fn test_operation_span() {
        let span = operation_span("connect", "connection");
        let _guard = span.enter();
    }
}
