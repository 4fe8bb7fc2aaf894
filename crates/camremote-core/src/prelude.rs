/*!
 * Prelude module for camremote core.
 *
 * This module re-exports commonly used types and functions from the core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export event types
pub use crate::event::{EventBus, Severity, SharedEventBus};

// Re-export config types
pub use crate::config::{
    Config, ConfigBuilder, ConnectionConfig, DiscoveryConfig, LoggingConfig, SharedConfig,
};

// Re-export utility functions
pub use crate::utils::{run_blocking, with_timeout};

// Re-export logging macros
pub use crate::log_with_fields;
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
