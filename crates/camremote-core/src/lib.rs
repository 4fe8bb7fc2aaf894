/*!
 * camremote core
 *
 * This crate provides the ambient functionality shared by the camremote
 * crates: error type, configuration, logging, the typed event bus and
 * helpers for bounding blocking calls.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod utils;

pub use error::{Error, Result};

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use anyhow;
    pub use chrono;
    pub use serde;
    pub use tokio;
    pub use tracing;
}

/// camremote core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<()> {
    logging::init()?;
    tracing::info!("camremote core {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
