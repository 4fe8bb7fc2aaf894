/*!
 * Configuration management for camremote.
 *
 * This module provides functionality to load, validate, and access configuration
 * settings for camremote components. Sources are layered: built-in defaults,
 * an optional configuration file, then environment variables.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// USB vendor ID assigned to Sony Corporation
pub const SONY_VENDOR_ID: u16 = 0x054c;

/// Core configuration for camremote
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Device discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Connection configuration
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (e.g. "info", "camremote_devices=debug")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,

    /// Whether to emit ANSI colors
    #[serde(default = "default_true")]
    pub ansi: bool,
}

/// Device discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// USB vendor ID of the target camera vendor
    #[serde(default = "default_target_vendor_id")]
    pub target_vendor_id: u16,

    /// Model name variants matched against the USB product string
    #[serde(default = "default_model_names")]
    pub model_names: Vec<String>,

    /// Known product IDs, used only when no product string is readable
    #[serde(default = "default_product_ids")]
    pub product_ids: Vec<u16>,

    /// Directories searched, in order, for the raw bus library
    #[serde(default = "default_bus_library_search_roots")]
    pub bus_library_search_roots: Vec<String>,

    /// Library file names tried inside every search root
    #[serde(default = "default_bus_library_names")]
    pub bus_library_names: Vec<String>,

    /// Fall back to the platform's default library search after the roots
    #[serde(default = "default_true")]
    pub bus_library_system_search: bool,

    /// Run the raw bus diagnostics automatically when the vendor backend finds nothing
    #[serde(default = "default_true")]
    pub usb_diagnostics_on_empty: bool,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Ask the vendor backend to reconnect automatically after a link drop
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Control mode requested on connect ("remote" or "contents_transfer")
    #[serde(default = "default_control_mode")]
    pub control_mode: String,

    /// Fetch all device properties right after connecting
    #[serde(default = "default_true")]
    pub preload_properties: bool,

    /// Timeout for blocking vendor calls in milliseconds (0 means no timeout)
    #[serde(default)]
    pub operation_timeout_ms: u64,
}

impl ConnectionConfig {
    /// The operation timeout, if one is configured
    pub fn operation_timeout(&self) -> Option<Duration> {
        match self.operation_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
            ansi: true,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            target_vendor_id: default_target_vendor_id(),
            model_names: default_model_names(),
            product_ids: default_product_ids(),
            bus_library_search_roots: default_bus_library_search_roots(),
            bus_library_names: default_bus_library_names(),
            bus_library_system_search: true,
            usb_diagnostics_on_empty: true,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            control_mode: default_control_mode(),
            preload_properties: true,
            operation_timeout_ms: 0,
        }
    }
}

fn default_app_name() -> String {
    "camremote".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_target_vendor_id() -> u16 {
    SONY_VENDOR_ID
}

fn default_model_names() -> Vec<String> {
    ["ILCE-7M4", "ILCE7M4", "A7M4", "A7 IV", "Alpha 7 IV"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

// Placeholder IDs; real deployments set these from the vendor's device list.
fn default_product_ids() -> Vec<u16> {
    vec![0x0d9f, 0x0da0]
}

fn default_bus_library_search_roots() -> Vec<String> {
    vec![".".to_string(), "libs/libusb/lib".to_string()]
}

fn default_bus_library_names() -> Vec<String> {
    let names: &[&str] = if cfg!(target_os = "windows") {
        &["libusb-1.0.dll"]
    } else if cfg!(target_os = "macos") {
        &["libusb-1.0.0.dylib", "libusb-1.0.dylib"]
    } else {
        &["libusb-1.0.so.0", "libusb-1.0.so"]
    };
    names.iter().map(|s| s.to_string()).collect()
}

fn default_control_mode() -> String {
    "remote".to_string()
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            debug!("Using caller-provided configuration");
            return Ok(config);
        }

        let default_config = Config::default();
        let mut config_builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }
}

impl Config {
    /// Check values that deserialize fine but cannot be used
    pub fn validate(&self) -> Result<()> {
        match self.connection.control_mode.as_str() {
            "remote" | "contents_transfer" => {}
            other => {
                return Err(Error::config(format!(
                    "Unknown connection.control_mode '{}'",
                    other
                )))
            }
        }
        if self.discovery.bus_library_names.is_empty() {
            return Err(Error::config("discovery.bus_library_names must not be empty"));
        }
        Ok(())
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
