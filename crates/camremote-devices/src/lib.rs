/*!
 * camremote devices
 *
 * Camera discovery, connection management, property access and event
 * dispatch on top of a vendor remote-control backend, plus raw USB bus
 * diagnostics for when the backend finds nothing.
 */

#![warn(missing_docs)]

// Re-export core types
pub use camremote_core::prelude;

pub mod backend;
pub mod camera;
pub mod classifier;
pub mod codes;
pub mod connection;
pub mod device;
pub mod discovery;
pub mod dispatch;
pub mod property;
pub mod simulated;
pub mod units;
pub mod usb;

pub use backend::{CameraBackend, ControlMode, Notification, NotificationSink, ReconnectPolicy};
pub use camera::{CameraRemote, Lifecycle, SharedCamera};
pub use classifier::{Classification, DeviceClassifier};
pub use codes::{CommandId, CommandParam, PropertyCode, PropertyValue, VendorCode};
pub use connection::{ConnectOptions, ConnectionHandle, ConnectionManager};
pub use device::{
    CameraEvent, ConnectionState, DeviceAddress, DeviceError, DeviceRecord, LinkStatus,
};
pub use discovery::{SdkEnumerator, TransportEnumerator};
pub use simulated::{SimulatedBackend, SimulatedCamera};
pub use units::{PlaceholderEncoder, UnitEncoder};
pub use usb::{UsbDiagnostics, UsbIdentity, UsbReport};

/// camremote devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device layer
pub fn init() -> Result<(), camremote_core::error::Error> {
    tracing::info!("camremote devices {} initialized", VERSION);
    Ok(())
}

/// Transports this build can enumerate cameras over
pub fn available_transports() -> Vec<&'static str> {
    #[allow(unused_mut)]
    let mut transports = vec!["sdk"];

    #[cfg(feature = "libusb")]
    transports.push("usb");

    transports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transports() {
        let transports = available_transports();
        assert_eq!(transports[0], "sdk");
        assert_eq!(transports.contains(&"usb"), cfg!(feature = "libusb"));
    }
}
