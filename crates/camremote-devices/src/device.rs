/*!
 * Device records, connection states, events and the device error taxonomy.
 *
 * This module defines the core types shared by the enumerators, the
 * connection state machine and the lifecycle façade.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use camremote_core::{error::Error as CoreError, event::Severity};

use crate::codes::{CodeCategory, CommandId, PropertyCode, VendorCode};

/// Coarse classification of a failed vendor enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnumerationFault {
    /// Connection-class fault
    ConnectionFault,
    /// Adapter-class fault
    AdapterFault,
    /// Adapter enumeration fault: camera in the wrong USB mode, or held
    /// exclusively by another process
    AdapterEnumerationFault,
    /// Anything else
    Unclassified,
}

impl EnumerationFault {
    /// Classify a vendor code returned by enumeration
    pub fn classify(code: VendorCode) -> Self {
        if code == VendorCode::ADAPTOR_ENUM_DEVICE {
            return EnumerationFault::AdapterEnumerationFault;
        }
        match code.category() {
            CodeCategory::Connect => EnumerationFault::ConnectionFault,
            CodeCategory::Adaptor => EnumerationFault::AdapterFault,
            _ => EnumerationFault::Unclassified,
        }
    }

    /// Actionable hint for a human operator
    pub fn hint(self) -> &'static str {
        match self {
            EnumerationFault::ConnectionFault => "check the cable and that the camera is powered on",
            EnumerationFault::AdapterFault => "the transport adapter failed; reconnect the camera",
            EnumerationFault::AdapterEnumerationFault => {
                "set the camera USB mode to PC Remote and close other applications using it"
            }
            EnumerationFault::Unclassified => "see the vendor code for details",
        }
    }
}

impl fmt::Display for EnumerationFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnumerationFault::ConnectionFault => "connection fault",
            EnumerationFault::AdapterFault => "adapter fault",
            EnumerationFault::AdapterEnumerationFault => "adapter enumeration fault",
            EnumerationFault::Unclassified => "unclassified fault",
        };
        f.write_str(s)
    }
}

/// Diagnosed cause of a failed connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectFault {
    /// The camera refused the session
    Rejected,
    /// The camera is held by another application
    Busy,
    /// Invalid parameter, most likely a backend/firmware version mismatch
    InvalidParameter,
    /// Anything else
    Unclassified,
}

impl ConnectFault {
    /// Classify a vendor code returned by connect
    pub fn classify(code: VendorCode) -> Self {
        match code {
            VendorCode::CONNECT_FAIL_REJECTED => ConnectFault::Rejected,
            VendorCode::CONNECT_FAIL_BUSY => ConnectFault::Busy,
            VendorCode::GENERIC_INVALID_PARAMETER => ConnectFault::InvalidParameter,
            _ => ConnectFault::Unclassified,
        }
    }
}

impl fmt::Display for ConnectFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectFault::Rejected => "rejected by device",
            ConnectFault::Busy => "device busy or held by another application",
            ConnectFault::InvalidParameter => "invalid parameter (likely version mismatch)",
            ConnectFault::Unclassified => "unclassified failure",
        };
        f.write_str(s)
    }
}

/// Why a property fetch failed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyFetchFault {
    /// The transport call failed
    #[error("transport error {0}")]
    Transport(VendorCode),
    /// The transport call succeeded but returned no properties
    #[error("device returned no properties")]
    EmptyResult,
}

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The vendor backend could not be initialized; the component is unusable
    #[error("Vendor backend initialization failed ({0})")]
    InitFailure(VendorCode),

    /// Enumeration failed
    #[error("Enumeration failed: {kind} ({code})")]
    Enumeration {
        /// Diagnosed category
        kind: EnumerationFault,
        /// Raw vendor code
        code: VendorCode,
    },

    /// Enumeration succeeded but found no devices
    #[error("No cameras found")]
    EmptyResult,

    /// The device index is outside the current device list
    #[error("Device index {index} out of range ({count} device(s) enumerated)")]
    IndexOutOfRange {
        /// Requested index
        index: usize,
        /// Number of enumerated devices
        count: usize,
    },

    /// A connection is already live
    #[error("Already connected to a camera")]
    AlreadyConnected,

    /// No connection is live
    #[error("Not connected to any camera")]
    NotConnected,

    /// Connect failed
    #[error("Connect failed: {kind} ({code})")]
    Connect {
        /// Diagnosed cause
        kind: ConnectFault,
        /// Raw vendor code
        code: VendorCode,
    },

    /// Disconnect failed
    #[error("Disconnect failed ({code})")]
    Disconnect {
        /// Raw vendor code
        code: VendorCode,
    },

    /// Device release failed
    #[error("Device release failed ({code})")]
    Release {
        /// Raw vendor code
        code: VendorCode,
    },

    /// Property fetch failed
    #[error("Failed to get {}: {fault}", describe_codes(.codes))]
    PropertyFetch {
        /// Requested properties; empty means all of them
        codes: Vec<PropertyCode>,
        /// Why it failed
        fault: PropertyFetchFault,
    },

    /// Property push failed
    #[error("Failed to set property {property} ({code})")]
    PropertySet {
        /// Target property
        property: PropertyCode,
        /// Raw vendor code
        code: VendorCode,
    },

    /// Command failed
    #[error("Command {command:?} failed ({code})")]
    Command {
        /// Command sent
        command: CommandId,
        /// Raw vendor code
        code: VendorCode,
    },

    /// The raw bus library could not be loaded
    #[error("Bus library unavailable: {0}")]
    DynamicLoad(String),

    /// The raw bus scan failed
    #[error("Bus scan failed: {0}")]
    BusScan(String),

    /// A human-unit value could not be encoded
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Used before setup or after exit
    #[error("Lifecycle violation: {0}")]
    Lifecycle(&'static str),

    /// A blocking vendor call exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(CoreError),
}

impl From<CoreError> for DeviceError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Timeout(msg) => DeviceError::Timeout(msg),
            CoreError::Config(msg) => DeviceError::Configuration(msg),
            other => DeviceError::Core(other),
        }
    }
}

impl DeviceError {
    /// Whether the component is unusable after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeviceError::InitFailure(_))
    }

    /// The raw vendor code behind this error, if any
    pub fn vendor_code(&self) -> Option<VendorCode> {
        match self {
            DeviceError::InitFailure(code)
            | DeviceError::Enumeration { code, .. }
            | DeviceError::Connect { code, .. }
            | DeviceError::Disconnect { code }
            | DeviceError::Release { code }
            | DeviceError::PropertySet { code, .. }
            | DeviceError::Command { code, .. } => Some(*code),
            DeviceError::PropertyFetch {
                fault: PropertyFetchFault::Transport(code),
                ..
            } => Some(*code),
            _ => None,
        }
    }

    /// Severity used when logging this error
    pub fn severity(&self) -> Severity {
        match self {
            DeviceError::EmptyResult => Severity::Notice,
            DeviceError::Release { .. } | DeviceError::DynamicLoad(_) => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

fn describe_codes(codes: &[PropertyCode]) -> String {
    if codes.is_empty() {
        return "all properties".to_string();
    }
    let names: Vec<String> = codes.iter().map(ToString::to_string).collect();
    format!("property {}", names.join(", "))
}

/// Backend-specific location of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceAddress {
    /// Slot in the vendor backend's enumeration result
    Sdk {
        /// Position in the enumeration result
        slot: usize,
        /// Transport reported by the backend ("usb", "ethernet", ...)
        transport: String,
    },
    /// Raw bus location
    Usb {
        /// Bus number
        bus: u8,
        /// Device address on the bus
        address: u8,
    },
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAddress::Sdk { slot, transport } => write!(f, "{}#{}", transport, slot),
            DeviceAddress::Usb { bus, address } => write!(f, "bus {:03} address {:03}", bus, address),
        }
    }
}

/// A device as reported by an enumeration backend
///
/// Records live inside the enumerator that produced them and are only ever
/// lent out; re-running enumeration drops them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Display model name
    pub model: String,
    /// Stable identifier or serial, when the backend exposes it at enumeration time
    pub serial: Option<String>,
    /// Backend-specific address
    pub address: DeviceAddress,
}

impl DeviceRecord {
    /// Create a record for a vendor backend slot
    pub fn sdk<S: Into<String>>(model: S, slot: usize, transport: &str) -> Self {
        Self {
            model: model.into(),
            serial: None,
            address: DeviceAddress::Sdk {
                slot,
                transport: transport.to_string(),
            },
        }
    }

    /// Attach a serial
    pub fn with_serial<S: Into<String>>(mut self, serial: S) -> Self {
        self.serial = Some(serial.into());
        self
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.model, self.address)?;
        if let Some(serial) = &self.serial {
            write!(f, " serial {}", serial)?;
        }
        Ok(())
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Connection live
    Connected,
    /// Disconnect in progress
    Disconnecting,
    /// Connect failed; reported, then the machine returns to `Disconnected`
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Link status as last reported by the backend's notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatus {
    /// No notification received for the current connection yet
    Pending,
    /// The backend reported the link up
    Up {
        /// Protocol version reported by the backend
        version: u32,
    },
    /// The backend reported the link down; it may reconnect on its own
    Down {
        /// Reason code reported by the backend
        reason: VendorCode,
    },
}

/// Events published on the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CameraEvent {
    /// The connection state machine moved
    StateChanged {
        /// The old state
        old_state: ConnectionState,
        /// The new state
        new_state: ConnectionState,
    },
    /// The backend reported the link up
    Connected {
        /// Protocol version
        version: u32,
    },
    /// The backend reported the link down
    Disconnected {
        /// Reason code
        reason: VendorCode,
    },
    /// Device properties changed; empty means "unknown set"
    PropertiesChanged {
        /// Changed codes
        codes: Vec<PropertyCode>,
    },
    /// A file finished downloading
    DownloadComplete {
        /// File name on the host
        filename: String,
    },
    /// A backend warning
    Warning {
        /// Warning code
        code: VendorCode,
    },
    /// A backend error
    Error {
        /// Error code
        code: VendorCode,
    },
}

impl CameraEvent {
    /// Severity of the event
    pub fn severity(&self) -> Severity {
        match self {
            CameraEvent::StateChanged {
                new_state: ConnectionState::Failed,
                ..
            }
            | CameraEvent::Error { .. } => Severity::Error,
            CameraEvent::Warning { .. } | CameraEvent::Disconnected { .. } => Severity::Warning,
            _ => Severity::Notice,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumeration_fault_classification() {
        assert_eq!(
            EnumerationFault::classify(VendorCode::ADAPTOR_ENUM_DEVICE),
            EnumerationFault::AdapterEnumerationFault
        );
        assert_eq!(
            EnumerationFault::classify(VendorCode::ADAPTOR_CREATE),
            EnumerationFault::AdapterFault
        );
        assert_eq!(
            EnumerationFault::classify(VendorCode::CONNECT_TIMEOUT),
            EnumerationFault::ConnectionFault
        );
        assert_eq!(
            EnumerationFault::classify(VendorCode::MEMORY_UNKNOWN),
            EnumerationFault::Unclassified
        );
    }

    #[test]
    fn test_connect_fault_classification() {
        assert_eq!(
            ConnectFault::classify(VendorCode::CONNECT_FAIL_REJECTED),
            ConnectFault::Rejected
        );
        assert_eq!(ConnectFault::classify(VendorCode::CONNECT_FAIL_BUSY), ConnectFault::Busy);
        assert_eq!(
            ConnectFault::classify(VendorCode::GENERIC_INVALID_PARAMETER),
            ConnectFault::InvalidParameter
        );
        assert_eq!(
            ConnectFault::classify(VendorCode::CONNECT_TIMEOUT),
            ConnectFault::Unclassified
        );
    }

    #[test]
    fn test_error_helpers() {
        let err = DeviceError::Connect {
            kind: ConnectFault::Busy,
            code: VendorCode::CONNECT_FAIL_BUSY,
        };
        assert_eq!(err.vendor_code(), Some(VendorCode::CONNECT_FAIL_BUSY));
        assert!(!err.is_fatal());
        assert_eq!(err.severity(), Severity::Error);

        assert!(DeviceError::InitFailure(VendorCode::INIT_UNKNOWN).is_fatal());
        assert_eq!(DeviceError::EmptyResult.severity(), Severity::Notice);
        assert_eq!(
            DeviceError::Release {
                code: VendorCode::CONNECT_RELEASE
            }
            .severity(),
            Severity::Warning
        );
        assert_eq!(DeviceError::NotConnected.vendor_code(), None);
    }

    #[test]
    fn test_property_fetch_message() {
        let err = DeviceError::PropertyFetch {
            codes: vec![PropertyCode::ISO_SENSITIVITY],
            fault: PropertyFetchFault::EmptyResult,
        };
        assert_eq!(
            err.to_string(),
            "Failed to get property IsoSensitivity (0x0104): device returned no properties"
        );
        assert_eq!(err.vendor_code(), None);

        let err = DeviceError::PropertyFetch {
            codes: vec![],
            fault: PropertyFetchFault::Transport(VendorCode::CONNECT_GET_PROPERTY),
        };
        assert!(err.to_string().starts_with("Failed to get all properties"));
        assert_eq!(err.vendor_code(), Some(VendorCode::CONNECT_GET_PROPERTY));
    }

    #[test]
    fn test_core_timeout_maps_to_device_timeout() {
        let err: DeviceError = CoreError::timeout("connect").into();
        assert!(matches!(err, DeviceError::Timeout(_)));
    }

    #[test]
    fn test_record_display() {
        let record = DeviceRecord::sdk("ILCE-7M4", 0, "usb").with_serial("4711");
        assert_eq!(record.to_string(), "ILCE-7M4 [usb#0] serial 4711");
    }
}
