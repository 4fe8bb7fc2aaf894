/*!
 * The vendor backend seam.
 *
 * `CameraBackend` is the narrow surface of the vendor camera SDK the rest of
 * the crate talks to. Every call is blocking and may take seconds. Resources
 * the backend lends out (enumeration results, property buffers) come with a
 * token that must be handed back exactly once.
 */
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codes::{CommandId, CommandParam, PropertyCode, PropertyValue, VendorCode};
use crate::device::{DeviceError, DeviceRecord};

/// Opaque identifier of a connected device inside the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle(pub u64);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

/// Session mode requested on connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    /// Remote control (shooting, property access)
    Remote,
    /// Contents transfer (file download)
    ContentsTransfer,
}

impl FromStr for ControlMode {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote" => Ok(ControlMode::Remote),
            "contents_transfer" => Ok(ControlMode::ContentsTransfer),
            other => Err(DeviceError::Configuration(format!(
                "unknown control mode '{}'",
                other
            ))),
        }
    }
}

/// Whether the backend reconnects on its own after a link drop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconnectPolicy {
    /// Reconnect automatically
    On,
    /// Stay down
    Off,
}

impl From<bool> for ReconnectPolicy {
    fn from(enabled: bool) -> Self {
        if enabled {
            ReconnectPolicy::On
        } else {
            ReconnectPolicy::Off
        }
    }
}

/// Token for an enumeration result owned by the backend
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct EnumerationToken(pub u64);

/// An enumeration result: the records plus the token to release them with
#[derive(Debug)]
pub struct RawEnumeration {
    /// Release token
    pub token: EnumerationToken,
    /// Devices found, in backend order
    pub records: Vec<DeviceRecord>,
}

/// Token for a property buffer owned by the backend
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct BufferToken(pub u64);

/// A property buffer: the values plus the token to release them with
#[derive(Debug)]
pub struct RawPropertyBuffer {
    /// Release token
    pub token: BufferToken,
    /// Property records, possibly empty
    pub properties: Vec<PropertyValue>,
}

/// A notification raised by the backend on one of its own threads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Link up
    Connected {
        /// Protocol version
        version: u32,
    },
    /// Link down
    Disconnected {
        /// Reason code
        reason: VendorCode,
    },
    /// Some properties changed, set unknown
    PropertyChanged,
    /// These properties changed
    PropertyChangedCodes(Vec<PropertyCode>),
    /// Some live view properties changed, set unknown
    LiveViewPropertyChanged,
    /// These live view properties changed
    LiveViewPropertyChangedCodes(Vec<PropertyCode>),
    /// A file download finished
    DownloadComplete {
        /// Host file name
        filename: String,
        /// Backend file kind
        kind: u32,
    },
    /// Contents transfer progress
    ContentsTransfer {
        /// Backend notify code
        notify: u32,
        /// Content handle
        handle: u64,
        /// Host file name, if any
        filename: Option<String>,
    },
    /// Backend warning
    Warning(VendorCode),
    /// Backend error
    Error(VendorCode),
}

impl Notification {
    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Connected { .. } => "connected",
            Notification::Disconnected { .. } => "disconnected",
            Notification::PropertyChanged | Notification::PropertyChangedCodes(_) => {
                "property_changed"
            }
            Notification::LiveViewPropertyChanged
            | Notification::LiveViewPropertyChangedCodes(_) => "lv_property_changed",
            Notification::DownloadComplete { .. } => "download_complete",
            Notification::ContentsTransfer { .. } => "contents_transfer",
            Notification::Warning(_) => "warning",
            Notification::Error(_) => "error",
        }
    }
}

/// Receiver of backend notifications
///
/// Implementations are called from backend-owned threads, possibly while a
/// connect call is still in flight, and must not block.
pub trait NotificationSink: Send + Sync {
    /// Deliver one notification
    fn notify(&self, notification: Notification);
}

/// Blocking interface to the vendor camera SDK
pub trait CameraBackend: Send + Sync + fmt::Debug {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Initialize the backend; must precede every other call
    fn init(&self) -> Result<(), VendorCode>;

    /// Tear the backend down; safe to call after a failed init
    fn release(&self);

    /// Backend version, packed as major << 24 | minor << 16 | patch << 8
    fn sdk_version(&self) -> u32;

    /// Enumerate attached cameras
    fn enumerate(&self) -> Result<RawEnumeration, VendorCode>;

    /// Return an enumeration result to the backend
    fn release_enumeration(&self, token: EnumerationToken);

    /// Connect to a device; notifications flow into `sink` from here on
    fn connect(
        &self,
        record: &DeviceRecord,
        sink: Arc<dyn NotificationSink>,
        mode: ControlMode,
        reconnect: ReconnectPolicy,
    ) -> Result<DeviceHandle, VendorCode>;

    /// Close the session
    fn disconnect(&self, device: DeviceHandle) -> Result<(), VendorCode>;

    /// Free the backend's per-device resources
    fn release_device(&self, device: DeviceHandle) -> Result<(), VendorCode>;

    /// Send a command
    fn send_command(
        &self,
        device: DeviceHandle,
        command: CommandId,
        param: CommandParam,
    ) -> Result<(), VendorCode>;

    /// Fetch every property
    fn get_device_properties(&self, device: DeviceHandle) -> Result<RawPropertyBuffer, VendorCode>;

    /// Fetch the listed properties
    fn get_select_device_properties(
        &self,
        device: DeviceHandle,
        codes: &[PropertyCode],
    ) -> Result<RawPropertyBuffer, VendorCode>;

    /// Return a property buffer to the backend
    fn release_device_properties(&self, device: DeviceHandle, token: BufferToken);

    /// Push one property
    fn set_device_property(
        &self,
        device: DeviceHandle,
        property: PropertyValue,
    ) -> Result<(), VendorCode>;
}

/// Render a packed backend version as "major.minor.patch"
pub fn format_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        (version >> 24) & 0xff,
        (version >> 16) & 0xff,
        (version >> 8) & 0xff
    )
}
