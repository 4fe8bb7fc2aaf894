/*!
 * Vendor code spaces.
 *
 * Result codes, property codes and command identifiers used by the vendor
 * camera SDK. Result codes are grouped in 0x100-wide ranges per subsystem,
 * so the coarse category of any code can be found with a range test.
 */
use std::fmt;

use serde::{Deserialize, Serialize};

/// A raw result code returned by the vendor backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VendorCode(pub u32);

impl VendorCode {
    /// Success
    pub const NONE: VendorCode = VendorCode(0x0000);

    /// Generic errors
    pub const GENERIC_UNKNOWN: VendorCode = VendorCode(0x8000);
    /// Generic: not implemented
    pub const GENERIC_NOT_IMPLEMENTED: VendorCode = VendorCode(0x8001);
    /// Generic: aborted
    pub const GENERIC_ABORT: VendorCode = VendorCode(0x8002);
    /// Generic: invalid parameter, usually a backend/firmware version mismatch
    pub const GENERIC_INVALID_PARAMETER: VendorCode = VendorCode(0x8003);

    /// Connection: unknown
    pub const CONNECT_UNKNOWN: VendorCode = VendorCode(0x8200);
    /// Connection: connect call failed
    pub const CONNECT_CONNECT: VendorCode = VendorCode(0x8201);
    /// Connection: release failed
    pub const CONNECT_RELEASE: VendorCode = VendorCode(0x8202);
    /// Connection: property read failed
    pub const CONNECT_GET_PROPERTY: VendorCode = VendorCode(0x8203);
    /// Connection: command send failed
    pub const CONNECT_SEND_COMMAND: VendorCode = VendorCode(0x8204);
    /// Connection: link dropped
    pub const CONNECT_DISCONNECTED: VendorCode = VendorCode(0x8206);
    /// Connection: timed out
    pub const CONNECT_TIMEOUT: VendorCode = VendorCode(0x8207);
    /// Connection: reconnect window elapsed
    pub const CONNECT_RECONNECT_TIMEOUT: VendorCode = VendorCode(0x8208);
    /// Connection: the camera refused the session
    pub const CONNECT_FAIL_REJECTED: VendorCode = VendorCode(0x8209);
    /// Connection: the camera is held by another application
    pub const CONNECT_FAIL_BUSY: VendorCode = VendorCode(0x820a);
    /// Connection: unspecified failure
    pub const CONNECT_FAIL_UNSPECIFIED: VendorCode = VendorCode(0x820b);

    /// Memory allocation failure
    pub const MEMORY_UNKNOWN: VendorCode = VendorCode(0x8300);

    /// API misuse: unknown
    pub const API_UNKNOWN: VendorCode = VendorCode(0x8400);
    /// API misuse: call made in the wrong state
    pub const API_INVALID_CALLED: VendorCode = VendorCode(0x8402);

    /// Initialization failure
    pub const INIT_UNKNOWN: VendorCode = VendorCode(0x8500);

    /// Adapter: unknown
    pub const ADAPTOR_UNKNOWN: VendorCode = VendorCode(0x8700);
    /// Adapter: invalid property
    pub const ADAPTOR_INVALID_PROPERTY: VendorCode = VendorCode(0x8701);
    /// Adapter: could not read device info
    pub const ADAPTOR_GET_INFO: VendorCode = VendorCode(0x8702);
    /// Adapter: could not create adapter
    pub const ADAPTOR_CREATE: VendorCode = VendorCode(0x8703);
    /// Adapter: command send failed
    pub const ADAPTOR_SEND_COMMAND: VendorCode = VendorCode(0x8704);
    /// Adapter: could not create device object
    pub const ADAPTOR_CREATE_DEVICE: VendorCode = VendorCode(0x8706);
    /// Adapter: device enumeration fault (wrong USB mode or exclusive access)
    pub const ADAPTOR_ENUM_DEVICE: VendorCode = VendorCode(0x8707);
    /// Adapter: reset failed
    pub const ADAPTOR_RESET: VendorCode = VendorCode(0x8708);

    /// Device-side failure
    pub const DEVICE_UNKNOWN: VendorCode = VendorCode(0x8800);

    /// Whether the code means success
    pub fn is_success(self) -> bool {
        self == Self::NONE
    }

    /// Coarse category of the code, by range
    pub fn category(self) -> CodeCategory {
        match self.0 {
            0 => CodeCategory::None,
            0x8000..=0x80ff => CodeCategory::Generic,
            0x8100..=0x81ff => CodeCategory::File,
            0x8200..=0x82ff => CodeCategory::Connect,
            0x8300..=0x83ff => CodeCategory::Memory,
            0x8400..=0x84ff => CodeCategory::Api,
            0x8500..=0x85ff => CodeCategory::Init,
            0x8600..=0x86ff => CodeCategory::Polling,
            0x8700..=0x87ff => CodeCategory::Adaptor,
            0x8800..=0x88ff => CodeCategory::Device,
            _ => CodeCategory::Unknown,
        }
    }
}

impl fmt::Display for VendorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl From<u32> for VendorCode {
    fn from(code: u32) -> Self {
        VendorCode(code)
    }
}

/// Vendor subsystem a result code belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeCategory {
    /// Success
    None,
    /// Generic errors
    Generic,
    /// File errors
    File,
    /// Connection errors
    Connect,
    /// Memory errors
    Memory,
    /// API misuse
    Api,
    /// Initialization errors
    Init,
    /// Polling errors
    Polling,
    /// Transport adapter errors
    Adaptor,
    /// Device-side errors
    Device,
    /// Outside every known range
    Unknown,
}

/// Addressable device property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyCode(pub u32);

impl PropertyCode {
    /// Aperture (f-number)
    pub const F_NUMBER: PropertyCode = PropertyCode(0x0100);
    /// Exposure compensation
    pub const EXPOSURE_BIAS_COMPENSATION: PropertyCode = PropertyCode(0x0101);
    /// Flash compensation
    pub const FLASH_COMPENSATION: PropertyCode = PropertyCode(0x0102);
    /// Shutter speed
    pub const SHUTTER_SPEED: PropertyCode = PropertyCode(0x0103);
    /// ISO sensitivity
    pub const ISO_SENSITIVITY: PropertyCode = PropertyCode(0x0104);
    /// Exposure program mode
    pub const EXPOSURE_PROGRAM_MODE: PropertyCode = PropertyCode(0x0105);
    /// White balance
    pub const WHITE_BALANCE: PropertyCode = PropertyCode(0x0107);
    /// Focus mode
    pub const FOCUS_MODE: PropertyCode = PropertyCode(0x0108);

    /// Human-readable name for well-known codes
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::F_NUMBER => "FNumber",
            Self::EXPOSURE_BIAS_COMPENSATION => "ExposureBiasCompensation",
            Self::FLASH_COMPENSATION => "FlashCompensation",
            Self::SHUTTER_SPEED => "ShutterSpeed",
            Self::ISO_SENSITIVITY => "IsoSensitivity",
            Self::EXPOSURE_PROGRAM_MODE => "ExposureProgramMode",
            Self::WHITE_BALANCE => "WhiteBalance",
            Self::FOCUS_MODE => "FocusMode",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for PropertyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:04X})", name, self.0),
            None => write!(f, "0x{:04X}", self.0),
        }
    }
}

/// How the 64-bit payload of a property is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Unsigned 8-bit
    UInt8,
    /// Signed 8-bit
    Int8,
    /// Unsigned 16-bit
    UInt16,
    /// Signed 16-bit
    Int16,
    /// Unsigned 32-bit
    UInt32,
    /// Signed 32-bit
    Int32,
    /// Unsigned 64-bit
    UInt64,
    /// Signed 64-bit
    Int64,
}

/// One device-controllable setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyValue {
    /// Property code
    pub code: PropertyCode,
    /// Payload interpretation
    pub data_type: DataType,
    /// Raw payload
    pub value: u64,
}

impl PropertyValue {
    /// An unsigned 64-bit property record, the only kind pushed to the device
    pub fn unsigned(code: PropertyCode, value: u64) -> Self {
        Self {
            code,
            data_type: DataType::UInt64,
            value,
        }
    }
}

/// Commands accepted by the device command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandId {
    /// Shutter release
    Release,
    /// Movie record toggle
    MovieRecord,
    /// Cancel shooting
    CancelShooting,
}

/// Parameter sent with a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandParam {
    /// Button released
    Up,
    /// Button pressed
    Down,
}
