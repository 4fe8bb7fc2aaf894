/*!
 * Raw USB fallback diagnostics.
 *
 * When the vendor backend finds nothing, the raw bus is walked directly to
 * tell the operator why: is the camera plugged in at all, can this process
 * open it, is it in the right USB mode. This path never connects to
 * anything.
 */
use std::fmt::{self, Debug};

use serde::Serialize;
use tracing::{debug, info, warn};

use camremote_core::config::DiscoveryConfig;

use crate::classifier::DeviceClassifier;
use crate::device::{DeviceAddress, DeviceError, DeviceRecord, Result};
use crate::discovery::TransportEnumerator;

#[cfg(feature = "libusb")]
pub mod libusb;

/// String descriptors read from an opened device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbStrings {
    /// Manufacturer string
    pub manufacturer: Option<String>,
    /// Product string
    pub product: Option<String>,
    /// Serial number string
    pub serial: Option<String>,
}

/// One device as seen on the raw bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBusDevice {
    /// Bus number
    pub bus: u8,
    /// Address on the bus
    pub address: u8,
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// Strings, or why the device could not be opened
    pub strings: std::result::Result<UsbStrings, String>,
}

/// Access to the raw USB bus
pub trait RawBus: Send + Debug {
    /// Bus implementation name
    fn name(&self) -> &str;

    /// List every attached device
    fn scan(&self) -> Result<Vec<RawBusDevice>>;
}

/// Identity of one USB device, produced for diagnostics only
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsbIdentity {
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// Bus number
    pub bus_number: u8,
    /// Address on the bus
    pub device_address: u8,
    /// Manufacturer string
    pub manufacturer: Option<String>,
    /// Product string
    pub product: Option<String>,
    /// Serial number
    pub serial: Option<String>,
    /// Vendor ID matches the target vendor
    pub is_target_vendor: bool,
    /// Known target model
    pub is_target_model: bool,
    /// The device could be opened to read its strings
    pub is_accessible: bool,
}

impl UsbIdentity {
    fn from_raw(device: &RawBusDevice, classifier: &DeviceClassifier) -> Self {
        let strings = device.strings.as_ref().ok().cloned().unwrap_or_default();
        let classification =
            classifier.classify(device.vendor_id, device.product_id, strings.product.as_deref());
        Self {
            vendor_id: device.vendor_id,
            product_id: device.product_id,
            bus_number: device.bus,
            device_address: device.address,
            manufacturer: strings.manufacturer,
            product: strings.product,
            serial: strings.serial,
            is_target_vendor: classification.target_vendor,
            is_target_model: classification.target_model,
            is_accessible: device.strings.is_ok(),
        }
    }

    fn record(&self) -> DeviceRecord {
        DeviceRecord {
            model: self
                .product
                .clone()
                .unwrap_or_else(|| format!("{:04x}:{:04x}", self.vendor_id, self.product_id)),
            serial: self.serial.clone(),
            address: DeviceAddress::Usb {
                bus: self.bus_number,
                address: self.device_address,
            },
        }
    }
}

impl fmt::Display for UsbIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: ID {:04x}:{:04x}",
            self.bus_number, self.device_address, self.vendor_id, self.product_id
        )?;
        if let Some(manufacturer) = &self.manufacturer {
            write!(f, " {}", manufacturer)?;
        }
        if let Some(product) = &self.product {
            write!(f, " {}", product)?;
        }
        if let Some(serial) = &self.serial {
            write!(f, " (serial {})", serial)?;
        }
        if self.is_target_model {
            write!(f, " [target model]")?;
        } else if self.is_target_vendor {
            write!(f, " [target vendor]")?;
        }
        if !self.is_accessible {
            write!(f, " [not accessible]")?;
        }
        Ok(())
    }
}

/// Outcome of one diagnostics run
#[derive(Debug, Clone, Serialize)]
pub struct UsbReport {
    /// Whether a bus library could be loaded
    pub library_available: bool,
    /// Every device on the bus
    pub devices: Vec<UsbIdentity>,
    /// Target-vendor devices that could not be inspected
    pub errors: Vec<String>,
    /// Remediation hints for the operator
    pub hints: Vec<String>,
}

impl fmt::Display for UsbReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.library_available {
            writeln!(f, "USB library not available; raw bus diagnostics skipped")?;
        } else {
            writeln!(f, "USB devices ({}):", self.devices.len())?;
            for device in &self.devices {
                writeln!(f, "  {}", device)?;
            }
        }
        if !self.errors.is_empty() {
            writeln!(f, "Errors:")?;
            for error in &self.errors {
                writeln!(f, "  {}", error)?;
            }
        }
        if !self.hints.is_empty() {
            writeln!(f, "Hints:")?;
            for hint in &self.hints {
                writeln!(f, "  - {}", hint)?;
            }
        }
        Ok(())
    }
}

/// Raw bus fallback enumerator
pub struct UsbDiagnostics {
    bus: Option<Box<dyn RawBus>>,
    classifier: DeviceClassifier,
    devices: Vec<UsbIdentity>,
    records: Vec<DeviceRecord>,
    errors: Vec<String>,
    last_report: Option<UsbReport>,
}

impl UsbDiagnostics {
    /// Diagnostics over an explicit bus; `None` means no bus library
    pub fn new(bus: Option<Box<dyn RawBus>>, classifier: DeviceClassifier) -> Self {
        Self {
            bus,
            classifier,
            devices: Vec::new(),
            records: Vec::new(),
            errors: Vec::new(),
            last_report: None,
        }
    }

    /// Diagnostics over the dynamically loaded bus library, if one can be found
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        let classifier = DeviceClassifier::from_config(config);

        #[cfg(feature = "libusb")]
        let bus = libusb::BusLibraryLoader::from_config(config)
            .load()
            .map(|lib| Box::new(lib) as Box<dyn RawBus>);
        #[cfg(not(feature = "libusb"))]
        let bus: Option<Box<dyn RawBus>> = None;

        Self::new(bus, classifier)
    }

    /// Whether a bus is available
    pub fn is_available(&self) -> bool {
        self.bus.is_some()
    }

    /// Walk the bus and classify every device
    pub fn scan(&mut self) -> Result<&[UsbIdentity]> {
        self.devices.clear();
        self.records.clear();
        self.errors.clear();

        let bus = self.bus.as_ref().ok_or_else(|| {
            DeviceError::DynamicLoad("no USB library could be loaded".to_string())
        })?;
        debug!("Scanning USB bus via {}", bus.name());
        let raw = bus.scan()?;

        for device in &raw {
            let identity = UsbIdentity::from_raw(device, &self.classifier);
            if identity.is_target_vendor {
                if let Err(reason) = &device.strings {
                    let message = format!(
                        "Cannot open {:04x}:{:04x} on bus {:03} address {:03}: {}",
                        device.vendor_id, device.product_id, device.bus, device.address, reason
                    );
                    warn!("{}", message);
                    self.errors.push(message);
                }
                info!("Target-vendor USB device: {}", identity);
            }
            self.records.push(identity.record());
            self.devices.push(identity);
        }

        debug!("USB scan found {} device(s)", self.devices.len());
        Ok(&self.devices)
    }

    /// Devices from the last scan
    pub fn devices(&self) -> &[UsbIdentity] {
        &self.devices
    }

    /// Target-vendor devices from the last scan
    pub fn target_devices(&self) -> impl Iterator<Item = &UsbIdentity> {
        self.devices.iter().filter(|d| d.is_target_vendor)
    }

    /// Errors from the last scan
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Remediation hints, given how many cameras the vendor backend found
    pub fn hints(&self, sdk_device_count: usize) -> Vec<String> {
        let mut hints = Vec::new();
        if !self.is_available() {
            hints.push("install libusb-1.0 or place it next to the executable".to_string());
            return hints;
        }

        if !self.errors.is_empty() {
            let advice = if cfg!(target_os = "windows") {
                "the camera could not be opened; check that the vendor driver is installed"
            } else if cfg!(target_os = "linux") {
                "the camera could not be opened; add a udev rule granting access to the vendor ID, then replug"
            } else {
                "the camera could not be opened; check USB permissions"
            };
            hints.push(advice.to_string());
        }

        let presumed = self
            .devices
            .iter()
            .filter(|d| self.classifier.presumed_camera(d.vendor_id))
            .count();
        if presumed == 0 {
            hints.push(
                "no camera on the bus; check the cable and that the camera is powered on".to_string(),
            );
        } else if sdk_device_count == 0 {
            hints.push(
                "a camera is attached but the SDK sees none; set USB mode to PC Remote and close other applications using it"
                    .to_string(),
            );
        }
        hints
    }

    /// Report of the last scan
    pub fn report(&self, sdk_device_count: usize) -> UsbReport {
        UsbReport {
            library_available: self.is_available(),
            devices: self.devices.clone(),
            errors: self.errors.clone(),
            hints: self.hints(sdk_device_count),
        }
    }

    /// Build the report of the last scan and keep it
    pub fn record_report(&mut self, sdk_device_count: usize) -> &UsbReport {
        let report = self.report(sdk_device_count);
        self.last_report.insert(report)
    }

    /// The report kept by the last [`record_report`](Self::record_report)
    pub fn last_report(&self) -> Option<&UsbReport> {
        self.last_report.as_ref()
    }
}

impl Debug for UsbDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbDiagnostics")
            .field("bus", &self.bus.as_ref().map(|b| b.name().to_string()))
            .field("devices", &self.devices.len())
            .field("errors", &self.errors.len())
            .finish()
    }
}

impl TransportEnumerator for UsbDiagnostics {
    fn name(&self) -> &'static str {
        "usb"
    }

    fn enumerate(&mut self) -> Result<&[DeviceRecord]> {
        if self.scan()?.is_empty() {
            return Err(DeviceError::EmptyResult);
        }
        Ok(&self.records)
    }

    fn records(&self) -> &[DeviceRecord] {
        &self.records
    }

    fn clear(&mut self) {
        self.devices.clear();
        self.records.clear();
        self.errors.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use camremote_core::config::SONY_VENDOR_ID;

    /// A fixed bus for tests
    #[derive(Debug, Default)]
    pub(crate) struct FixedBus(pub Vec<RawBusDevice>);

    impl RawBus for FixedBus {
        fn name(&self) -> &str {
            "fixed"
        }

        fn scan(&self) -> Result<Vec<RawBusDevice>> {
            Ok(self.0.clone())
        }
    }

    /// A fixed bus that counts how often it was walked
    #[derive(Debug, Default)]
    pub(crate) struct CountingBus {
        pub devices: Vec<RawBusDevice>,
        pub scans: Arc<AtomicUsize>,
    }

    impl RawBus for CountingBus {
        fn name(&self) -> &str {
            "counting"
        }

        fn scan(&self) -> Result<Vec<RawBusDevice>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            Ok(self.devices.clone())
        }
    }

    pub(crate) fn camera(product: &str) -> RawBusDevice {
        RawBusDevice {
            bus: 1,
            address: 7,
            vendor_id: SONY_VENDOR_ID,
            product_id: 0x0d9f,
            strings: Ok(UsbStrings {
                manufacturer: Some("Sony".to_string()),
                product: Some(product.to_string()),
                serial: Some("D12345".to_string()),
            }),
        }
    }

    fn hub() -> RawBusDevice {
        RawBusDevice {
            bus: 1,
            address: 1,
            vendor_id: 0x1d6b,
            product_id: 0x0002,
            strings: Err("LIBUSB_ERROR_ACCESS".to_string()),
        }
    }

    fn diagnostics(devices: Vec<RawBusDevice>) -> UsbDiagnostics {
        UsbDiagnostics::new(
            Some(Box::new(FixedBus(devices))),
            DeviceClassifier::default(),
        )
    }

    #[test]
    fn test_scan_classifies_devices() {
        let mut usb = diagnostics(vec![hub(), camera("ILCE-7M4")]);
        let devices = usb.scan().unwrap();
        assert_eq!(devices.len(), 2);
        assert!(!devices[0].is_target_vendor);
        assert!(devices[1].is_target_model);
        assert_eq!(usb.target_devices().count(), 1);
        // the hub is not ours, so its access failure is not reported
        assert!(usb.errors().is_empty());
    }

    #[test]
    fn test_inaccessible_target_is_recorded_without_aborting() {
        let mut locked = camera("ILCE-7M4");
        locked.strings = Err("LIBUSB_ERROR_ACCESS".to_string());
        let mut usb = diagnostics(vec![locked, hub()]);

        let devices = usb.scan().unwrap();
        assert_eq!(devices.len(), 2);
        assert!(!devices[0].is_accessible);
        // no string: falls back to the product ID table
        assert!(devices[0].is_target_model);
        assert_eq!(usb.errors().len(), 1);
        assert!(usb.errors()[0].contains("LIBUSB_ERROR_ACCESS"));

        let report = usb.report(0);
        assert!(report.hints.iter().any(|h| h.contains("could not be opened")));
        assert!(report.to_string().contains("[not accessible]"));
    }

    #[test]
    fn test_hints_for_wrong_mode_and_missing_camera() {
        let mut usb = diagnostics(vec![camera("ILCE-7M4")]);
        usb.scan().unwrap();
        assert!(usb.hints(0).iter().any(|h| h.contains("PC Remote")));
        assert!(usb.hints(1).is_empty());

        let mut usb = diagnostics(vec![hub()]);
        usb.scan().unwrap();
        assert!(usb.hints(0).iter().any(|h| h.contains("check the cable")));
    }

    #[test]
    fn test_unavailable_library() {
        let mut usb = UsbDiagnostics::new(None, DeviceClassifier::default());
        assert!(matches!(usb.scan(), Err(DeviceError::DynamicLoad(_))));
        let report = usb.report(0);
        assert!(!report.library_available);
        assert_eq!(report.hints.len(), 1);
    }

    #[test]
    fn test_enumerator_records() {
        let mut usb = diagnostics(vec![camera("ILCE-7M4")]);
        let records = usb.enumerate().unwrap();
        assert_eq!(records[0].model, "ILCE-7M4");
        assert_eq!(
            records[0].address,
            DeviceAddress::Usb { bus: 1, address: 7 }
        );

        let mut empty = diagnostics(vec![]);
        assert!(matches!(empty.enumerate(), Err(DeviceError::EmptyResult)));
    }

    #[test]
    fn test_recorded_report_is_kept() {
        let scans = Arc::new(AtomicUsize::new(0));
        let mut usb = UsbDiagnostics::new(
            Some(Box::new(CountingBus {
                devices: vec![camera("ILCE-7M4")],
                scans: scans.clone(),
            })),
            DeviceClassifier::default(),
        );
        assert!(usb.last_report().is_none());

        usb.scan().unwrap();
        assert_eq!(usb.record_report(0).devices.len(), 1);
        let kept = usb.last_report().unwrap();
        assert!(kept.to_string().contains("ILCE-7M4"));
        assert_eq!(scans.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_report_serializes() {
        let mut usb = diagnostics(vec![camera("ILCE-7M4")]);
        usb.scan().unwrap();
        let json = serde_json::to_value(usb.report(1)).unwrap();
        assert_eq!(json["devices"][0]["vendor_id"], SONY_VENDOR_ID);
        assert_eq!(json["library_available"], true);
    }
}
