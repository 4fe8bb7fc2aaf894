/*!
 * Device discovery for camremote.
 *
 * This module provides the transport enumerators. The SDK enumerator asks the
 * vendor backend for connectable cameras; the raw bus fallback (see
 * [`crate::usb`]) only diagnoses. Both keep the current device list
 * themselves and lend it out by reference.
 */
use std::fmt::{self, Debug};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::backend::{CameraBackend, EnumerationToken, RawEnumeration};
use crate::device::{DeviceError, DeviceRecord, EnumerationFault, Result};

/// Common interface of the enumeration backends
pub trait TransportEnumerator: Send + Debug {
    /// Enumerator name for logs
    fn name(&self) -> &'static str;

    /// Run a fresh enumeration, dropping the previous result first
    ///
    /// The returned slice borrows the enumerator, so records from an earlier
    /// run cannot outlive the next one.
    fn enumerate(&mut self) -> Result<&[DeviceRecord]>;

    /// The current device list, empty before the first successful run
    fn records(&self) -> &[DeviceRecord];

    /// Drop the current result
    fn clear(&mut self);

    /// Number of devices in the current list
    fn len(&self) -> usize {
        self.records().len()
    }

    /// Whether the current list is empty
    fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

/// Owns one backend enumeration result and hands the token back on drop
struct EnumerationGuard {
    backend: Arc<dyn CameraBackend>,
    token: Option<EnumerationToken>,
    records: Vec<DeviceRecord>,
}

impl EnumerationGuard {
    fn new(backend: Arc<dyn CameraBackend>, raw: RawEnumeration) -> Self {
        Self {
            backend,
            token: Some(raw.token),
            records: raw.records,
        }
    }
}

impl Drop for EnumerationGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            debug!("Releasing enumeration result ({} device(s))", self.records.len());
            self.backend.release_enumeration(token);
        }
    }
}

/// Enumerator backed by the vendor SDK
///
/// Records are lent by borrow; holding one across a re-enumeration does not
/// compile:
///
/// ```compile_fail
/// use std::sync::Arc;
/// use camremote_devices::discovery::{SdkEnumerator, TransportEnumerator};
/// use camremote_devices::simulated::SimulatedBackend;
///
/// let mut enumerator = SdkEnumerator::new(Arc::new(SimulatedBackend::new()));
/// let first = enumerator.enumerate().unwrap();
/// let _second = enumerator.enumerate();
/// println!("{}", first[0].model);
/// ```
pub struct SdkEnumerator {
    backend: Arc<dyn CameraBackend>,
    current: Option<EnumerationGuard>,
}

impl SdkEnumerator {
    /// Create an enumerator over an initialized backend
    pub fn new(backend: Arc<dyn CameraBackend>) -> Self {
        Self {
            backend,
            current: None,
        }
    }

    /// Record at `index` in the current list
    pub fn get(&self, index: usize) -> Option<&DeviceRecord> {
        self.records().get(index)
    }
}

impl Debug for SdkEnumerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdkEnumerator")
            .field("backend", &self.backend.name())
            .field("devices", &self.len())
            .finish()
    }
}

impl TransportEnumerator for SdkEnumerator {
    fn name(&self) -> &'static str {
        "sdk"
    }

    fn enumerate(&mut self) -> Result<&[DeviceRecord]> {
        self.clear();

        let raw = match self.backend.enumerate() {
            Ok(raw) => raw,
            Err(code) => {
                let kind = EnumerationFault::classify(code);
                error!("Enumeration failed: {} ({}); {}", kind, code, kind.hint());
                return Err(DeviceError::Enumeration { kind, code });
            }
        };

        let guard = EnumerationGuard::new(self.backend.clone(), raw);
        if guard.records.is_empty() {
            info!("No cameras found");
            return Err(DeviceError::EmptyResult);
        }

        for (index, record) in guard.records.iter().enumerate() {
            info!("Found camera {}: {}", index, record);
        }
        Ok(&self.current.insert(guard).records)
    }

    fn records(&self) -> &[DeviceRecord] {
        self.current
            .as_ref()
            .map(|guard| guard.records.as_slice())
            .unwrap_or(&[])
    }

    fn clear(&mut self) {
        if self.current.take().is_some() {
            debug!("Previous enumeration result dropped");
        }
    }
}
