/*!
 * Property store access.
 *
 * Reads go through the backend's batch fetch and land in a small cache;
 * property-changed notifications only mark cache entries stale. Every
 * buffer the backend lends out is returned by a guard on all exit paths.
 */
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, trace};

use crate::backend::{BufferToken, CameraBackend, DeviceHandle, RawPropertyBuffer};
use crate::codes::{PropertyCode, PropertyValue, VendorCode};
use crate::device::{DeviceError, PropertyFetchFault, Result};

/// A backend property buffer, returned to the backend on drop
struct PropertyBufferGuard<'a> {
    backend: &'a dyn CameraBackend,
    device: DeviceHandle,
    token: Option<BufferToken>,
    properties: Vec<PropertyValue>,
}

impl<'a> PropertyBufferGuard<'a> {
    fn new(backend: &'a dyn CameraBackend, device: DeviceHandle, raw: RawPropertyBuffer) -> Self {
        Self {
            backend,
            device,
            token: Some(raw.token),
            properties: raw.properties,
        }
    }
}

impl Drop for PropertyBufferGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            trace!("Releasing property buffer of {}", self.device);
            self.backend.release_device_properties(self.device, token);
        }
    }
}

/// A cached property value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CachedProperty {
    /// Last value read from the device
    pub value: PropertyValue,
    /// The device reported a change since the value was read
    pub stale: bool,
    /// When the value was read
    pub fetched_at: DateTime<Utc>,
}

/// Property access for one connection, with a read cache
#[derive(Debug, Default)]
pub struct PropertyStore {
    cache: HashMap<PropertyCode, CachedProperty>,
}

impl PropertyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn fetch_buffer<'a>(
        backend: &'a dyn CameraBackend,
        device: DeviceHandle,
        codes: &[PropertyCode],
    ) -> Result<PropertyBufferGuard<'a>> {
        let raw = if codes.is_empty() {
            backend.get_device_properties(device)
        } else {
            backend.get_select_device_properties(device, codes)
        };
        let fail = |fault| DeviceError::PropertyFetch {
            codes: codes.to_vec(),
            fault,
        };

        let guard = match raw {
            Ok(raw) => PropertyBufferGuard::new(backend, device, raw),
            Err(code) => {
                error!("Property fetch failed: {}", code);
                return Err(fail(PropertyFetchFault::Transport(code)));
            }
        };
        if guard.properties.is_empty() {
            error!("Property fetch returned no properties");
            return Err(fail(PropertyFetchFault::EmptyResult));
        }
        Ok(guard)
    }

    fn remember(&mut self, properties: &[PropertyValue]) {
        let now = Utc::now();
        for property in properties {
            self.cache.insert(
                property.code,
                CachedProperty {
                    value: *property,
                    stale: false,
                    fetched_at: now,
                },
            );
        }
    }

    /// Fetch one property with a single-item batch request
    pub fn fetch(
        &mut self,
        backend: &dyn CameraBackend,
        device: DeviceHandle,
        code: PropertyCode,
    ) -> Result<PropertyValue> {
        self.fetch_many(backend, device, &[code])?
            .into_iter()
            .find(|p| p.code == code)
            .ok_or(DeviceError::PropertyFetch {
                codes: vec![code],
                fault: PropertyFetchFault::EmptyResult,
            })
    }

    /// Fetch several properties in one round trip
    ///
    /// Codes the device does not know are silently missing from the result;
    /// an entirely empty result is an error.
    pub fn fetch_many(
        &mut self,
        backend: &dyn CameraBackend,
        device: DeviceHandle,
        codes: &[PropertyCode],
    ) -> Result<Vec<PropertyValue>> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let guard = Self::fetch_buffer(backend, device, codes)?;
        self.remember(&guard.properties);
        Ok(guard.properties.clone())
    }

    /// Fetch every property the device exposes, returning how many there were
    pub fn load_all(&mut self, backend: &dyn CameraBackend, device: DeviceHandle) -> Result<usize> {
        let guard = Self::fetch_buffer(backend, device, &[])?;
        self.remember(&guard.properties);
        debug!("Loaded {} properties", guard.properties.len());
        Ok(guard.properties.len())
    }

    /// Push a value as an unsigned 64-bit property record
    pub fn push(
        &mut self,
        backend: &dyn CameraBackend,
        device: DeviceHandle,
        code: PropertyCode,
        value: u64,
    ) -> Result<()> {
        backend
            .set_device_property(device, PropertyValue::unsigned(code, value))
            .map_err(|vendor: VendorCode| {
                error!("Failed to set property {}: {}", code, vendor);
                DeviceError::PropertySet {
                    property: code,
                    code: vendor,
                }
            })?;
        // the device may adjust the value; trust only a fresh read
        self.mark_stale(&[code]);
        debug!("Set property {} to {}", code, value);
        Ok(())
    }

    /// Mark entries stale; an empty slice marks everything
    pub fn mark_stale(&mut self, codes: &[PropertyCode]) {
        if codes.is_empty() {
            self.cache.values_mut().for_each(|p| p.stale = true);
            return;
        }
        for code in codes {
            if let Some(entry) = self.cache.get_mut(code) {
                entry.stale = true;
            }
        }
    }

    /// Cached entry for `code`, stale or not
    pub fn cached(&self, code: PropertyCode) -> Option<&CachedProperty> {
        self.cache.get(&code)
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::backend::{ControlMode, Notification, NotificationSink, ReconnectPolicy};
    use crate::simulated::{Faults, SimulatedBackend, SimulatedCamera};

    struct Discard;

    impl NotificationSink for Discard {
        fn notify(&self, _notification: Notification) {}
    }

    fn connected() -> (SimulatedBackend, DeviceHandle) {
        let backend = SimulatedBackend::new().with_camera(SimulatedCamera::new("ILCE-7M4"));
        backend.init().unwrap();
        let enumeration = backend.enumerate().unwrap();
        let handle = backend
            .connect(
                &enumeration.records[0],
                Arc::new(Discard),
                ControlMode::Remote,
                ReconnectPolicy::On,
            )
            .unwrap();
        backend.release_enumeration(enumeration.token);
        (backend, handle)
    }

    #[test]
    fn test_fetch_releases_buffer() {
        let (backend, device) = connected();
        let mut store = PropertyStore::new();

        let iso = store
            .fetch(&backend, device, PropertyCode::ISO_SENSITIVITY)
            .unwrap();
        assert_eq!(iso.value, 100);
        assert_eq!(backend.calls("get_select_device_properties"), 1);
        assert_eq!(backend.live_buffers(), 0);
        assert!(!store.cached(PropertyCode::ISO_SENSITIVITY).unwrap().stale);
    }

    #[test]
    fn test_empty_result_is_failure_and_released() {
        let (backend, device) = connected();
        backend.set_faults(Faults {
            empty_properties: true,
            ..Faults::default()
        });
        let mut store = PropertyStore::new();

        let err = store
            .fetch(&backend, device, PropertyCode::F_NUMBER)
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::PropertyFetch {
                fault: PropertyFetchFault::EmptyResult,
                ..
            }
        ));
        assert_eq!(backend.calls("release_device_properties"), 1);
        assert_eq!(backend.live_buffers(), 0);

        assert!(store.load_all(&backend, device).is_err());
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_transport_failure() {
        let (backend, device) = connected();
        backend.set_faults(Faults {
            get_properties: Some(VendorCode::CONNECT_GET_PROPERTY),
            ..Faults::default()
        });
        let mut store = PropertyStore::new();
        let err = store
            .fetch(&backend, device, PropertyCode::F_NUMBER)
            .unwrap_err();
        assert_eq!(err.vendor_code(), Some(VendorCode::CONNECT_GET_PROPERTY));
        assert!(store.is_empty());
    }

    #[test]
    fn test_unknown_code_in_batch() {
        let (backend, device) = connected();
        let mut store = PropertyStore::new();
        let values = store
            .fetch_many(&backend, device, &[PropertyCode::F_NUMBER, PropertyCode(0x0999)])
            .unwrap();
        assert_eq!(values.len(), 1);

        assert!(store.fetch(&backend, device, PropertyCode(0x0999)).is_err());
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_push_marks_stale() {
        let (backend, device) = connected();
        let mut store = PropertyStore::new();
        assert_eq!(store.load_all(&backend, device).unwrap(), 6);

        store
            .push(&backend, device, PropertyCode::ISO_SENSITIVITY, 400)
            .unwrap();
        assert!(store.cached(PropertyCode::ISO_SENSITIVITY).unwrap().stale);
        assert!(!store.cached(PropertyCode::F_NUMBER).unwrap().stale);
        assert_eq!(backend.property(0, PropertyCode::ISO_SENSITIVITY), Some(400));

        store.mark_stale(&[]);
        assert!(store.cached(PropertyCode::F_NUMBER).unwrap().stale);

        let fresh = store
            .fetch(&backend, device, PropertyCode::ISO_SENSITIVITY)
            .unwrap();
        assert_eq!(fresh.value, 400);
        assert!(!store.cached(PropertyCode::ISO_SENSITIVITY).unwrap().stale);
    }

    #[test]
    fn test_push_failure() {
        let (backend, device) = connected();
        backend.set_faults(Faults {
            set_property: Some(VendorCode::ADAPTOR_INVALID_PROPERTY),
            ..Faults::default()
        });
        let mut store = PropertyStore::new();
        let err = store
            .push(&backend, device, PropertyCode::F_NUMBER, 560)
            .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::PropertySet {
                property: PropertyCode::F_NUMBER,
                ..
            }
        ));
    }
}
