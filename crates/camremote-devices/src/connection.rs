/*!
 * Connection state machine.
 *
 * `ConnectionManager` owns the SDK enumerator, at most one live connection
 * and the property cache for it. Notifications raised by the backend while
 * a call is in flight are queued by the dispatcher and applied here, in
 * arrival order, at the start of the next call.
 */
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn, Span};
use uuid::Uuid;

use camremote_core::config::ConnectionConfig;
use camremote_core::event::SharedEventBus;
use camremote_core::logging::component_span;

use crate::backend::{
    CameraBackend, ControlMode, DeviceHandle, Notification, NotificationSink, ReconnectPolicy,
};
use crate::codes::{CommandId, CommandParam, PropertyCode, PropertyValue};
use crate::device::{
    CameraEvent, ConnectFault, ConnectionState, DeviceError, DeviceRecord, LinkStatus, Result,
};
use crate::discovery::{SdkEnumerator, TransportEnumerator};
use crate::dispatch::{EventDispatcher, NotificationQueue};
use crate::property::{CachedProperty, PropertyStore};

/// How to connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Session mode
    pub mode: ControlMode,
    /// Backend reconnect policy
    pub reconnect: ReconnectPolicy,
    /// Fetch all properties right after connecting
    pub preload_properties: bool,
}

impl ConnectOptions {
    /// Options from the connection configuration
    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        Ok(Self {
            mode: config.control_mode.parse()?,
            reconnect: ReconnectPolicy::from(config.auto_reconnect),
            preload_properties: config.preload_properties,
        })
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            mode: ControlMode::Remote,
            reconnect: ReconnectPolicy::On,
            preload_properties: true,
        }
    }
}

/// The one live connection
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Backend device handle
    pub device: DeviceHandle,
    /// Connected model name
    pub model: String,
    /// Session identifier, used in log spans
    pub session: Uuid,
    /// When the connection was made
    pub connected_at: DateTime<Utc>,
    span: Span,
    released: bool,
}

/// Drives connect and disconnect for one camera at a time
pub struct ConnectionManager {
    backend: Arc<dyn CameraBackend>,
    enumerator: SdkEnumerator,
    dispatcher: Arc<EventDispatcher>,
    queue: NotificationQueue,
    events: SharedEventBus,
    options: ConnectOptions,
    state: ConnectionState,
    link: LinkStatus,
    handle: Option<ConnectionHandle>,
    properties: PropertyStore,
}

impl ConnectionManager {
    /// Create a manager over an initialized backend
    pub fn new(backend: Arc<dyn CameraBackend>, events: SharedEventBus, options: ConnectOptions) -> Self {
        let (dispatcher, queue) = EventDispatcher::new(events.clone());
        Self {
            enumerator: SdkEnumerator::new(backend.clone()),
            backend,
            dispatcher,
            queue,
            events,
            options,
            state: ConnectionState::Disconnected,
            link: LinkStatus::Pending,
            handle: None,
            properties: PropertyStore::new(),
        }
    }

    /// The dispatcher, for callback registration
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// The event bus state changes and notifications are published on
    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    /// Connect options in use
    pub fn options(&self) -> ConnectOptions {
        self.options
    }

    // Takes fields rather than `self` so callers can hold other borrows
    fn transition(state: &mut ConnectionState, events: &SharedEventBus, new_state: ConnectionState) {
        let old_state = *state;
        *state = new_state;
        if old_state != new_state {
            debug!("Connection state {} -> {}", old_state, new_state);
            let _ = events.publish(CameraEvent::StateChanged {
                old_state,
                new_state,
            });
        }
    }

    fn set_state(&mut self, new_state: ConnectionState) {
        Self::transition(&mut self.state, &self.events, new_state);
    }

    fn live(&self) -> Result<&ConnectionHandle> {
        self.handle.as_ref().ok_or(DeviceError::NotConnected)
    }

    /// Run a fresh enumeration
    pub fn enumerate(&mut self) -> Result<&[DeviceRecord]> {
        self.enumerator.enumerate()
    }

    /// The current device list
    pub fn records(&self) -> &[DeviceRecord] {
        self.enumerator.records()
    }

    /// Number of devices in the current list
    pub fn device_count(&self) -> usize {
        self.enumerator.len()
    }

    /// Model name of the device at `index`
    pub fn device_model(&self, index: usize) -> Option<&str> {
        self.enumerator.get(index).map(|r| r.model.as_str())
    }

    /// Connect to the device at `index`, enumerating first if the list is empty
    pub fn connect(&mut self, index: usize) -> Result<&ConnectionHandle> {
        self.pump_notifications();
        if self.handle.is_some() {
            warn!("Already connected to a camera");
            return Err(DeviceError::AlreadyConnected);
        }

        if self.enumerator.is_empty() {
            self.enumerator.enumerate()?;
        }
        let count = self.enumerator.len();
        let record = self.enumerator.get(index).ok_or_else(|| {
            error!("Invalid device index {} ({} device(s))", index, count);
            DeviceError::IndexOutOfRange { index, count }
        })?;

        Self::transition(&mut self.state, &self.events, ConnectionState::Connecting);
        info!("Connecting to {}", record);
        let sink: Arc<dyn NotificationSink> = self.dispatcher.clone();
        let result = self
            .backend
            .connect(record, sink, self.options.mode, self.options.reconnect);

        let device = match result {
            Ok(device) => device,
            Err(code) => {
                let kind = ConnectFault::classify(code);
                error!("Failed to connect to {}: {} ({})", record.model, kind, code);
                Self::transition(&mut self.state, &self.events, ConnectionState::Failed);
                Self::transition(&mut self.state, &self.events, ConnectionState::Disconnected);
                let dropped = self.queue.drain().len();
                if dropped > 0 {
                    debug!("Dropped {} notification(s) from the failed attempt", dropped);
                }
                return Err(DeviceError::Connect { kind, code });
            }
        };

        let session = Uuid::new_v4();
        let session_id = session.to_string();
        let handle = ConnectionHandle {
            device,
            model: record.model.clone(),
            session,
            connected_at: Utc::now(),
            span: component_span("connection", Some(&session_id)),
            released: false,
        };
        let _session = handle.span.clone().entered();
        info!("Connected to camera: {}", handle.model);

        self.handle = Some(handle);
        self.link = LinkStatus::Pending;
        self.properties.clear();
        self.set_state(ConnectionState::Connected);
        self.pump_notifications();

        if self.options.preload_properties {
            match self.properties.load_all(self.backend.as_ref(), device) {
                Ok(count) => info!("Loaded {} properties", count),
                Err(e) => warn!("Property preload failed: {}", e),
            }
        }

        self.live()
    }

    /// Close the connection
    ///
    /// Device release is attempted whether or not the disconnect succeeded,
    /// and only once per connection. A failed disconnect returns the state
    /// machine to `Connected`; calling `disconnect` again then drops the
    /// already released session and reaches `Disconnected`.
    pub fn disconnect(&mut self) -> Result<()> {
        self.pump_notifications();
        let (device, span, released) = match &self.handle {
            Some(handle) => (handle.device, handle.span.clone(), handle.released),
            None => {
                warn!("Not connected to any camera");
                return Err(DeviceError::NotConnected);
            }
        };
        let _session = span.entered();

        self.set_state(ConnectionState::Disconnecting);
        if released {
            // the backend no longer knows this handle
            debug!("Device {} already released, dropping the session", device);
            self.close_session();
            return Ok(());
        }

        let disconnected = self.backend.disconnect(device);
        if let Err(code) = self.backend.release_device(device) {
            warn!("{}", DeviceError::Release { code });
        }
        if let Some(handle) = self.handle.as_mut() {
            handle.released = true;
        }

        match disconnected {
            Ok(()) => {
                self.close_session();
                Ok(())
            }
            Err(code) => {
                error!("Failed to disconnect from camera: {}", code);
                self.set_state(ConnectionState::Connected);
                Err(DeviceError::Disconnect { code })
            }
        }
    }

    fn close_session(&mut self) {
        self.handle = None;
        self.link = LinkStatus::Pending;
        self.properties.clear();
        self.queue.drain();
        self.set_state(ConnectionState::Disconnected);
        info!("Disconnected from camera");
    }

    /// Whether a connection is live
    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Link status as last reported by the backend
    pub fn link_status(&self) -> LinkStatus {
        self.link
    }

    /// The live connection, if any
    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    /// Apply queued notifications in arrival order, returning how many there were
    pub fn pump_notifications(&mut self) -> usize {
        let pending = self.queue.drain();
        let count = pending.len();
        for notification in pending {
            if self.handle.is_none() {
                debug!("Ignoring {} notification without a connection", notification.kind());
                continue;
            }
            match notification {
                Notification::Connected { version } => self.link = LinkStatus::Up { version },
                Notification::Disconnected { reason } => self.link = LinkStatus::Down { reason },
                Notification::PropertyChanged => self.properties.mark_stale(&[]),
                Notification::PropertyChangedCodes(codes) => self.properties.mark_stale(&codes),
                _ => {}
            }
        }
        count
    }

    /// Send a command
    pub fn send_command(&mut self, command: CommandId, param: CommandParam) -> Result<()> {
        self.pump_notifications();
        let device = self.live()?.device;
        self.backend
            .send_command(device, command, param)
            .map_err(|code| {
                error!("Command {:?} {:?} failed: {}", command, param, code);
                DeviceError::Command { command, code }
            })
    }

    /// Press and release the shutter
    pub fn capture_photo(&mut self) -> Result<()> {
        let _session = self.live()?.span.clone().entered();
        self.send_command(CommandId::Release, CommandParam::Down)?;
        self.send_command(CommandId::Release, CommandParam::Up)?;
        info!("Photo captured");
        Ok(())
    }

    /// Read one property from the device
    pub fn get_property(&mut self, code: PropertyCode) -> Result<PropertyValue> {
        self.pump_notifications();
        let device = self.live()?.device;
        self.properties.fetch(self.backend.as_ref(), device, code)
    }

    /// Read several properties in one round trip
    pub fn get_properties(&mut self, codes: &[PropertyCode]) -> Result<Vec<PropertyValue>> {
        self.pump_notifications();
        let device = self.live()?.device;
        self.properties.fetch_many(self.backend.as_ref(), device, codes)
    }

    /// Read every property into the cache
    pub fn load_properties(&mut self) -> Result<usize> {
        self.pump_notifications();
        let device = self.live()?.device;
        self.properties.load_all(self.backend.as_ref(), device)
    }

    /// Write one property
    pub fn set_property(&mut self, code: PropertyCode, value: u64) -> Result<()> {
        self.pump_notifications();
        let device = self.live()?.device;
        self.properties.push(self.backend.as_ref(), device, code, value)
    }

    /// Cached value of a property, as of the last call
    pub fn cached_property(&self, code: PropertyCode) -> Option<&CachedProperty> {
        self.properties.cached(code)
    }

    /// Disconnect if connected and drop the device list
    pub fn shutdown(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.disconnect() {
                warn!("Disconnect during shutdown failed: {}", e);
                // the backend is about to be torn down; forget the session
                self.handle = None;
                self.set_state(ConnectionState::Disconnected);
            }
        }
        self.enumerator.clear();
        self.properties.clear();
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .field("link", &self.link)
            .field("devices", &self.enumerator.len())
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::VendorCode;
    use crate::simulated::{Faults, SimulatedBackend, SimulatedCamera};

    fn setup(cameras: usize) -> (Arc<SimulatedBackend>, ConnectionManager) {
        let backend = SimulatedBackend::new();
        for i in 0..cameras {
            backend.attach(SimulatedCamera::new(format!("ILCE-7M4 #{}", i)));
        }
        backend.init().unwrap();
        let backend = Arc::new(backend);
        let manager =
            ConnectionManager::new(backend.clone(), SharedEventBus::new(), ConnectOptions::default());
        (backend, manager)
    }

    #[test_log::test]
    fn test_connect_round_trip() {
        let (backend, mut manager) = setup(1);
        assert!(!manager.is_connected());

        let handle = manager.connect(0).unwrap();
        assert_eq!(handle.model, "ILCE-7M4 #0");
        assert!(manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Connected);
        // the connect notification arrived mid-connect and has been applied
        assert!(matches!(manager.link_status(), LinkStatus::Up { .. }));
        assert_eq!(backend.calls("get_device_properties"), 1);
        assert!(manager.cached_property(PropertyCode::F_NUMBER).is_some());

        manager.disconnect().unwrap();
        assert!(!manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(backend.open_devices(), 0);
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_connect_enumerates_when_list_is_empty() {
        let (backend, mut manager) = setup(1);
        assert_eq!(manager.device_count(), 0);
        manager.connect(0).unwrap();
        assert_eq!(backend.calls("enumerate"), 1);
        assert_eq!(manager.device_model(0), Some("ILCE-7M4 #0"));
        assert_eq!(manager.device_model(1), None);
    }

    #[test]
    fn test_unplugged_camera_empties_the_list() {
        let (backend, mut manager) = setup(1);
        assert_eq!(manager.enumerate().unwrap().len(), 1);

        backend.detach_all();
        assert!(matches!(manager.enumerate(), Err(DeviceError::EmptyResult)));
        assert_eq!(manager.device_count(), 0);
        assert_eq!(backend.live_enumerations(), 0);
        assert!(matches!(
            manager.connect(0),
            Err(DeviceError::EmptyResult)
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_index_out_of_range() {
        let (backend, mut manager) = setup(2);
        manager.enumerate().unwrap();

        match manager.connect(5) {
            Err(DeviceError::IndexOutOfRange { index, count }) => {
                assert_eq!(index, 5);
                assert_eq!(count, 2);
            }
            other => panic!("unexpected result: {:?}", other.map(|h| h.device)),
        }
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(backend.calls("connect"), 0);
    }

    #[test]
    fn test_already_connected_makes_no_transport_call() {
        let (backend, mut manager) = setup(1);
        manager.connect(0).unwrap();
        let before = backend.total_calls();

        assert!(matches!(manager.connect(0), Err(DeviceError::AlreadyConnected)));
        assert_eq!(backend.calls("connect"), 1);
        assert_eq!(backend.total_calls(), before);
        assert!(manager.is_connected());
    }

    #[test]
    fn test_disconnect_when_disconnected() {
        let (backend, mut manager) = setup(1);
        assert!(matches!(manager.disconnect(), Err(DeviceError::NotConnected)));
        assert_eq!(backend.calls("disconnect"), 0);
    }

    #[test]
    fn test_property_access_requires_connection() {
        let (backend, mut manager) = setup(1);
        manager.enumerate().unwrap();
        let before = backend.total_calls();

        assert!(matches!(
            manager.get_property(PropertyCode::ISO_SENSITIVITY),
            Err(DeviceError::NotConnected)
        ));
        assert!(matches!(
            manager.set_property(PropertyCode::ISO_SENSITIVITY, 200),
            Err(DeviceError::NotConnected)
        ));
        assert!(matches!(manager.capture_photo(), Err(DeviceError::NotConnected)));
        assert_eq!(backend.total_calls(), before);
    }

    #[test]
    fn test_set_then_get() {
        let (_backend, mut manager) = setup(1);
        manager.connect(0).unwrap();

        manager.set_property(PropertyCode::ISO_SENSITIVITY, 800).unwrap();
        let value = manager.get_property(PropertyCode::ISO_SENSITIVITY).unwrap();
        assert_eq!(value.value, 800);

        let values = manager
            .get_properties(&[PropertyCode::ISO_SENSITIVITY, PropertyCode::F_NUMBER])
            .unwrap();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_zero_property_fetch_fails() {
        let (backend, mut manager) = setup(1);
        manager.connect(0).unwrap();
        backend.set_faults(Faults {
            empty_properties: true,
            ..Faults::default()
        });

        assert!(matches!(
            manager.get_property(PropertyCode::F_NUMBER),
            Err(DeviceError::PropertyFetch { .. })
        ));
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_connect_failure_is_diagnosed() {
        let (backend, mut manager) = setup(1);
        let mut events = manager.events().subscribe::<CameraEvent>().unwrap();
        backend.set_faults(Faults {
            connect: Some(VendorCode::CONNECT_FAIL_BUSY),
            ..Faults::default()
        });

        match manager.connect(0) {
            Err(DeviceError::Connect { kind, code }) => {
                assert_eq!(kind, ConnectFault::Busy);
                assert_eq!(code, VendorCode::CONNECT_FAIL_BUSY);
            }
            other => panic!("unexpected result: {:?}", other.map(|h| h.device)),
        }
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(backend.calls("connect"), 1);

        let mut states = Vec::new();
        while let Ok(CameraEvent::StateChanged { new_state, .. }) = events.try_recv() {
            states.push(new_state);
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Failed,
                ConnectionState::Disconnected
            ]
        );
    }

    #[test]
    fn test_notifications_during_connect_apply_in_order() {
        let (backend, mut manager) = setup(1);
        backend.deliver_during_connect(vec![
            Notification::Connected { version: 1 },
            Notification::Disconnected {
                reason: VendorCode::CONNECT_DISCONNECTED,
            },
            Notification::Connected { version: 2 },
        ]);

        manager.connect(0).unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.link_status(), LinkStatus::Up { version: 2 });

        backend.deliver_during_connect(vec![
            Notification::Connected { version: 1 },
            Notification::Disconnected {
                reason: VendorCode::CONNECT_RECONNECT_TIMEOUT,
            },
        ]);
        manager.disconnect().unwrap();
        manager.connect(0).unwrap();
        assert!(manager.is_connected());
        assert_eq!(
            manager.link_status(),
            LinkStatus::Down {
                reason: VendorCode::CONNECT_RECONNECT_TIMEOUT
            }
        );
    }

    #[test]
    fn test_property_notification_marks_cache_stale() {
        let (backend, mut manager) = setup(1);
        manager.connect(0).unwrap();
        assert!(!manager.cached_property(PropertyCode::F_NUMBER).unwrap().stale);

        backend.emit(Notification::PropertyChangedCodes(vec![PropertyCode::F_NUMBER]));
        assert_eq!(manager.pump_notifications(), 1);
        assert!(manager.cached_property(PropertyCode::F_NUMBER).unwrap().stale);
        assert!(!manager.cached_property(PropertyCode::ISO_SENSITIVITY).unwrap().stale);
    }

    #[test]
    fn test_failed_disconnect_still_releases_once() {
        let (backend, mut manager) = setup(1);
        manager.connect(0).unwrap();
        backend.set_faults(Faults {
            disconnect: Some(VendorCode::CONNECT_UNKNOWN),
            ..Faults::default()
        });

        assert!(matches!(manager.disconnect(), Err(DeviceError::Disconnect { .. })));
        assert_eq!(backend.calls("release_device"), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.is_connected());

        // retrying drops the released session without touching the backend
        manager.disconnect().unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());
        assert_eq!(backend.calls("disconnect"), 1);
        assert_eq!(backend.calls("release_device"), 1);
        assert_eq!(backend.double_releases(), 0);
    }

    #[test]
    fn test_transient_disconnect_fault_then_reconnect() {
        let (backend, mut manager) = setup(1);
        manager.connect(0).unwrap();
        backend.set_faults(Faults {
            disconnect: Some(VendorCode::CONNECT_UNKNOWN),
            ..Faults::default()
        });
        assert!(manager.disconnect().is_err());

        backend.set_faults(Faults::default());
        manager.disconnect().unwrap();
        assert!(matches!(manager.disconnect(), Err(DeviceError::NotConnected)));

        manager.connect(0).unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(backend.open_devices(), 1);
        manager.disconnect().unwrap();
        assert_eq!(backend.open_devices(), 0);
        assert_eq!(backend.double_releases(), 0);
    }

    #[test]
    fn test_release_failure_does_not_block_disconnect() {
        let (backend, mut manager) = setup(1);
        manager.connect(0).unwrap();
        backend.set_faults(Faults {
            release_device: Some(VendorCode::CONNECT_RELEASE),
            ..Faults::default()
        });

        manager.disconnect().unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_preload_failure_does_not_fail_connect() {
        let (backend, mut manager) = setup(1);
        backend.set_faults(Faults {
            get_properties: Some(VendorCode::CONNECT_GET_PROPERTY),
            ..Faults::default()
        });
        manager.connect(0).unwrap();
        assert!(manager.is_connected());
        assert!(manager.cached_property(PropertyCode::F_NUMBER).is_none());
    }

    #[test]
    fn test_capture_photo_presses_then_releases() {
        let (backend, mut manager) = setup(1);
        manager.connect(0).unwrap();
        manager.capture_photo().unwrap();
        assert_eq!(
            backend.commands(),
            vec![
                (CommandId::Release, CommandParam::Down),
                (CommandId::Release, CommandParam::Up)
            ]
        );

        backend.set_faults(Faults {
            send_command: Some(VendorCode::CONNECT_SEND_COMMAND),
            ..Faults::default()
        });
        assert!(matches!(
            manager.capture_photo(),
            Err(DeviceError::Command {
                command: CommandId::Release,
                ..
            })
        ));
    }

    #[test]
    fn test_drop_releases_everything() {
        let (backend, mut manager) = setup(1);
        manager.connect(0).unwrap();
        assert_eq!(backend.live_enumerations(), 1);

        drop(manager);
        assert_eq!(backend.open_devices(), 0);
        assert_eq!(backend.live_enumerations(), 0);
        assert_eq!(backend.double_releases(), 0);
    }

    #[test]
    fn test_options_from_config() {
        let config = ConnectionConfig {
            auto_reconnect: false,
            control_mode: "contents_transfer".to_string(),
            ..ConnectionConfig::default()
        };
        let options = ConnectOptions::from_config(&config).unwrap();
        assert_eq!(options.mode, ControlMode::ContentsTransfer);
        assert_eq!(options.reconnect, ReconnectPolicy::Off);

        let config = ConnectionConfig {
            control_mode: "tethered".to_string(),
            ..ConnectionConfig::default()
        };
        assert!(ConnectOptions::from_config(&config).is_err());
    }
}
