/*!
 * An in-process camera backend.
 *
 * `SimulatedBackend` implements [`CameraBackend`] without hardware. It keeps
 * books on every token it lends out so tests can assert that nothing leaks
 * and nothing is released twice, and it lets callers inject vendor faults
 * and drive notifications from foreign threads.
 */
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, trace};

use crate::backend::{
    BufferToken, CameraBackend, ControlMode, DeviceHandle, EnumerationToken, Notification,
    NotificationSink, RawEnumeration, RawPropertyBuffer, ReconnectPolicy,
};
use crate::codes::{CommandId, CommandParam, DataType, PropertyCode, PropertyValue, VendorCode};
use crate::device::{DeviceAddress, DeviceRecord};

/// Default version reported by the simulated backend (1.19.0)
pub const SIMULATED_SDK_VERSION: u32 = 0x0113_0000;

/// Vendor faults to inject, per call
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Fail `init`
    pub init: Option<VendorCode>,
    /// Fail `enumerate`
    pub enumerate: Option<VendorCode>,
    /// Fail `connect`
    pub connect: Option<VendorCode>,
    /// Fail `disconnect`
    pub disconnect: Option<VendorCode>,
    /// Fail `release_device`
    pub release_device: Option<VendorCode>,
    /// Fail `send_command`
    pub send_command: Option<VendorCode>,
    /// Fail property fetches
    pub get_properties: Option<VendorCode>,
    /// Fail `set_device_property`
    pub set_property: Option<VendorCode>,
    /// Property fetches succeed but return nothing
    pub empty_properties: bool,
}

/// A simulated camera
#[derive(Debug, Clone)]
pub struct SimulatedCamera {
    /// Model name
    pub model: String,
    /// Serial, if exposed at enumeration
    pub serial: Option<String>,
    /// Transport name
    pub transport: String,
    /// Current property values
    pub properties: BTreeMap<PropertyCode, PropertyValue>,
}

impl SimulatedCamera {
    /// A USB camera with a typical set of properties
    pub fn new<S: Into<String>>(model: S) -> Self {
        let properties = [
            (PropertyCode::F_NUMBER, DataType::UInt16, 280),
            (PropertyCode::ISO_SENSITIVITY, DataType::UInt32, 100),
            (PropertyCode::SHUTTER_SPEED, DataType::UInt32, 250),
            (PropertyCode::EXPOSURE_PROGRAM_MODE, DataType::UInt32, 1),
            (PropertyCode::WHITE_BALANCE, DataType::UInt16, 2),
            (PropertyCode::FOCUS_MODE, DataType::UInt16, 2),
        ]
        .into_iter()
        .map(|(code, data_type, value)| {
            (
                code,
                PropertyValue {
                    code,
                    data_type,
                    value,
                },
            )
        })
        .collect();

        Self {
            model: model.into(),
            serial: None,
            transport: "usb".to_string(),
            properties,
        }
    }

    /// Set the serial
    pub fn with_serial<S: Into<String>>(mut self, serial: S) -> Self {
        self.serial = Some(serial.into());
        self
    }
}

struct OpenDevice {
    camera: usize,
    sink: Arc<dyn NotificationSink>,
}

struct State {
    initialized: bool,
    version: u32,
    cameras: Vec<SimulatedCamera>,
    faults: Faults,
    next_token: u64,
    live_enumerations: HashSet<u64>,
    live_buffers: HashSet<u64>,
    open: HashMap<u64, OpenDevice>,
    double_releases: usize,
    calls: HashMap<&'static str, usize>,
    commands: Vec<(CommandId, CommandParam)>,
    connect_script: Option<Vec<Notification>>,
}

impl State {
    fn record(&mut self, call: &'static str) {
        *self.calls.entry(call).or_insert(0) += 1;
        trace!("simulated backend call: {}", call);
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn open_camera(&self, device: DeviceHandle) -> Result<usize, VendorCode> {
        self.open
            .get(&device.0)
            .map(|open| open.camera)
            .ok_or(VendorCode::API_INVALID_CALLED)
    }

    fn buffer(&mut self, properties: Vec<PropertyValue>) -> RawPropertyBuffer {
        let token = self.token();
        self.live_buffers.insert(token);
        RawPropertyBuffer {
            token: BufferToken(token),
            properties,
        }
    }
}

/// A hardware-free [`CameraBackend`]
pub struct SimulatedBackend {
    state: Mutex<State>,
}

impl SimulatedBackend {
    /// A backend with no cameras attached
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                initialized: false,
                version: SIMULATED_SDK_VERSION,
                cameras: Vec::new(),
                faults: Faults::default(),
                next_token: 0,
                live_enumerations: HashSet::new(),
                live_buffers: HashSet::new(),
                open: HashMap::new(),
                double_releases: 0,
                calls: HashMap::new(),
                commands: Vec::new(),
                connect_script: None,
            }),
        }
    }

    /// Attach a camera
    pub fn with_camera(self, camera: SimulatedCamera) -> Self {
        self.state().cameras.push(camera);
        self
    }

    /// Inject faults
    pub fn with_faults(self, faults: Faults) -> Self {
        self.state().faults = faults;
        self
    }

    /// Report a different backend version
    pub fn with_version(self, version: u32) -> Self {
        self.state().version = version;
        self
    }

    // A panicking test thread must not wedge the books for the others
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the injected faults
    pub fn set_faults(&self, faults: Faults) {
        self.state().faults = faults;
    }

    /// Attach a camera after construction
    pub fn attach(&self, camera: SimulatedCamera) {
        self.state().cameras.push(camera);
    }

    /// Unplug every camera
    pub fn detach_all(&self) {
        self.state().cameras.clear();
    }

    /// Notifications delivered from a foreign thread while `connect` is in
    /// flight, replacing the default single `Connected`
    pub fn deliver_during_connect(&self, notifications: Vec<Notification>) {
        self.state().connect_script = Some(notifications);
    }

    /// Deliver a notification to every open device's sink from the calling thread
    pub fn emit(&self, notification: Notification) {
        let sinks: Vec<Arc<dyn NotificationSink>> =
            self.state().open.values().map(|o| o.sink.clone()).collect();
        for sink in sinks {
            sink.notify(notification.clone());
        }
    }

    /// Number of times `call` was made
    pub fn calls(&self, call: &str) -> usize {
        self.state().calls.get(call).copied().unwrap_or(0)
    }

    /// Number of calls made in total
    pub fn total_calls(&self) -> usize {
        self.state().calls.values().sum()
    }

    /// Enumeration results not yet released
    pub fn live_enumerations(&self) -> usize {
        self.state().live_enumerations.len()
    }

    /// Property buffers not yet released
    pub fn live_buffers(&self) -> usize {
        self.state().live_buffers.len()
    }

    /// Devices connected and not yet released
    pub fn open_devices(&self) -> usize {
        self.state().open.len()
    }

    /// Releases of tokens or handles that were not live
    pub fn double_releases(&self) -> usize {
        self.state().double_releases
    }

    /// Whether `init` succeeded and `release` has not been called since
    pub fn is_initialized(&self) -> bool {
        self.state().initialized
    }

    /// Commands received, in order
    pub fn commands(&self) -> Vec<(CommandId, CommandParam)> {
        self.state().commands.clone()
    }

    /// Current raw value of a property on an attached camera
    pub fn property(&self, camera: usize, code: PropertyCode) -> Option<u64> {
        self.state()
            .cameras
            .get(camera)
            .and_then(|c| c.properties.get(&code))
            .map(|p| p.value)
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("SimulatedBackend")
            .field("initialized", &state.initialized)
            .field("cameras", &state.cameras.len())
            .field("open", &state.open.len())
            .field("live_enumerations", &state.live_enumerations.len())
            .field("live_buffers", &state.live_buffers.len())
            .finish()
    }
}

impl CameraBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn init(&self) -> Result<(), VendorCode> {
        let mut state = self.state();
        state.record("init");
        if let Some(code) = state.faults.init {
            return Err(code);
        }
        state.initialized = true;
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state();
        state.record("release");
        state.initialized = false;
    }

    fn sdk_version(&self) -> u32 {
        let mut state = self.state();
        state.record("sdk_version");
        state.version
    }

    fn enumerate(&self) -> Result<RawEnumeration, VendorCode> {
        let mut state = self.state();
        state.record("enumerate");
        if !state.initialized {
            return Err(VendorCode::API_INVALID_CALLED);
        }
        if let Some(code) = state.faults.enumerate {
            return Err(code);
        }
        let records = state
            .cameras
            .iter()
            .enumerate()
            .map(|(slot, camera)| DeviceRecord {
                model: camera.model.clone(),
                serial: camera.serial.clone(),
                address: DeviceAddress::Sdk {
                    slot,
                    transport: camera.transport.clone(),
                },
            })
            .collect();
        let token = state.token();
        state.live_enumerations.insert(token);
        Ok(RawEnumeration {
            token: EnumerationToken(token),
            records,
        })
    }

    fn release_enumeration(&self, token: EnumerationToken) {
        let mut state = self.state();
        state.record("release_enumeration");
        if !state.live_enumerations.remove(&token.0) {
            state.double_releases += 1;
        }
    }

    fn connect(
        &self,
        record: &DeviceRecord,
        sink: Arc<dyn NotificationSink>,
        mode: ControlMode,
        reconnect: ReconnectPolicy,
    ) -> Result<DeviceHandle, VendorCode> {
        let (handle, script) = {
            let mut state = self.state();
            state.record("connect");
            if let Some(code) = state.faults.connect {
                return Err(code);
            }
            let camera = match &record.address {
                DeviceAddress::Sdk { slot, .. } if *slot < state.cameras.len() => *slot,
                _ => return Err(VendorCode::CONNECT_UNKNOWN),
            };
            let handle = state.token();
            state.open.insert(
                handle,
                OpenDevice {
                    camera,
                    sink: sink.clone(),
                },
            );
            let version = state.version;
            let script = state
                .connect_script
                .clone()
                .unwrap_or_else(|| vec![Notification::Connected { version }]);
            (DeviceHandle(handle), script)
        };

        debug!(
            "simulated connect to {} in {:?} mode, reconnect {:?}",
            record.model, mode, reconnect
        );

        // Notifications arrive on a backend thread before connect returns
        let notifier = thread::spawn(move || {
            for notification in script {
                sink.notify(notification);
            }
        });
        if notifier.join().is_err() {
            return Err(VendorCode::GENERIC_UNKNOWN);
        }

        Ok(handle)
    }

    fn disconnect(&self, device: DeviceHandle) -> Result<(), VendorCode> {
        let mut state = self.state();
        state.record("disconnect");
        state.open_camera(device)?;
        if let Some(code) = state.faults.disconnect {
            return Err(code);
        }
        Ok(())
    }

    fn release_device(&self, device: DeviceHandle) -> Result<(), VendorCode> {
        let mut state = self.state();
        state.record("release_device");
        if state.open.remove(&device.0).is_none() {
            state.double_releases += 1;
            return Err(VendorCode::API_INVALID_CALLED);
        }
        match state.faults.release_device {
            Some(code) => Err(code),
            None => Ok(()),
        }
    }

    fn send_command(
        &self,
        device: DeviceHandle,
        command: CommandId,
        param: CommandParam,
    ) -> Result<(), VendorCode> {
        let mut state = self.state();
        state.record("send_command");
        state.open_camera(device)?;
        if let Some(code) = state.faults.send_command {
            return Err(code);
        }
        state.commands.push((command, param));
        Ok(())
    }

    fn get_device_properties(&self, device: DeviceHandle) -> Result<RawPropertyBuffer, VendorCode> {
        let mut state = self.state();
        state.record("get_device_properties");
        let camera = state.open_camera(device)?;
        if let Some(code) = state.faults.get_properties {
            return Err(code);
        }
        let properties = if state.faults.empty_properties {
            Vec::new()
        } else {
            state.cameras[camera].properties.values().copied().collect()
        };
        Ok(state.buffer(properties))
    }

    fn get_select_device_properties(
        &self,
        device: DeviceHandle,
        codes: &[PropertyCode],
    ) -> Result<RawPropertyBuffer, VendorCode> {
        let mut state = self.state();
        state.record("get_select_device_properties");
        let camera = state.open_camera(device)?;
        if let Some(code) = state.faults.get_properties {
            return Err(code);
        }
        let properties = if state.faults.empty_properties {
            Vec::new()
        } else {
            let all = &state.cameras[camera].properties;
            codes.iter().filter_map(|code| all.get(code).copied()).collect()
        };
        Ok(state.buffer(properties))
    }

    fn release_device_properties(&self, _device: DeviceHandle, token: BufferToken) {
        let mut state = self.state();
        state.record("release_device_properties");
        if !state.live_buffers.remove(&token.0) {
            state.double_releases += 1;
        }
    }

    fn set_device_property(
        &self,
        device: DeviceHandle,
        property: PropertyValue,
    ) -> Result<(), VendorCode> {
        let sink = {
            let mut state = self.state();
            state.record("set_device_property");
            let camera = state.open_camera(device)?;
            if let Some(code) = state.faults.set_property {
                return Err(code);
            }
            state.cameras[camera]
                .properties
                .insert(property.code, property);
            state.open.get(&device.0).map(|open| open.sink.clone())
        };

        if let Some(sink) = sink {
            sink.notify(Notification::PropertyChangedCodes(vec![property.code]));
        }
        Ok(())
    }
}
