/*!
 * Camera remote façade.
 *
 * `CameraRemote` is the consumer-facing API. It owns the backend's
 * init/teardown lifecycle, the connection manager and the USB fallback
 * diagnostics. `SharedCamera` wraps it for async callers, moving every
 * blocking vendor call onto the blocking pool under the configured timeout.
 */
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};

use camremote_core::config::SharedConfig;
use camremote_core::event::SharedEventBus;
use camremote_core::log_with_fields;
use camremote_core::logging::operation_span;
use camremote_core::utils::run_blocking;

use crate::backend::{format_version, CameraBackend};
use crate::codes::{PropertyCode, PropertyValue, VendorCode};
use crate::connection::{ConnectOptions, ConnectionHandle, ConnectionManager};
use crate::device::{CameraEvent, ConnectionState, DeviceError, LinkStatus, Result};
use crate::units::{PlaceholderEncoder, UnitEncoder};
use crate::usb::{UsbDiagnostics, UsbReport};

/// Where the façade is in its init/teardown lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed, backend not initialized
    Created,
    /// Backend initialization failed; only `exit` is meaningful
    Failed,
    /// Backend initialized
    Ready,
    /// Torn down
    Exited,
}

/// Remote control of one camera through a vendor backend
pub struct CameraRemote {
    backend: Arc<dyn CameraBackend>,
    config: SharedConfig,
    events: SharedEventBus,
    encoder: Box<dyn UnitEncoder>,
    lifecycle: Lifecycle,
    session: Option<ConnectionManager>,
    usb: Option<UsbDiagnostics>,
}

impl CameraRemote {
    /// Create a façade; nothing touches the backend until [`setup`](Self::setup)
    pub fn new(backend: Arc<dyn CameraBackend>, config: SharedConfig) -> Self {
        Self {
            backend,
            config,
            events: SharedEventBus::new(),
            encoder: Box::new(PlaceholderEncoder),
            lifecycle: Lifecycle::Created,
            session: None,
            usb: None,
        }
    }

    /// Publish on an existing event bus
    pub fn with_events(mut self, events: SharedEventBus) -> Self {
        self.events = events;
        self
    }

    /// Use a different unit encoder
    pub fn with_encoder(mut self, encoder: Box<dyn UnitEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Use explicit USB diagnostics instead of loading the bus library
    pub fn with_usb(mut self, usb: UsbDiagnostics) -> Self {
        self.usb = Some(usb);
        self
    }

    /// Current lifecycle stage
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Initialize the backend
    pub fn setup(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Ready => {
                warn!("Camera remote already set up");
                return Ok(());
            }
            Lifecycle::Failed => return Err(DeviceError::Lifecycle("backend initialization failed")),
            Lifecycle::Exited => return Err(DeviceError::Lifecycle("camera remote has exited")),
            Lifecycle::Created => {}
        }

        let options = ConnectOptions::from_config(&self.config.get().connection)?;
        if let Err(code) = self.backend.init() {
            error!("Failed to initialize {} backend: {}", self.backend.name(), code);
            self.lifecycle = Lifecycle::Failed;
            return Err(DeviceError::InitFailure(code));
        }

        self.session = Some(ConnectionManager::new(
            self.backend.clone(),
            self.events.clone(),
            options,
        ));
        self.lifecycle = Lifecycle::Ready;
        log_with_fields!(
            Level::INFO,
            "Camera remote ready",
            backend = %self.backend.name(),
            version = %format_version(self.backend.sdk_version())
        );
        Ok(())
    }

    /// Disconnect, drop the device list and tear the backend down; idempotent
    pub fn exit(&mut self) {
        match self.lifecycle {
            Lifecycle::Exited => return,
            Lifecycle::Created => {
                self.lifecycle = Lifecycle::Exited;
                return;
            }
            Lifecycle::Ready | Lifecycle::Failed => {}
        }
        // connection resources go before the backend that lent them
        if let Some(mut session) = self.session.take() {
            session.shutdown();
        }
        self.backend.release();
        self.lifecycle = Lifecycle::Exited;
        info!("Camera remote shut down");
    }

    fn session(&self) -> Result<&ConnectionManager> {
        match self.lifecycle {
            Lifecycle::Ready => self
                .session
                .as_ref()
                .ok_or(DeviceError::Lifecycle("no session")),
            Lifecycle::Created => Err(DeviceError::Lifecycle("setup has not been called")),
            Lifecycle::Failed => Err(DeviceError::Lifecycle("backend initialization failed")),
            Lifecycle::Exited => Err(DeviceError::Lifecycle("camera remote has exited")),
        }
    }

    fn session_mut(&mut self) -> Result<&mut ConnectionManager> {
        self.session()?;
        self.session
            .as_mut()
            .ok_or(DeviceError::Lifecycle("no session"))
    }

    /// The connection manager, for lower-level access
    pub fn connection(&mut self) -> Result<&mut ConnectionManager> {
        self.session_mut()
    }

    /// Enumerate cameras, returning how many were found
    ///
    /// When nothing is found and USB diagnostics are enabled, the raw bus is
    /// scanned and the report logged before the error is returned.
    pub fn enumerate_devices(&mut self) -> Result<usize> {
        let result = self.session_mut()?.enumerate().map(|records| records.len());
        match result {
            Ok(count) => {
                info!("Found {} camera(s)", count);
                Ok(count)
            }
            Err(e) => {
                if self.config.get().discovery.usb_diagnostics_on_empty {
                    self.debug_usb_devices();
                }
                Err(e)
            }
        }
    }

    /// Number of enumerated cameras; zero before setup
    pub fn device_count(&self) -> usize {
        self.session().map(|s| s.device_count()).unwrap_or(0)
    }

    /// Model name of an enumerated camera
    pub fn device_model(&self, index: usize) -> Option<&str> {
        self.session().ok()?.device_model(index)
    }

    /// Backend version, packed as major << 24 | minor << 16 | patch << 8
    pub fn sdk_version(&self) -> Result<u32> {
        self.session()?;
        Ok(self.backend.sdk_version())
    }

    /// Connect to an enumerated camera
    pub fn connect(&mut self, index: usize) -> Result<&ConnectionHandle> {
        self.session_mut()?.connect(index)
    }

    /// Disconnect from the camera
    pub fn disconnect(&mut self) -> Result<()> {
        self.session_mut()?.disconnect()
    }

    /// Whether a camera is connected
    pub fn is_connected(&self) -> bool {
        self.session().map(|s| s.is_connected()).unwrap_or(false)
    }

    /// Connection state; `Disconnected` before setup and after exit
    pub fn state(&self) -> ConnectionState {
        self.session()
            .map(|s| s.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Link status as last reported by the backend
    pub fn link_status(&self) -> LinkStatus {
        self.session()
            .map(|s| s.link_status())
            .unwrap_or(LinkStatus::Pending)
    }

    /// Apply queued backend notifications
    pub fn pump_notifications(&mut self) -> Result<usize> {
        Ok(self.session_mut()?.pump_notifications())
    }

    /// Take a photo
    pub fn capture_photo(&mut self) -> Result<()> {
        self.session_mut()?.capture_photo()
    }

    /// Read one property
    pub fn get_property(&mut self, code: PropertyCode) -> Result<PropertyValue> {
        self.session_mut()?.get_property(code)
    }

    /// Write one property
    pub fn set_property(&mut self, code: PropertyCode, value: u64) -> Result<()> {
        self.session_mut()?.set_property(code, value)
    }

    /// Set ISO sensitivity
    pub fn set_iso(&mut self, iso: u32) -> Result<()> {
        let value = self.encoder.iso(iso)?;
        self.set_property(PropertyCode::ISO_SENSITIVITY, value)
    }

    /// Set the exposure time in seconds
    pub fn set_shutter_speed(&mut self, seconds: f64) -> Result<()> {
        let value = self.encoder.shutter_speed(seconds)?;
        self.set_property(PropertyCode::SHUTTER_SPEED, value)
    }

    /// Set the aperture as an f-number
    pub fn set_aperture(&mut self, f_number: f64) -> Result<()> {
        let value = self.encoder.aperture(f_number)?;
        self.set_property(PropertyCode::F_NUMBER, value)
    }

    /// Register the callback run when the camera reports the link up
    pub fn register_connect_callback<F>(&self, callback: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.session()?
            .dispatcher()
            .set_connect_callback(Some(Arc::new(callback)));
        Ok(())
    }

    /// Register the callback run with the reason code when the link drops
    pub fn register_disconnect_callback<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(VendorCode) + Send + Sync + 'static,
    {
        self.session()?
            .dispatcher()
            .set_disconnect_callback(Some(Arc::new(callback)));
        Ok(())
    }

    /// Register the callback run when device properties change
    pub fn register_property_changed_callback<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&[PropertyCode]) + Send + Sync + 'static,
    {
        self.session()?
            .dispatcher()
            .set_property_changed_callback(Some(Arc::new(callback)));
        Ok(())
    }

    /// Register the callback run when the camera reports an error
    pub fn register_error_callback<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(VendorCode) + Send + Sync + 'static,
    {
        self.session()?
            .dispatcher()
            .set_error_callback(Some(Arc::new(callback)));
        Ok(())
    }

    /// Subscribe to camera events
    pub fn subscribe_events(&self) -> Result<broadcast::Receiver<CameraEvent>> {
        Ok(self.events.subscribe::<CameraEvent>()?)
    }

    fn usb(&mut self) -> &mut UsbDiagnostics {
        let discovery = &self.config.get().discovery;
        self.usb
            .get_or_insert_with(|| UsbDiagnostics::from_config(discovery))
    }

    /// Scan the raw USB bus and log a diagnostic report
    ///
    /// Works in any lifecycle stage; the vendor backend is not involved.
    pub fn debug_usb_devices(&mut self) -> UsbReport {
        let sdk_devices = self.device_count();
        let usb = self.usb();
        if let Err(e) = usb.scan() {
            warn!("USB scan failed: {}", e);
        }
        info!("{} target-vendor USB device(s)", usb.target_devices().count());
        let report = usb.record_report(sdk_devices).clone();
        for line in report.to_string().lines() {
            info!("{}", line);
        }
        report
    }

    /// Human-readable dump of the last USB scan; does not rescan the bus
    pub fn usb_devices_info(&self) -> String {
        match self.usb.as_ref().and_then(|u| u.last_report()) {
            Some(report) => report.to_string(),
            None => "No USB scan has been run\n".to_string(),
        }
    }

    /// Errors recorded by the last USB scan
    pub fn usb_errors(&self) -> &[String] {
        self.usb.as_ref().map(|u| u.errors()).unwrap_or(&[])
    }
}

impl fmt::Debug for CameraRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraRemote")
            .field("backend", &self.backend.name())
            .field("lifecycle", &self.lifecycle)
            .field("session", &self.session)
            .finish()
    }
}

impl Drop for CameraRemote {
    fn drop(&mut self) {
        self.exit();
    }
}

/// A shareable, async handle to a [`CameraRemote`]
#[derive(Clone)]
pub struct SharedCamera {
    inner: Arc<Mutex<CameraRemote>>,
    timeout: Option<Duration>,
}

impl SharedCamera {
    /// Wrap a camera; the timeout comes from `connection.operation_timeout_ms`
    pub fn new(camera: CameraRemote) -> Self {
        let timeout = camera.config.get().connection.operation_timeout();
        Self {
            inner: Arc::new(Mutex::new(camera)),
            timeout,
        }
    }

    /// Override the operation timeout
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Lock the camera for synchronous use
    pub fn lock(&self) -> MutexGuard<'_, CameraRemote> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn call<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut CameraRemote) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        let span = operation_span(name, "camera");
        run_blocking(name, self.timeout, move || {
            let _guard = span.enter();
            let mut camera = inner.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut camera)
        })
        .await
    }

    /// Initialize the backend
    pub async fn setup(&self) -> Result<()> {
        self.call("setup", |camera| camera.setup()).await
    }

    /// Enumerate cameras
    pub async fn enumerate_devices(&self) -> Result<usize> {
        self.call("enumerate", |camera| camera.enumerate_devices()).await
    }

    /// Connect, returning the connected model name
    pub async fn connect(&self, index: usize) -> Result<String> {
        self.call("connect", move |camera| {
            camera.connect(index).map(|handle| handle.model.clone())
        })
        .await
    }

    /// Disconnect
    pub async fn disconnect(&self) -> Result<()> {
        self.call("disconnect", |camera| camera.disconnect()).await
    }

    /// Take a photo
    pub async fn capture_photo(&self) -> Result<()> {
        self.call("capture", |camera| camera.capture_photo()).await
    }

    /// Read one property
    pub async fn get_property(&self, code: PropertyCode) -> Result<PropertyValue> {
        self.call("get_property", move |camera| camera.get_property(code))
            .await
    }

    /// Write one property
    pub async fn set_property(&self, code: PropertyCode, value: u64) -> Result<()> {
        self.call("set_property", move |camera| camera.set_property(code, value))
            .await
    }

    /// Tear down
    pub async fn exit(&self) -> Result<()> {
        self.call("exit", |camera| {
            camera.exit();
            Ok(())
        })
        .await
    }

    /// Subscribe to camera events
    pub fn subscribe_events(&self) -> Result<broadcast::Receiver<CameraEvent>> {
        self.lock().subscribe_events()
    }
}

impl fmt::Debug for SharedCamera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCamera")
            .field("timeout", &self.timeout)
            .finish()
    }
}
