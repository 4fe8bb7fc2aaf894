use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use camremote_core::config::{ConfigBuilder, SharedConfig};
use camremote_devices::backend::Notification;
use camremote_devices::simulated::Faults;
use camremote_devices::{
    CameraEvent, CameraRemote, ConnectionState, DeviceError, LinkStatus, PropertyCode,
    SharedCamera, SimulatedBackend, SimulatedCamera, VendorCode,
};
use tempfile::tempdir;
use tokio_test::assert_ok;

fn load_config(contents: &str) -> SharedConfig {
    let dir = tempdir().unwrap();
    let path = dir.path().join("camremote.toml");
    fs::write(&path, contents).unwrap();
    let config = ConfigBuilder::new().with_config_file(&path).build().unwrap();
    SharedConfig::new(config)
}

const QUIET: &str = r#"
[connection]
preload_properties = false
operation_timeout_ms = 5000

[discovery]
usb_diagnostics_on_empty = false
"#;

#[test_log::test]
fn full_session_against_simulated_backend() {
    let backend = Arc::new(
        SimulatedBackend::new()
            .with_camera(SimulatedCamera::new("ILCE-7M4").with_serial("D0001")),
    );
    let mut camera = CameraRemote::new(backend.clone(), load_config(QUIET));
    let mut events = camera.subscribe_events().unwrap();

    assert_ok!(camera.setup());
    assert_eq!(camera.enumerate_devices().unwrap(), 1);
    assert_eq!(camera.device_model(0), Some("ILCE-7M4"));

    let properties_seen = Arc::new(AtomicUsize::new(0));
    let seen = properties_seen.clone();
    camera
        .register_property_changed_callback(move |codes| {
            seen.fetch_add(codes.len(), Ordering::SeqCst);
        })
        .unwrap();

    let handle = camera.connect(0).unwrap();
    assert_eq!(handle.model, "ILCE-7M4");
    assert_eq!(camera.state(), ConnectionState::Connected);
    assert!(matches!(camera.link_status(), LinkStatus::Up { .. }));
    assert_eq!(backend.calls("get_device_properties"), 0);

    assert_ok!(camera.set_iso(3200));
    assert_eq!(
        camera.get_property(PropertyCode::ISO_SENSITIVITY).unwrap().value,
        3200
    );
    assert!(properties_seen.load(Ordering::SeqCst) >= 1);

    assert_ok!(camera.capture_photo());
    assert_eq!(backend.commands().len(), 2);

    assert_ok!(camera.disconnect());
    assert!(!camera.is_connected());
    camera.exit();

    assert_eq!(backend.open_devices(), 0);
    assert_eq!(backend.live_enumerations(), 0);
    assert_eq!(backend.live_buffers(), 0);
    assert_eq!(backend.double_releases(), 0);
    assert!(!backend.is_initialized());

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CameraEvent::StateChanged { new_state, .. } = event {
            states.push(new_state);
        }
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnecting,
            ConnectionState::Disconnected,
        ]
    );
}

#[test]
fn link_drop_is_reported_not_torn_down() {
    let backend = Arc::new(SimulatedBackend::new().with_camera(SimulatedCamera::new("ZV-E10")));
    let mut camera = CameraRemote::new(backend.clone(), load_config(QUIET));
    camera.setup().unwrap();
    camera.connect(0).unwrap();

    let drops = Arc::new(AtomicUsize::new(0));
    let d = drops.clone();
    camera
        .register_disconnect_callback(move |reason| {
            assert_eq!(reason, VendorCode::CONNECT_DISCONNECTED);
            d.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    backend.emit(Notification::Disconnected {
        reason: VendorCode::CONNECT_DISCONNECTED,
    });
    camera.pump_notifications().unwrap();

    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(camera.state(), ConnectionState::Connected);
    assert!(matches!(camera.link_status(), LinkStatus::Down { .. }));

    assert_ok!(camera.disconnect());
    assert_eq!(backend.open_devices(), 0);
}

#[test]
fn connect_rejection_leaves_camera_reusable() {
    let backend = Arc::new(
        SimulatedBackend::new()
            .with_camera(SimulatedCamera::new("ILCE-7M4"))
            .with_faults(Faults {
                connect: Some(VendorCode::CONNECT_FAIL_BUSY),
                ..Faults::default()
            }),
    );
    let mut camera = CameraRemote::new(backend.clone(), load_config(QUIET));
    camera.setup().unwrap();

    let err = camera.connect(0).unwrap_err();
    assert!(matches!(err, DeviceError::Connect { .. }));
    assert!(!err.is_fatal());
    assert_eq!(camera.state(), ConnectionState::Disconnected);

    backend.set_faults(Faults::default());
    assert_ok!(camera.connect(0));
    assert!(camera.is_connected());
}

#[tokio::test]
async fn shared_camera_from_config() {
    let backend = Arc::new(SimulatedBackend::new().with_camera(SimulatedCamera::new("ILCE-1")));
    let shared = SharedCamera::new(CameraRemote::new(backend.clone(), load_config(QUIET)));

    shared.setup().await.unwrap();
    assert_eq!(shared.connect(0).await.unwrap(), "ILCE-1");
    let aperture = shared.get_property(PropertyCode::F_NUMBER).await.unwrap();
    assert_eq!(aperture.value, 280);
    shared.exit().await.unwrap();

    assert!(matches!(
        shared.capture_photo().await,
        Err(DeviceError::Lifecycle(_))
    ));
    assert_eq!(backend.calls("release"), 1);
}
