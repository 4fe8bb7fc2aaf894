use std::sync::Arc;
use std::time::Duration;

use camremote_core::config::{Config, SharedConfig};
use camremote_core::logging;
use camremote_devices::{
    CameraEvent, CameraRemote, PropertyCode, SharedCamera, SimulatedBackend, SimulatedCamera,
};

use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the logger
    logging::init_with_filter("debug")?;

    // A backend with one simulated body attached
    let backend = Arc::new(
        SimulatedBackend::new().with_camera(SimulatedCamera::new("ILCE-7M4").with_serial("D0001")),
    );
    let camera = SharedCamera::new(CameraRemote::new(backend, SharedConfig::new(Config::default())))
        .with_timeout(Some(Duration::from_secs(5)));

    // Subscribe to camera events
    let mut event_rx = camera.subscribe_events()?;
    let listener = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match event {
                CameraEvent::StateChanged { old_state, new_state } => {
                    info!("Connection state {:?} -> {:?}", old_state, new_state);
                }
                CameraEvent::Connected { version } => {
                    info!("Camera link up (protocol {})", version);
                }
                other => info!("Camera event: {:?}", other),
            }
        }
    });

    camera.setup().await?;
    let count = camera.enumerate_devices().await?;
    info!("{} camera(s) found", count);

    let model = camera.connect(0).await?;
    info!("Connected to {}", model);

    camera.set_property(PropertyCode::ISO_SENSITIVITY, 800).await?;
    let iso = camera.get_property(PropertyCode::ISO_SENSITIVITY).await?;
    info!("ISO is now {}", iso.value);

    camera.capture_photo().await?;
    camera.disconnect().await?;
    camera.exit().await?;

    // Give the listener a moment to drain
    tokio::time::sleep(Duration::from_millis(100)).await;
    listener.abort();

    Ok(())
}
