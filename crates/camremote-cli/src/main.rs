//! Command-line front end for camremote.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use camremote_core::config::{Config, ConfigBuilder, SharedConfig};
use camremote_core::logging;
use camremote_devices::backend::format_version;
use camremote_devices::{
    CameraRemote, PropertyCode, SharedCamera, SimulatedBackend, SimulatedCamera, UsbDiagnostics,
};

/// Remote camera discovery and control.
#[derive(Parser, Debug)]
#[command(name = "camremote")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Scan the raw USB bus and explain what was found.
    Usb {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run a full session against a simulated camera.
    Simulate {
        /// Model name of the simulated camera.
        #[arg(short, long, default_value = "ILCE-7M4")]
        model: String,
        /// ISO to set before capturing.
        #[arg(long)]
        iso: Option<u32>,
        /// Aperture to set before capturing, as an f-number.
        #[arg(long)]
        aperture: Option<f64>,
        /// Exposure time to set before capturing, in seconds.
        #[arg(long)]
        shutter: Option<f64>,
    },
    /// Print the effective configuration.
    Config,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut builder = ConfigBuilder::new().with_environment_prefix("camremote");
    if let Some(path) = &args.config {
        builder = builder.with_config_file(path);
    }
    let mut config = builder.build().context("failed to load configuration")?;
    if args.verbose {
        config.logging.level = "debug".to_string();
    }
    Ok(config)
}

fn usb(config: &Config, json: bool) -> Result<()> {
    let mut diagnostics = UsbDiagnostics::from_config(&config.discovery);
    if let Err(e) = diagnostics.scan() {
        warn!("USB scan failed: {}", e);
    }
    let report = diagnostics.report(0);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report);
    }
    Ok(())
}

async fn simulate(
    config: Config,
    model: String,
    iso: Option<u32>,
    aperture: Option<f64>,
    shutter: Option<f64>,
) -> Result<()> {
    let backend = Arc::new(SimulatedBackend::new().with_camera(SimulatedCamera::new(model)));
    let camera = SharedCamera::new(CameraRemote::new(backend, SharedConfig::new(config)));

    camera.setup().await?;
    info!(
        "Backend version {}",
        format_version(camera.lock().sdk_version()?)
    );
    let count = camera.enumerate_devices().await?;
    info!("{} camera(s) found", count);
    let model = camera.connect(0).await?;
    println!("connected to {}", model);

    {
        let mut session = camera.lock();
        if let Some(iso) = iso {
            session.set_iso(iso)?;
        }
        if let Some(aperture) = aperture {
            session.set_aperture(aperture)?;
        }
        if let Some(shutter) = shutter {
            session.set_shutter_speed(shutter)?;
        }
    }

    for code in [
        PropertyCode::F_NUMBER,
        PropertyCode::SHUTTER_SPEED,
        PropertyCode::ISO_SENSITIVITY,
    ] {
        let property = camera.get_property(code).await?;
        println!("{:<32} {}", code.to_string(), property.value);
    }

    camera.capture_photo().await?;
    println!("captured");
    camera.disconnect().await?;
    camera.exit().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    logging::init_from_config(&config.logging)?;

    match args.command {
        Command::Usb { json } => usb(&config, json),
        Command::Simulate {
            model,
            iso,
            aperture,
            shutter,
        } => simulate(config, model, iso, aperture, shutter).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
