//! Command-line entry point for the rig.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rust_rig::config::Settings;
use rust_rig::console::{PortFactory, RigActor};
use rust_rig::error::RigError;
use rust_rig::hardware::registry::DeviceRegistry;
use rust_rig::motor::{Direction, MotorAxis, OpRequest};
use rust_rig::scale::{ScaleMonitor, ScaleReader};

#[derive(Parser)]
#[command(name = "rust_rig", about = "Servo axis and scale control rig", version)]
struct Cli {
    /// Path to the settings file.
    #[arg(long, default_value = "rig.toml")]
    config: PathBuf,

    /// Talk to real hardware instead of the built-in simulator.
    #[arg(long)]
    hardware: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enumerate reachable motion devices.
    List,
    /// Exercise the axis: home, absolute move, timed jog.
    Demo {
        /// Absolute target in encoder counts.
        #[arg(long, default_value_t = 20_000)]
        target: i32,
        /// Jog bound in seconds.
        #[arg(long, default_value_t = 2)]
        jog_secs: u64,
    },
    /// Stream scale readings.
    Scale {
        /// How long to watch, in seconds.
        #[arg(long, default_value_t = 10)]
        secs: u64,
    },
}

fn enumerate(hardware: bool) -> Result<DeviceRegistry> {
    if hardware {
        #[cfg(feature = "vendor_epos")]
        return Ok(rust_rig::hardware::epos::enumerate()?);
        #[cfg(not(feature = "vendor_epos"))]
        return Err(RigError::VendorFeatureDisabled.into());
    }
    Ok(rust_rig::hardware::sim::enumerate())
}

fn port_factory(hardware: bool) -> PortFactory {
    #[cfg(feature = "vendor_epos")]
    if hardware {
        return Box::new(|descriptor| {
            let port = rust_rig::hardware::epos::EposPort::open(descriptor)?;
            Ok(Box::new(port))
        });
    }
    // Unreachable with --hardware and no vendor feature: enumeration has
    // already failed by then.
    let _ = hardware;
    Box::new(|_descriptor| {
        let (axis, _handle) = rust_rig::hardware::sim::SimAxis::new();
        Ok(Box::new(axis))
    })
}

#[cfg(feature = "scale_serial")]
fn open_scale(settings: &Settings) -> Result<Box<dyn ScaleReader>> {
    let scale = rust_rig::scale::serial::SerialScale::open(&settings.scale)?;
    Ok(Box::new(scale))
}

#[cfg(not(feature = "scale_serial"))]
fn open_scale(settings: &Settings) -> Result<Box<dyn ScaleReader>> {
    if !settings.scale.port.is_empty() {
        return Err(RigError::SerialFeatureDisabled.into());
    }
    info!("serial scale support not compiled in, using mock scale");
    Ok(Box::new(rust_rig::scale::MockScale::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    match cli.command {
        Command::List => list(cli.hardware).await,
        Command::Demo { target, jog_secs } => demo(&settings, cli.hardware, target, jog_secs).await,
        Command::Scale { secs } => watch_scale(&settings, secs).await,
    }
}

async fn list(hardware: bool) -> Result<()> {
    let registry = enumerate(hardware)?;
    if registry.is_empty() {
        bail!("no motion devices found");
    }
    for device in registry.devices() {
        println!(
            "{} serial={} node={} via {}/{} port={} baud={}",
            device.device_name,
            device.serial_number,
            device.node_id,
            device.protocol,
            device.interface,
            device.port,
            device.baud_rate,
        );
    }
    Ok(())
}

async fn demo(settings: &Settings, hardware: bool, target: i32, jog_secs: u64) -> Result<()> {
    let registry = enumerate(hardware)?;
    let serial_number = registry
        .devices()
        .first()
        .map(|device| device.serial_number)
        .context("no motion devices found")?;

    let axis = MotorAxis::new(settings);
    let (actor, handle) = RigActor::new(axis, registry, port_factory(hardware));
    let actor = tokio::spawn(actor.run());

    handle.connect(serial_number).await?;
    handle.home().await?;

    let request = OpRequest::from_settings(&settings.motor);
    info!(target, "starting absolute move");
    handle.move_absolute(target, request).await?;
    let moved = handle.wait_complete().await.unwrap_or(false);
    info!(success = moved, "absolute move finished");

    info!(jog_secs, "starting timed jog");
    handle
        .jog(
            Direction::Backward,
            request.with_timeout(Duration::from_secs(jog_secs)),
        )
        .await?;
    let jogged = handle.wait_complete().await.unwrap_or(false);
    info!(success = jogged, "jog finished");

    let telemetry = handle.telemetry().await?;
    info!(
        state = %telemetry.state,
        busy = telemetry.busy,
        position = telemetry.position,
        velocity = telemetry.velocity,
        current_ma = telemetry.current_ma,
        "final telemetry"
    );

    handle.disconnect().await?;
    handle.shutdown().await;
    actor.await.context("console actor panicked")?;
    Ok(())
}

async fn watch_scale(settings: &Settings, secs: u64) -> Result<()> {
    let reader = open_scale(settings)?;
    let monitor = ScaleMonitor::start(reader, &settings.scale);
    let mut events = monitor.subscribe();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            event = events.recv() => match event {
                Ok(event) => info!(?event, "scale"),
                Err(_) => break,
            },
        }
    }
    monitor.shutdown().await;
    Ok(())
}
