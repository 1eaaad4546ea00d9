//! hid-broker
//!
//! Shares raw HID keyboards and macro pads with local applications. Each
//! registered device gets its own I/O loop; clients talk to the broker over
//! an identity-framed TCP request/reply socket using JSON requests.

mod broker;
mod config;
mod device;
mod hid;
mod network;

use anyhow::{Context, Result};
use broker::{Broker, spawn_broker_worker};
use clap::Parser;
use common::{BrokerBridge, BrokerCommand, HidTransport, create_broker_bridge, setup_logging};
use config::ServerConfig;
use hid::RusbTransport;
use network::RouterServer;
use protocol::DeviceIdentity;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "hid-broker")]
#[command(author, version, about = "Raw HID report broker")]
#[command(long_about = "
Multiplexes application messages onto raw HID devices and serves them as a
request/reply service.

EXAMPLES:
    # Run with default config
    hid-broker

    # Register a device at startup
    hid-broker --device 0x3434:0x0321

    # Show which raw HID interfaces the configured devices expose
    hid-broker --list-devices --device 3434:0321

CONFIGURATION:
    The broker looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/hid-broker/server.toml
    3. /etc/hid-broker/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Address to listen on, overrides the configured one
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// Device to register at startup (VID:PID), may be repeated
    #[arg(short, long = "device", value_name = "VID:PID")]
    devices: Vec<DeviceIdentity>,

    /// List raw HID interfaces of the configured devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let path = ServerConfig::default_path();
        ServerConfig::default()
            .save(&path)
            .context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        ServerConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ServerConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("hid-broker v{}", env!("CARGO_PKG_VERSION"));

    let mut devices = config.broker.device_identities()?;
    for device in &args.devices {
        if !devices.contains(device) {
            devices.push(device.clone());
        }
    }

    let transport: Arc<dyn HidTransport> = Arc::new(RusbTransport::new());

    if args.list_devices {
        return list_devices_mode(transport.as_ref(), &config, &devices);
    }

    let bind_addr = args.bind.as_deref().unwrap_or(&config.server.bind_addr);
    run(config.clone(), bind_addr, transport, devices).await
}

/// Print the raw HID interfaces of each device and exit
fn list_devices_mode(
    transport: &dyn HidTransport,
    config: &ServerConfig,
    devices: &[DeviceIdentity],
) -> Result<()> {
    if devices.is_empty() {
        println!("No devices configured. Pass --device VID:PID or set [broker] devices.");
        return Ok(());
    }

    for device in devices {
        let candidates = transport
            .enumerate(device.vendor_id, device.product_id)
            .with_context(|| format!("Failed to enumerate {}", device))?;

        if candidates.is_empty() {
            println!("{}: not connected", device);
            continue;
        }

        println!("{}:", device);
        for candidate in candidates {
            let raw = candidate.matches(
                device.vendor_id,
                device.product_id,
                config.device.usage_page,
                config.device.usage,
            );
            println!(
                "  {} usage {:#06x}:{:#04x}{} - {} {}",
                candidate.path,
                candidate.usage_page,
                candidate.usage,
                if raw { " (raw HID)" } else { "" },
                candidate
                    .manufacturer
                    .as_deref()
                    .unwrap_or("Unknown Manufacturer"),
                candidate.product.as_deref().unwrap_or("Unknown Product")
            );
        }
    }

    Ok(())
}

async fn run(
    config: ServerConfig,
    bind_addr: &str,
    transport: Arc<dyn HidTransport>,
    devices: Vec<DeviceIdentity>,
) -> Result<()> {
    let broker = Arc::new(Broker::new(transport, config.broker_config()));
    publish_pin(broker.management_pin(), config.broker.pin_path().as_deref())?;

    for device in devices {
        if let Err(e) = broker.add_device(device.clone()) {
            warn!("Failed to add device {}: {}", device, e);
        }
    }

    let (bridge, worker) = create_broker_bridge();
    let worker_handle =
        spawn_broker_worker(broker.clone(), worker).context("Failed to spawn broker thread")?;

    let server = RouterServer::bind(bind_addr, bridge.clone()).await?;

    info!("Press Ctrl+C to shutdown");
    let result = tokio::select! {
        result = server.run() => result,
        signal = signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                Err(e) => error!("Error waiting for Ctrl+C: {}", e),
            }
            Ok(())
        }
    };

    shutdown(bridge, worker_handle, &broker).await;
    info!("Broker shutdown complete");
    result
}

/// Log the management pin and write it where management clients can read it
fn publish_pin(pin: &str, path: Option<&Path>) -> Result<()> {
    info!("Management pin: {}", pin);

    if let Some(path) = path {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, pin)
            .with_context(|| format!("Failed to write pin file: {}", path.display()))?;
        info!("Management pin written to {}", path.display());
    }
    Ok(())
}

async fn shutdown(
    bridge: BrokerBridge,
    worker_handle: std::thread::JoinHandle<()>,
    broker: &Broker,
) {
    if let Err(e) = bridge.send_command(BrokerCommand::Shutdown).await {
        error!("Failed to stop broker thread: {}", e);
    }
    drop(bridge);

    let joined = tokio::task::spawn_blocking(move || worker_handle.join()).await;
    if !matches!(joined, Ok(Ok(()))) {
        error!("Broker thread did not exit cleanly");
    }

    broker.shutdown_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repeated_devices() {
        let args = Args::try_parse_from([
            "hid-broker",
            "--device",
            "0x3434:0x0321",
            "-d",
            "1234:abcd",
            "--bind",
            "127.0.0.1:0",
        ])
        .unwrap();

        assert_eq!(
            args.devices,
            vec![
                DeviceIdentity::new(0x3434, 0x0321),
                DeviceIdentity::new(0x1234, 0xABCD)
            ]
        );
        assert_eq!(args.bind.as_deref(), Some("127.0.0.1:0"));
    }

    #[test]
    fn test_rejects_bad_device() {
        assert!(Args::try_parse_from(["hid-broker", "--device", "keyboard"]).is_err());
    }

    #[test]
    fn test_publish_pin_writes_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run").join("pin");
        publish_pin("12345", Some(&path)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "12345");
    }
}
