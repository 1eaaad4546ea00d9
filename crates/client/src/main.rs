//! hid-broker-ctl
//!
//! Command-line client for the HID broker: lists registered devices, sends
//! messages to them and manages the registry.

mod config;
mod network;
mod payload;

use anyhow::{Context, Result, anyhow};
use clap::{Args as ClapArgs, Parser, Subcommand};
use common::setup_logging;
use config::{ClientConfig, read_pin_file};
use network::BrokerClient;
use protocol::{DeviceIdentity, Request, Response};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "hid-broker-ctl")]
#[command(author, version, about = "Talk to a running hid-broker")]
#[command(long_about = "
Sends requests to a running hid-broker.

EXAMPLES:
    # List registered devices
    hid-broker-ctl list

    # Register a device (pin printed by the broker on start)
    hid-broker-ctl add --device 0x3434:0x0321 --pin 123456

    # Ask the device for its protocol version
    hid-broker-ctl write-read --device 0x3434:0x0321 --subsystem 1 --data 00

CONFIGURATION:
    The client looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/hid-broker/client.toml
    3. /etc/hid-broker/client.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<std::path::PathBuf>,

    /// Broker address, overrides the configured one
    #[arg(short, long, value_name = "ADDR", global = true)]
    endpoint: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered devices
    List,
    /// Queue a message without waiting for a reply
    Write(MessageArgs),
    /// Send a message and print the device's reply
    WriteRead(MessageArgs),
    /// Register a device with the broker
    Add(ManagementArgs),
    /// Unregister a device
    Remove(ManagementArgs),
}

#[derive(ClapArgs, Debug)]
struct MessageArgs {
    /// Target device (VID:PID)
    #[arg(short, long, value_name = "VID:PID")]
    device: DeviceIdentity,

    /// Subsystem number
    #[arg(short, long)]
    subsystem: u8,

    /// Message bytes in hex, e.g. "01 0a ff"
    #[arg(long, default_value = "", conflicts_with = "text")]
    data: String,

    /// Message as UTF-8 text
    #[arg(long)]
    text: Option<String>,
}

impl MessageArgs {
    fn message(&self) -> Result<Vec<u8>> {
        match &self.text {
            Some(text) => Ok(text.as_bytes().to_vec()),
            None => payload::parse_hex(&self.data),
        }
    }
}

#[derive(ClapArgs, Debug)]
struct ManagementArgs {
    /// Target device (VID:PID)
    #[arg(short, long, value_name = "VID:PID")]
    device: DeviceIdentity,

    /// Management pin
    #[arg(short, long, conflicts_with = "pin_file")]
    pin: Option<String>,

    /// File holding the management pin
    #[arg(long, value_name = "PATH")]
    pin_file: Option<String>,
}

impl ManagementArgs {
    fn resolve_pin(&self, config: &ClientConfig) -> Result<String> {
        if let Some(pin) = &self.pin {
            return Ok(pin.clone());
        }
        let path = self
            .pin_file
            .as_deref()
            .or(config.client.pin_file.as_deref())
            .ok_or_else(|| anyhow!("A management pin is required: pass --pin or --pin-file"))?;
        read_pin_file(path)
    }
}

fn build_request(command: &Command, config: &ClientConfig) -> Result<Request> {
    Ok(match command {
        Command::List => Request::List,
        Command::Write(args) => Request::Write {
            device_id: Some(args.device.clone()),
            subsystem: Some(args.subsystem),
            message: Some(args.message()?),
        },
        Command::WriteRead(args) => Request::WriteRead {
            device_id: Some(args.device.clone()),
            subsystem: Some(args.subsystem),
            message: Some(args.message()?),
        },
        Command::Add(args) => Request::AddDevice {
            device_id: Some(args.device.clone()),
            management_pin: Some(args.resolve_pin(config)?),
        },
        Command::Remove(args) => Request::RemoveDevice {
            device_id: Some(args.device.clone()),
            management_pin: Some(args.resolve_pin(config)?),
        },
    })
}

/// Text printed for a successful reply
fn render(command: &Command, response: &Response) -> Result<String> {
    if !response.is_ack() {
        return Err(anyhow!(
            "Broker returned an error: {}",
            response.error_message.as_deref().unwrap_or("unknown error")
        ));
    }

    Ok(match command {
        Command::List => match response.devices.as_deref() {
            Some([]) | None => "No devices registered.".to_string(),
            Some(devices) => devices.join("\n"),
        },
        Command::WriteRead(_) => {
            payload::format_hex(response.device_message.as_deref().unwrap_or_default())
        }
        Command::Write(_) | Command::Add(_) | Command::Remove(_) => "OK".to_string(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if let Some(ref path) = args.config {
        ClientConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ClientConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.client.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    let request = build_request(&args.command, &config)?;
    let endpoint = args.endpoint.as_deref().unwrap_or(&config.client.endpoint);
    debug!("Using broker at {}", endpoint);

    let mut client = BrokerClient::connect(endpoint, config.client.request_timeout()).await?;
    let response = client.request(&request).await?;

    println!("{}", render(&args.command, &response)?);
    Ok(())
}
