//! usbhost
//!
//! Command line front end for the USB host library: lists attached devices,
//! watches devices come and go, and exchanges data with bulk endpoints.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use cli::config::HostConfig;
use common::{LogLevel, MonitorEvent, setup_logging};
use host::{DeviceMonitor, UsbHost};
use model::{DeviceConfig, DeviceFilter, DeviceIdentity, OpenMode, TransferKind};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "usbhost")]
#[command(author, version, about = "Inspect and talk to USB devices")]
#[command(long_about = "
Inspect and talk to USB devices through libusb.

EXAMPLES:
    # List attached devices with their endpoints
    usbhost list --detail

    # Report devices as they are plugged in and removed
    usbhost watch 0x1234:0x5678

    # Send four bytes to a loopback device and read the echo
    usbhost bulk --device 0x1234:0x5678 --ep-in 0x81 --ep-out 0x01 --write deadbeef --read 4

CONFIGURATION:
    Configuration files are searched in the following order:
    1. Path specified with --config
    2. ~/.config/usbhost/usbhost.toml
    3. /etc/usbhost/usbhost.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (none, error, warning, info, debug, debugall)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached devices
    List {
        /// Include configurations, endpoints and product strings
        #[arg(long)]
        detail: bool,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Report arrivals and removals until Ctrl+C
    Watch {
        /// Filters to report presence for (VID:PID[@BUS.PORT]); defaults to the configured list
        filters: Vec<DeviceFilter>,
    },

    /// Write to and read from a pair of bulk endpoints
    Bulk {
        /// Device to open (VID:PID[@BUS.PORT])
        #[arg(long)]
        device: DeviceFilter,

        /// Configuration value
        #[arg(long, default_value_t = 1)]
        configuration: u8,

        /// Interface to claim
        #[arg(long, default_value_t = 0)]
        interface: u8,

        /// Alternate setting of the interface
        #[arg(long, default_value_t = 0)]
        alternate: u8,

        /// IN endpoint address
        #[arg(long, value_parser = parse_byte, default_value = "0x81")]
        ep_in: u8,

        /// OUT endpoint address
        #[arg(long, value_parser = parse_byte, default_value = "0x01")]
        ep_out: u8,

        /// Hex encoded bytes to write
        #[arg(long, value_name = "HEX")]
        write: Option<String>,

        /// Number of bytes to read
        #[arg(long)]
        read: Option<usize>,

        /// How long to wait for each direction, in milliseconds
        #[arg(long, default_value_t = 1000)]
        wait_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = args.config.clone().unwrap_or_else(HostConfig::default_path);
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        HostConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    let log_level = args.log_level.unwrap_or(config.logging.level);
    setup_logging(log_level.directive()).context("Failed to setup logging")?;
    debug!("usbhost v{}, log level {}", env!("CARGO_PKG_VERSION"), log_level);

    let host = UsbHost::with_libusb()
        .context("Failed to initialize libusb")?
        .with_channel_settings(config.transfer.clone());
    host.set_log_level(log_level);

    match args.command {
        None => list(&host, false, false),
        Some(Command::List { detail, json }) => list(&host, detail, json),
        Some(Command::Watch { filters }) => {
            let filters = if filters.is_empty() {
                config.watch_filters()?
            } else {
                filters
            };
            let monitor = host
                .monitor(config.monitor.clone())
                .context("Failed to start device monitor")?;
            watch(monitor, filters).await
        }
        Some(Command::Bulk {
            device,
            configuration,
            interface,
            alternate,
            ep_in,
            ep_out,
            write,
            read,
            wait_ms,
        }) => {
            let write = write.as_deref().map(parse_hex).transpose()?;
            let transfer = BulkTransfer {
                config: DeviceConfig::new(configuration, interface, alternate),
                ep_in,
                ep_out,
                write,
                read,
                wait: Duration::from_millis(wait_ms),
            };
            tokio::task::spawn_blocking(move || bulk(&host, device, transfer))
                .await
                .context("Bulk transfer task failed")?
        }
    }
}

/// Print the device directory
fn list(host: &UsbHost, detail: bool, json: bool) -> Result<()> {
    let devices = host.devices(detail).context("Failed to enumerate devices")?;

    if json {
        let text = serde_json::to_string_pretty(&devices).context("Failed to serialize devices")?;
        println!("{}", text);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in &devices {
        print_device(device);
        if detail {
            for config in &device.configurations {
                println!("      {}", config);
            }
            for endpoint in &device.endpoints {
                println!("      {}", endpoint);
            }
        }
        println!();
    }
    Ok(())
}

fn print_device(device: &DeviceIdentity) {
    println!(
        "  {:04x}:{:04x} - {}",
        device.vendor_id,
        device.product_id,
        device.description.as_deref().unwrap_or("Unknown Product")
    );
    println!(
        "      Bus {:03} Port {:03} Class {:02x}/{:02x} Speed: {}",
        device.bus,
        device.port,
        device.class,
        device.subclass,
        device.speed.as_str()
    );
}

/// Print monitor events until Ctrl+C
async fn watch(monitor: DeviceMonitor, filters: Vec<DeviceFilter>) -> Result<()> {
    for filter in filters {
        monitor.add_device(filter);
    }

    println!("Watching for USB devices ({:?} mode), press Ctrl+C to stop", monitor.mode());
    print_presence(&monitor);

    let events = monitor.events();
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(MonitorEvent::Arrived(devices)) => {
                        for device in &devices {
                            println!("+ {}", device);
                        }
                    }
                    Ok(MonitorEvent::Removed(devices)) => {
                        for device in &devices {
                            println!("- {}", device);
                        }
                    }
                    Err(_) => break,
                }
                print_presence(&monitor);
            }
            result = signal::ctrl_c() => {
                result.context("Failed to wait for Ctrl+C")?;
                info!("Received Ctrl+C, stopping monitor");
                break;
            }
        }
    }

    monitor.shutdown();
    Ok(())
}

fn print_presence(monitor: &DeviceMonitor) {
    let present = monitor.present_devices();
    for filter in monitor.watched() {
        let state = if present.contains(&filter) { "present" } else { "absent" };
        println!("  {} {}", filter, state);
    }
}

struct BulkTransfer {
    config: DeviceConfig,
    ep_in: u8,
    ep_out: u8,
    write: Option<Vec<u8>>,
    read: Option<usize>,
    wait: Duration,
}

/// Open a device, write to its OUT endpoint and read back from its IN endpoint
fn bulk(host: &UsbHost, filter: DeviceFilter, transfer: BulkTransfer) -> Result<()> {
    let device = host.device(filter.clone(), transfer.config);
    device
        .open()
        .with_context(|| format!("Failed to open device {}", filter))?;
    info!("Opened {} at {} speed", device.filter(), device.speed_string());

    let channel = device.channel_pair(TransferKind::Bulk, transfer.ep_in, transfer.ep_out);
    channel
        .open(OpenMode::ReadWrite)
        .context("Failed to open bulk channel")?;

    if let Some(data) = &transfer.write {
        channel.write(data).context("Failed to submit write")?;
        if !channel.wait_for_bytes_written(transfer.wait) {
            bail!(
                "Write incomplete, {} byte(s) unsent (last status: {:?})",
                channel.bytes_to_write(),
                channel.last_status()
            );
        }
        println!("Wrote {} byte(s)", data.len());
    }

    if let Some(size) = transfer.read {
        channel.set_poll_size(size);
        channel.poll().context("Failed to submit read")?;
        if !channel.wait_for_ready_read(transfer.wait) {
            bail!("No data received (last status: {:?})", channel.last_status());
        }
        let data = channel.read_all().context("Failed to read")?;
        println!("Read {} byte(s): {}", data.len(), to_hex(&data));
    }

    channel.close();
    device.close();
    Ok(())
}

fn parse_byte(s: &str) -> Result<u8> {
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| anyhow!("'{}' must be a hex byte like 0x81", s))?;
    u8::from_str_radix(hex, 16).with_context(|| format!("'{}' is not a hex byte", s))
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim_start_matches("0x");
    if s.len() % 2 != 0 {
        bail!("hex data must have an even number of digits");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| anyhow!("'{}' is not valid hex data", s))
        })
        .collect()
}

fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}
