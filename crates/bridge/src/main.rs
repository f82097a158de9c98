//! gser-sdio-bridge
//!
//! Configuration front end and loopback self-test for the USB serial to
//! SDIO bridge. On a device the bridge library is driven by the gadget and
//! SDIO drivers; this binary builds the bridge from its configuration with
//! no transport attached, loads the device-info block and exercises the
//! relays against in-memory transports.

use anyhow::{Context, Result};
use bridge::{Bridge, BridgeConfig, RestartHook, run_selftest};
use clap::Parser;
use common::setup_logging;
use common::test_utils::{MockControl, MockPeer};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "gser-sdio-bridge")]
#[command(
    author,
    version,
    about = "USB gadget serial to SDIO channel bridge"
)]
#[command(long_about = "
Relays USB gadget serial ports to SDIO shared-memory channels.

EXAMPLES:
    # Check the configuration and print every port's status
    gser-sdio-bridge

    # Use a custom config
    gser-sdio-bridge --config /path/to/bridge.toml

    # Push 1 MiB through every port in both directions
    gser-sdio-bridge --selftest 1048576

    # Same, with machine-readable status output
    gser-sdio-bridge --selftest 65536 --status-json

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/gser-sdio-bridge/bridge.toml
    3. /etc/gser-sdio-bridge/bridge.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print port status as JSON instead of text
    #[arg(long)]
    status_json: bool,

    /// Run a loopback test moving BYTES through every port each way
    #[arg(long, value_name = "BYTES")]
    selftest: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        bridge::config::load_config(path).context("Failed to load configuration")?
    } else {
        BridgeConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.bridge.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("gser-sdio-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "{} ports, {} workers, pools rx {}x{} tx {}x{}",
        config.ports.len(),
        config.bridge.workers,
        config.pool.rx_queue_size,
        config.pool.rx_buf_size,
        config.pool.tx_queue_size,
        config.pool.tx_buf_size
    );

    // Nothing is announced on this peer, so every port stays idle
    let bridge = Bridge::new(config.clone(), MockPeer::new(), MockControl::new())
        .context("Failed to build bridge")?;
    check_device_info(&bridge).await?;

    match args.selftest {
        Some(bytes) => {
            let selftest_config = config.clone();
            let report =
                tokio::task::spawn_blocking(move || run_selftest(&selftest_config, bytes))
                    .await
                    .context("Self-test task failed")?;

            let report = match report {
                Ok(report) => report,
                Err(e) => {
                    error!("Self-test failed: {:#}", e);
                    return Err(e);
                }
            };

            if args.status_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Self-test passed: {} bytes each way in {} ms",
                    report.bytes_per_direction, report.elapsed_ms
                );
                for port in &report.ports {
                    println!(
                        "  port {} ({}): {} bytes to host, {} bytes to peer",
                        port.port, port.data_channel, port.bytes_to_host, port.bytes_to_peer
                    );
                }
            }
        }
        None => {
            if args.status_json {
                println!("{}", serde_json::to_string_pretty(&bridge.status_all())?);
            } else {
                print!("{}", bridge.status_report());
            }
        }
    }

    Ok(())
}

/// Install the device-info exchange and wait for its block to load
async fn check_device_info(bridge: &Bridge) -> Result<()> {
    let restart: RestartHook = Arc::new(|| {
        warn!("Restart requested by host; no restart handler on this platform");
    });
    let Some(service) = bridge
        .install_device_info(Some(restart))
        .context("Failed to install device-info exchange")?
    else {
        return Ok(());
    };
    let Some(loader) = service.loader else {
        return Ok(());
    };

    match loader.await {
        Ok(true) => info!(
            "Device info ready for port {} (active: {})",
            bridge.config().diag.port,
            service.responder.is_active()
        ),
        Ok(false) => warn!("Device info unavailable; diagnostic exchange stays off"),
        Err(e) => error!("Device info loader panicked: {}", e),
    }
    Ok(())
}
