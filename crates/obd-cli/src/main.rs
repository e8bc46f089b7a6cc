//! obd-link - ELM327 Bluetooth LE diagnostics from the command line
//!
//! Finds an adapter, brings the link up and runs one diagnostic operation,
//! printing structured results as JSON on stdout. Logs go to stderr.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use ble_link::transport::mock::MockTransport;
use ble_link::transport::scripted::ScriptedElm;
use ble_link::{AdapterDescriptor, AdapterEngine, BleTransport};
use clap::{Parser, Subcommand};
use obd_client::ObdClient;
use serde_json::json;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::{AppConfig, LoggingConfig};

/// How long to look for an adapter before giving up
const DISCOVERY_WINDOW: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "obd-link")]
#[command(author, version, about = "ELM327 Bluetooth LE diagnostics")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "OBD_LINK_CONFIG")]
    config: Option<PathBuf>,

    /// Talk to a simulated adapter instead of the radio
    #[arg(long)]
    simulate: bool,

    /// Adapter name fragment or peripheral id (default: first plausible adapter)
    #[arg(short, long)]
    adapter: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby peripherals
    Scan {
        /// Scan duration in seconds
        #[arg(long, default_value = "5")]
        seconds: u64,
    },
    /// Read or clear trouble codes
    Dtc {
        /// Read pending (mode 07) instead of stored codes
        #[arg(long)]
        pending: bool,
        /// Clear stored codes
        #[arg(long, conflicts_with = "pending")]
        clear: bool,
    },
    /// Identification: VIN, serial numbers, adapter, battery voltage
    Info,
    /// Remote start, windows and sunroof
    Status,
    /// Send one raw command and print the reply
    Send {
        /// Command text, e.g. `0100` or `ATRV`
        command: String,
    },
}

/// Initialize logging
fn init_logging(settings: &LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        settings
            .level
            .parse::<Level>()
            .map_err(|_| anyhow!("invalid log level: {}", settings.level))?
    };
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr);

    if settings.json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    }
    .context("Failed to set tracing subscriber")
}

/// Demo vehicle for `--simulate`
fn demo_vehicle() -> ScriptedElm {
    ScriptedElm::new()
        .with_reply("03", "43 02 01 33 03 00")
        .with_reply("07", "47 00")
        .with_reply("04", "44")
        .with_header_reply(
            "7E0",
            "22F190",
            "014\r0: 62 F1 90 31 48 47\r1: 43 4D 38 32 36 33 33\r2: 41 30 30 34 33 35 32",
        )
        .with_header_reply("7E0", "22F18C", "62 F1 8C 45 43 4D 30 30 31 32 33 34")
        .with_header_reply("7E1", "22F18C", "62 F1 8C 54 43 4D 30 30 39 38 37 36")
        .with_header_reply("740", "224047", "62 40 47 01")
        .with_header_reply("726", "224101", "62 41 01 00")
        .with_header_reply("726", "224102", "62 41 02 00")
        .with_header_reply("726", "224103", "62 41 03 80")
        .with_header_reply("726", "224104", "62 41 04 FE")
        .with_header_reply("726", "224110", "62 41 10 02")
}

async fn build_transport(simulate: bool) -> Result<Arc<dyn BleTransport>> {
    if simulate {
        info!("Using simulated adapter");
        let elm = Arc::new(demo_vehicle());
        return Ok(Arc::new(MockTransport::elm327(elm.responder())));
    }
    radio_transport().await
}

#[cfg(feature = "btleplug")]
async fn radio_transport() -> Result<Arc<dyn BleTransport>> {
    let transport = ble_link::transport::btleplug::BtleplugTransport::new()
        .await
        .context("Failed to open Bluetooth adapter")?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "btleplug"))]
async fn radio_transport() -> Result<Arc<dyn BleTransport>> {
    bail!("obd-link was built without Bluetooth support; rebuild with --features btleplug or use --simulate")
}

fn selects(adapter: &AdapterDescriptor, selector: Option<&str>) -> bool {
    match selector {
        Some(wanted) => {
            adapter.id.as_str() == wanted
                || adapter
                    .name
                    .to_ascii_uppercase()
                    .contains(&wanted.to_ascii_uppercase())
        }
        None => adapter.is_obd_adapter && adapter.connectable,
    }
}

/// Scan, connect and wait for an initialized adapter
async fn bring_up(engine: &AdapterEngine, selector: Option<&str>) -> Result<()> {
    engine.start_scanning().await?;

    let config = engine.config();
    if !(config.auto_connect && selector.is_none()) {
        let mut discovered = engine.subscribe_discovered();
        let search = async {
            discovered
                .wait_for(|list| list.iter().any(|a| selects(a, selector)))
                .await
                .map(|list| list.iter().find(|a| selects(a, selector)).cloned())
        };
        let adapter = match tokio::time::timeout(DISCOVERY_WINDOW, search).await {
            Ok(Ok(Some(adapter))) => adapter,
            _ => {
                engine.stop_scanning().await;
                bail!("No matching adapter found within {:?}", DISCOVERY_WINDOW);
            }
        };
        engine.connect(adapter).await;
    }

    let limit = DISCOVERY_WINDOW
        + Duration::from_millis(
            config.connect_timeout_ms + config.reset_settle_ms + 4 * config.command_timeout_ms,
        );
    engine
        .wait_until_ready(limit)
        .await
        .context("Adapter did not become ready")?;
    if let Some(adapter) = engine.adapter() {
        info!(adapter = %adapter.name, "Adapter ready");
    }
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    let transport = build_transport(cli.simulate).await?;
    let engine = AdapterEngine::new(transport, config.link.clone());

    if let Commands::Scan { seconds } = cli.command {
        engine.start_scanning().await?;
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        engine.stop_scanning().await;
        return print_json(&serde_json::to_value(engine.discovered_adapters())?);
    }

    bring_up(&engine, cli.adapter.as_deref()).await?;
    let client = ObdClient::new(engine.clone(), config.vehicle.clone());

    let outcome = match cli.command {
        Commands::Scan { .. } => Ok(json!(null)),
        Commands::Dtc { clear: true, .. } => client.clear_dtcs().await.map(|()| json!({ "cleared": true })),
        Commands::Dtc { pending, .. } => {
            let codes = if pending {
                client.read_pending_dtcs().await
            } else {
                client.read_dtcs().await
            };
            codes.map(|codes| json!({ "pending": pending, "codes": codes }))
        }
        Commands::Info => Ok(json!({
            "adapter": engine.adapter(),
            "adapter_info": engine.adapter_info(),
            "protocol": client.read_active_protocol().await,
            "battery_voltage": client.read_battery_voltage().await,
            "vin": client.read_vin().await,
            "ecu_serial_number": client.read_ecu_serial_number().await,
            "tcu_serial_number": client.read_tcu_serial_number().await,
        })),
        Commands::Status => Ok(serde_json::to_value(client.read_vehicle_status().await)?),
        Commands::Send { command } => client
            .send_raw(&command)
            .await
            .map(|reply| json!({ "command": command, "reply": reply })),
    };

    engine.disconnect().await;
    print_json(&outcome?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&config.logging, cli.verbose)?;

    info!("=== obd-link v{} ===", env!("CARGO_PKG_VERSION"));
    if let Err(e) = run(cli, config).await {
        warn!(error = %e, "obd-link failed");
        return Err(e);
    }
    Ok(())
}
