//! Binary entrypoint for the meshbridge CLI.
//!
//! Commands:
//! - `start [--device <path>] [--http-port <n>] [--bind <addr>]` - connect to the radio and serve HTTP
//! - `init` - write a starter `config.toml`
//! - `probe [--device <path>] [-b <baud>] [--timeout <s>]` - open the device once and print a JSON summary
//!
//! See the library crate docs for module-level details: `meshbridge::`.
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;

use meshbridge::config::Config;
use meshbridge::gateway::{self, BridgeContext};
use meshbridge::link::{ConnectionSupervisor, DeviceLink};
use meshbridge::meshtastic::{format_node_id, MeshDriver, NodeLookup, PacketSink, RawPacket};
use meshbridge::relay::{inbound_sink, RelayQueue};

const DEFAULT_CONFIG: &str = "config.toml";

#[derive(Parser)]
#[command(name = "meshbridge")]
#[command(about = "HTTP and Server-Sent Events bridge for Meshtastic radios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (optional; defaults apply when config.toml is absent)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the radio and serve the HTTP bridge
    Start {
        /// Meshtastic device path (e.g., /dev/ttyUSB0)
        #[arg(short, long, env = "MESHTASTIC_DEVICE")]
        device: Option<String>,

        /// HTTP listen port
        #[arg(long, env = "PORT")]
        http_port: Option<u16>,

        /// HTTP listen address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Open the device once and report what it says about itself
    Probe {
        /// Device serial port
        #[arg(short, long, env = "MESHTASTIC_DEVICE")]
        device: Option<String>,
        /// Baud rate
        #[arg(short = 'b', long)]
        baud: Option<u32>,
        /// Seconds to wait for the config handshake
        #[arg(short, long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let explicit = cli.config.is_some();
    let config_path = cli.config.unwrap_or_else(|| DEFAULT_CONFIG.to_string());

    match cli.command {
        Commands::Start {
            device,
            http_port,
            bind,
        } => {
            let mut config = Config::load_or_default(&config_path, explicit).await?;
            config.apply_overrides(device, http_port, bind);
            config.validate()?;
            init_logging(&config, cli.verbose);
            info!("Starting meshbridge v{}", env!("CARGO_PKG_VERSION"));
            run_bridge(config).await?;
        }
        Commands::Init => {
            init_logging(&Config::default(), cli.verbose);
            if std::path::Path::new(&config_path).exists() {
                bail!("{} already exists; not overwriting", config_path);
            }
            Config::create_default(&config_path).await?;
            info!("Configuration file created at {}", config_path);
        }
        Commands::Probe {
            device,
            baud,
            timeout,
        } => {
            let mut config = Config::load_or_default(&config_path, explicit).await?;
            config.apply_overrides(device, None, None);
            if let Some(baud) = baud {
                config.meshtastic.baud_rate = baud;
            }
            if let Some(timeout) = timeout {
                config.meshtastic.handshake_timeout_secs = timeout;
            }
            config.validate()?;
            init_logging(&config, cli.verbose);
            let ok = probe(&config).await?;
            std::process::exit(if ok { 0 } else { 1 });
        }
    }

    Ok(())
}

#[cfg(feature = "serial")]
fn build_driver(config: &Config) -> Result<Arc<dyn MeshDriver>> {
    use meshbridge::meshtastic::serial::SerialDriver;
    Ok(Arc::new(SerialDriver::from_config(&config.meshtastic)))
}

#[cfg(not(feature = "serial"))]
fn build_driver(_config: &Config) -> Result<Arc<dyn MeshDriver>> {
    bail!("this build has no device driver; rebuild with the 'serial' feature")
}

async fn run_bridge(config: Config) -> Result<()> {
    let relay = Arc::new(RelayQueue::new());
    let driver = build_driver(&config)?;
    let link = DeviceLink::new(driver, inbound_sink(Arc::clone(&relay)));
    let supervisor = Arc::new(ConnectionSupervisor::new(link));

    // A failed first connect is not fatal; requests retry lazily.
    let sup = Arc::clone(&supervisor);
    if !tokio::task::spawn_blocking(move || sup.connect()).await? {
        warn!(
            "Could not connect to {} at startup; will retry on the next request",
            supervisor.device()
        );
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("Unable to listen for shutdown signal: {}", e),
        }
    });

    let ctx = BridgeContext::new(
        Arc::clone(&supervisor),
        relay,
        config.heartbeat(),
        shutdown_rx,
    );
    let served = gateway::serve(listener, ctx).await;

    let sup = Arc::clone(&supervisor);
    if let Err(e) = tokio::task::spawn_blocking(move || sup.shutdown()).await {
        warn!("Device shutdown task failed: {}", e);
    }
    info!("meshbridge stopped");
    served
}

async fn probe(config: &Config) -> Result<bool> {
    let driver = build_driver(config)?;
    info!(
        "Probing {} @ {} baud",
        config.meshtastic.port, config.meshtastic.baud_rate
    );
    let device = config.meshtastic.port.clone();
    let timeout = config.meshtastic.handshake_timeout_secs;
    let summary = tokio::task::spawn_blocking(move || {
        let sink: PacketSink = Arc::new(|_: &RawPacket, _: &dyn NodeLookup| {});
        let mut session = match driver.open(sink) {
            Ok(session) => session,
            Err(e) => {
                return serde_json::json!({
                    "status": "error",
                    "device": device,
                    "error": e.to_string(),
                    "timeout_seconds": timeout,
                })
            }
        };
        let node = session.my_node().ok();
        let payload = serde_json::json!({
            "status": if node.is_some() { "ok" } else { "incomplete" },
            "device": device,
            "node_id": node.map(|n| format_node_id(n.node_num)),
            "firmware": session.metadata().firmware_version,
            "node_count": session.nodes().len(),
            "timeout_seconds": timeout,
        });
        if let Err(e) = session.close() {
            warn!("Error closing probe session: {}", e);
        }
        payload
    })
    .await?;
    println!("{}", summary);
    Ok(summary["status"] == "ok")
}

fn init_logging(config: &Config, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config.logging.level_filter(),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    if let Some(ref file) = config.logging.file {
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
        {
            Ok(f) => {
                let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
                // Mirror to the console only when attached to a terminal
                let is_tty = atty::is(atty::Stream::Stdout);
                builder.format(move |fmt, record| {
                    let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                    let line = format!("{} [{}] {}", ts, record.level(), record.args());
                    if let Ok(mut guard) = write_mutex.lock() {
                        let _ = writeln!(guard, "{}", line);
                    }
                    if is_tty {
                        writeln!(fmt, "{}", line)
                    } else {
                        Ok(())
                    }
                });
            }
            Err(e) => {
                eprintln!("Cannot open log file {}: {} (logging to console)", file, e);
                builder.format(|fmt, record| {
                    let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                    writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
                });
            }
        }
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
