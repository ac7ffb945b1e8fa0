//! Binary entrypoint for the Quakemesh CLI.
//!
//! Commands:
//! - `start --role <sender|mesh-gateway|wifi-gateway>` - run one device role
//! - `init` - create a starter `quakemesh.toml`
//! - `status` - print the configuration summary and process counters
//! - `simulate --firmware <file>` - run all three tiers in-process and push an update
//!
//! See the library crate docs for module-level details: `quakemesh::`.
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use quakemesh::cloud::{HttpTelemetry, NoTelemetry, TelemetrySink};
use quakemesh::config::Config;
use quakemesh::ota::{FileFlashSink, HttpFirmwareSource};
use quakemesh::protocol::{DeviceRole, FirmwareVersion};
use quakemesh::roles::{shutdown_channel, MeshGateway, RunOutcome, SenderNode, ShutdownRx, WifiGateway, RESTART_EXIT_CODE};
use quakemesh::sensor::SimulatedSensor;
use quakemesh::simulate::{self, SimulationOptions};
use quakemesh::transport::udp::UdpMesh;

#[derive(Parser)]
#[command(name = "quakemesh")]
#[command(about = "Seismic telemetry relay for self-organizing mesh networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "quakemesh.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one device role until interrupted
    Start {
        /// Device role to run
        #[arg(short, long, value_enum)]
        role: DeviceRole,

        /// Serial port for the gateway link (overrides config)
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Show configuration and counters
    Status,
    /// Run sender, mesh gateway and WiFi gateway in-process and distribute a firmware image
    Simulate {
        /// Firmware image to distribute
        #[arg(short, long)]
        firmware: String,
        /// Version to advertise for the image (defaults to one patch above the configured firmware)
        #[arg(long)]
        fw_version: Option<String>,
        /// Number of simulated sender nodes
        #[arg(short, long, default_value_t = 3)]
        senders: usize,
        /// Seconds to wait for every sender to finish
        #[arg(short, long, default_value_t = 120)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start { role, port } => {
            let mut config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            if let Some(p) = port {
                config.serial.port = p;
            }
            info!(
                "Starting Quakemesh v{} as {} (node {}, firmware {})",
                env!("CARGO_PKG_VERSION"),
                role,
                config.device.node_id,
                config.device.fw_version
            );

            let (stop, shutdown) = shutdown_channel();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received shutdown signal, stopping");
                    let _ = stop.send(true);
                }
            });

            let outcome = match role {
                DeviceRole::Sender => run_sender(&config, shutdown).await?,
                DeviceRole::MeshGateway => run_mesh_gateway(&config, shutdown).await?,
                DeviceRole::WifiGateway => {
                    if config.cloud.enabled {
                        let telemetry =
                            HttpTelemetry::new(config.cloud.base_url.clone(), Duration::from_secs(config.cloud.timeout_secs));
                        run_wifi_gateway(&config, telemetry, shutdown).await?
                    } else {
                        run_wifi_gateway(&config, NoTelemetry, shutdown).await?
                    }
                }
            };
            match outcome {
                RunOutcome::Shutdown => info!("Quakemesh stopped"),
                RunOutcome::Restart { reason } => {
                    warn!("Restart requested ({}), exiting with status {}", reason, RESTART_EXIT_CODE);
                    std::process::exit(RESTART_EXIT_CODE);
                }
            }
        }
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            println!("Created default configuration at {}", cli.config);
            println!("Edit [device] node_id and access_token before starting a role.");
        }
        Commands::Status => {
            let config = match pre_config {
                Some(c) => c,
                None => Config::load(&cli.config).await?,
            };
            println!("Quakemesh v{}", env!("CARGO_PKG_VERSION"));
            println!("Node: {} ({})", config.device.node_id, config.device.name);
            println!("Firmware: {}", config.device.fw_version);
            println!("Mesh UDP port: {}", config.mesh.udp_port);
            println!("Serial link: {} @ {}", config.serial.port, config.serial.baud_rate);
            println!(
                "Relay queue: {} slots, congestion at {}%",
                config.relay.capacity, config.relay.congestion_threshold_pct
            );
            println!(
                "OTA: chunk {} bytes, auto {}, manifest {}",
                config.ota.chunk_size,
                if config.ota.auto_enabled { "on" } else { "off" },
                config.ota.manifest_url
            );
            println!(
                "Cloud: {}",
                if config.cloud.enabled { config.cloud.base_url.as_str() } else { "disabled" }
            );
            println!("{}", serde_json::to_string_pretty(&quakemesh::metrics::snapshot())?);
        }
        Commands::Simulate {
            firmware,
            fw_version,
            senders,
            timeout,
        } => {
            let config = pre_config.unwrap_or_default();
            let image = tokio::fs::read(&firmware)
                .await
                .map_err(|e| anyhow!("Failed to read firmware image {}: {}", firmware, e))?;
            let version = match fw_version {
                Some(v) => v,
                None => {
                    let current: FirmwareVersion = config
                        .device
                        .fw_version
                        .parse()
                        .map_err(|e| anyhow!("Configured firmware version is invalid: {}", e))?;
                    FirmwareVersion::new(current.major, current.minor, current.patch + 1).to_string()
                }
            };
            let report = simulate::run(
                &config,
                SimulationOptions {
                    senders,
                    firmware: image,
                    version,
                    timeout: Duration::from_secs(timeout),
                },
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.all_updated {
                return Err(anyhow!("not every sender took the update"));
            }
        }
    }

    Ok(())
}

async fn run_sender(config: &Config, shutdown: ShutdownRx) -> Result<RunOutcome> {
    let (mesh, events) = UdpMesh::bind(config.device.id(), config.mesh.udp_port).await?;
    let sensor = SimulatedSensor::new(config.device.node_id as u64, config.sender.simulated_event_probability);
    let sink = FileFlashSink::new(&config.sender.flash_path);
    SenderNode::new(config, mesh, events, sensor, sink).run(shutdown).await
}

#[cfg(feature = "serial")]
async fn run_mesh_gateway(config: &Config, shutdown: ShutdownRx) -> Result<RunOutcome> {
    let (mesh, mesh_rx) = UdpMesh::bind(config.device.id(), config.mesh.udp_port).await?;
    let (link, serial_rx) = quakemesh::transport::serial::open_serial_link(
        &config.serial.port,
        config.serial.baud_rate,
        config.serial.pacing(),
    )
    .await?;
    MeshGateway::new(config, mesh, mesh_rx, link, serial_rx).run(shutdown).await
}

#[cfg(not(feature = "serial"))]
async fn run_mesh_gateway(_config: &Config, _shutdown: ShutdownRx) -> Result<RunOutcome> {
    Err(anyhow!("mesh gateway needs the serial link; rebuild with --features serial"))
}

#[cfg(feature = "serial")]
async fn run_wifi_gateway<T: TelemetrySink>(config: &Config, telemetry: T, shutdown: ShutdownRx) -> Result<RunOutcome> {
    let (link, serial_rx) = quakemesh::transport::serial::open_serial_link(
        &config.serial.port,
        config.serial.baud_rate,
        config.serial.pacing(),
    )
    .await?;
    let source = HttpFirmwareSource::new(
        config.ota.manifest_url.clone(),
        Duration::from_secs(config.ota.manifest_timeout_secs),
        Duration::from_secs(config.ota.firmware_timeout_secs),
    );
    let (gateway, handle) = WifiGateway::new(config, link, serial_rx, source, telemetry);

    #[cfg(feature = "web")]
    {
        if config.web.enabled {
            let bind = config.web.bind.clone();
            let web_shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = quakemesh::web::serve(&bind, handle, web_shutdown).await {
                    warn!("{}", e);
                }
            });
        }
    }
    #[cfg(not(feature = "web"))]
    drop(handle);

    gateway.run(shutdown).await
}

#[cfg(not(feature = "serial"))]
async fn run_wifi_gateway<T: TelemetrySink>(_config: &Config, _telemetry: T, _shutdown: ShutdownRx) -> Result<RunOutcome> {
    Err(anyhow!("WiFi gateway needs the serial link; rebuild with --features serial"))
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // Base level from CLI verbosity overrides config
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    let log_file = config.as_ref().and_then(|c| c.logging.file.clone());
    match log_file.and_then(|file| std::fs::OpenOptions::new().create(true).append(true).open(file).ok()) {
        Some(f) => {
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
        None => {
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    }
    let _ = builder.try_init();
}
