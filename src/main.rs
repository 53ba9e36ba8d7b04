//! Binary entrypoint for the gsmbridge CLI.
//!
//! Commands:
//! - `start` - run discovery, telemetry and balance loops until Ctrl-C
//! - `init` - write a starter `config.toml`
//! - `status` - print a registry summary
//! - `scan` - list host serial ports and which pass the USB filter
//! - `smoketest --port <path>` - probe one modem and run one telemetry battery (nothing stored)
//! - `sim <iccid>` / `sims` / `sms <iccid>` - registry reads and on-demand SMS retrieval,
//!   routed through a running `start` when its control endpoint answers
//!
//! See the library crate docs for module-level details: `gsmbridge::`.
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{debug, error, info};
use serde::Serialize;

use gsmbridge::config::Config;
use gsmbridge::fleet::discovery::probe;
use gsmbridge::fleet::control::{self, ControlClient, Reply, Request};
use gsmbridge::fleet::telemetry::run_battery;
use gsmbridge::fleet::Bridge;
use gsmbridge::modem::link::LinkProvider;
use gsmbridge::modem::AtChannel;
use gsmbridge::storage::SimFilter;

#[derive(Parser)]
#[command(name = "gsmbridge")]
#[command(about = "Bridge a fleet of USB GSM modems to a SIM/SMS registry")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all background loops
    Start,
    /// Write a default configuration file
    Init,
    /// Show registry statistics
    Status,
    /// List serial ports seen by the host
    Scan,
    /// Probe one modem and print its telemetry battery
    #[command(name = "smoketest")]
    SmokeTest {
        /// Device serial port
        #[arg(short, long)]
        port: String,
    },
    /// Show one SIM record
    Sim { iccid: String },
    /// List SIM records
    Sims {
        /// Only SIMs bound to this port
        #[arg(long)]
        com_port: Option<String>,
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Retrieve and store the SMS of one SIM
    Sms { iccid: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let config = Config::load(&cli.config).await?;
    init_logging(&Some(config.clone()), cli.verbose);
    let provider = link_provider(&config);

    match cli.command {
        Commands::Init => {}
        Commands::Start => {
            info!("Starting gsmbridge v{}", env!("CARGO_PKG_VERSION"));
            Bridge::open(config, provider)?.run().await?;
        }
        Commands::Status => {
            let bridge = Bridge::open(config, provider)?;
            let registry = &bridge.fleet().registry;
            let bound = SimFilter {
                bound_only: true,
                ..SimFilter::default()
            };
            print_json(&serde_json::json!({
                "sims": registry.count_sims(&SimFilter::default()).await?,
                "bound_sims": registry.count_sims(&bound).await?,
                "sms": registry.count_sms().await?,
                "data_dir": bridge.fleet().config.storage.data_dir,
            }))?;
        }
        Commands::Scan => {
            let ports = provider.enumerate()?;
            let rows: Vec<_> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "device_path": p.device_path,
                        "description": p.description,
                        "candidate": p.matches(&config.serial.usb_filter),
                    })
                })
                .collect();
            print_json(&rows)?;
        }
        Commands::SmokeTest { port } => {
            info!("Starting smoke test on {} @ {} baud", port, config.serial.baud_rate);
            let mut channel = match AtChannel::open(
                provider.as_ref(),
                &port,
                config.serial.baud_rate,
                &config.connect_policy(),
                config.command_timeout(),
            )
            .await
            {
                Ok(c) => c,
                Err(e) => {
                    error!("{}", e);
                    std::process::exit(2);
                }
            };
            let readiness = probe(&mut channel).await;
            let battery = if readiness.is_ready() {
                Some(run_battery(&mut channel, &config.commands.network_info).await)
            } else {
                None
            };
            channel.close();
            print_json(&serde_json::json!({
                "port": port,
                "readiness": readiness,
                "battery": battery,
            }))?;
            std::process::exit(if readiness.is_ready() { 0 } else { 1 });
        }
        Commands::Sim { iccid } => answer(config, provider, Request::Sim { iccid }).await?,
        Commands::Sims {
            com_port,
            skip,
            limit,
        } => answer(config, provider, Request::Sims { com_port, skip, limit }).await?,
        Commands::Sms { iccid } => answer(config, provider, Request::Sms { iccid }).await?,
    }

    Ok(())
}

/// Ask the running bridge when one is listening, so the request shares its registry
/// and port locks; otherwise open the registry here.
async fn answer(config: Config, provider: Arc<dyn LinkProvider>, request: Request) -> Result<()> {
    let reply = match connect_running(&config).await {
        Some(mut client) => client.call(&request).await?,
        None => control::handle(&Bridge::open(config, provider)?.gateway(), request).await,
    };
    match reply {
        Reply::Ok(value) => print_json(&value),
        Reply::Error(e) => exit_with(e),
    }
}

async fn connect_running(config: &Config) -> Option<ControlClient> {
    if !config.control.enabled {
        return None;
    }
    match ControlClient::connect(&config.control.listen).await {
        Ok(client) => {
            debug!("using running bridge at {}", config.control.listen);
            Some(client)
        }
        Err(e) => {
            debug!("no running bridge at {}: {}", config.control.listen, e);
            None
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_with(err: gsmbridge::fleet::gateway::GatewayError) -> ! {
    println!("{}", serde_json::json!({ "error": err }));
    std::process::exit(1);
}

#[cfg(feature = "serial")]
fn link_provider(config: &Config) -> Arc<dyn LinkProvider> {
    use gsmbridge::modem::system::SystemSerial;
    Arc::new(SystemSerial::new(std::time::Duration::from_millis(
        config.serial.read_poll_ms,
    )))
}

#[cfg(not(feature = "serial"))]
fn link_provider(_config: &Config) -> Arc<dyn LinkProvider> {
    log::warn!("built without the 'serial' feature; no hardware ports will be seen");
    Arc::new(gsmbridge::modem::mock::MockModem::new())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    match log_file {
        Some(f) => {
            let sink = std::sync::Mutex::new(f);
            // Foreground runs also echo to the console
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = sink.lock() {
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
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
