//! robolink - talk to robot vacuums on the local network or through the cloud relay

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use robolink_client::CleanMode;
use robolink_core::RequestMessage;
use robolink_service::{CleanPlan, CleanSelection, DeviceNotification, DeviceService, ServiceConfig};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// robolink - robot vacuum device link
#[derive(Parser)]
#[command(name = "robolink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "ROBOLINK_CONFIG", default_value = "robolink.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect every device, poll status and print notifications until Ctrl+C
    Run,

    /// List configured devices and how they are reached
    Devices,

    /// Query a device's status
    Status { duid: String },

    /// Start cleaning
    Clean {
        duid: String,

        /// Room segments to clean (comma separated); defaults to the configured selection
        #[arg(short, long, value_delimiter = ',')]
        rooms: Vec<u32>,

        /// Run a routine instead
        #[arg(long)]
        routine: Vec<u64>,
    },

    /// Pause cleaning
    Pause { duid: String },

    /// Resume cleaning
    Resume { duid: String },

    /// Stop cleaning
    Stop { duid: String },

    /// Send the device back to its dock
    Dock { duid: String },

    /// Make the device announce itself
    Locate { duid: String },

    /// Show network information
    Network { duid: String },

    /// Show the room segment mapping
    Rooms { duid: String },

    /// Show or change suction / water / mop settings
    Mode {
        duid: String,

        #[arg(long)]
        suction: Option<i64>,

        #[arg(long)]
        water: Option<i64>,

        #[arg(long)]
        mop: Option<i64>,
    },

    /// Send an arbitrary request
    Custom {
        duid: String,

        /// Method name
        #[arg(short, long)]
        method: String,

        /// Parameters (JSON)
        #[arg(short, long)]
        params: Option<String>,

        /// Encrypt with the session nonce
        #[arg(long)]
        secure: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.json_logs)?;

    let config = ServiceConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    let service = DeviceService::new(config);
    service.start().await.context("Failed to start device service")?;

    let result = run_command(&service, cli.command).await;
    service.shutdown().await;
    result
}

async fn run_command(service: &DeviceService, command: Commands) -> Result<()> {
    match command {
        Commands::Run => {
            let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received shutdown signal");
                    let _ = shutdown_tx.send(()).await;
                }
            });

            println!(
                "{} Watching {} device(s), Ctrl+C to stop",
                "ROBOLINK".cyan().bold(),
                service.config().devices.len()
            );
            for duid in service.unreachable_devices() {
                println!("  {} {} unreachable", "!".yellow(), duid);
            }

            watch_notifications(service.subscribe(), &mut shutdown_rx).await;
        }

        Commands::Devices => {
            for device in service.devices() {
                let transport = device
                    .transport
                    .map(|kind| kind.to_string().green())
                    .unwrap_or_else(|| "unreachable".red());
                let mode = if device.cloud_only { " (cloud only)" } else { "" };
                println!(
                    "{} {} [{}]{}",
                    device.duid.yellow(),
                    device.name,
                    transport,
                    mode.dimmed()
                );
            }
        }

        Commands::Status { duid } => {
            let status = service.status(&duid).await?;
            print_json(&duid, "status", status)?;
        }

        Commands::Clean {
            duid,
            rooms,
            routine,
        } => {
            let selection = (!rooms.is_empty() || !routine.is_empty()).then(|| CleanSelection {
                rooms,
                routines: routine,
            });
            let plan = service
                .start_clean(&duid, selection)
                .await?
                .ok_or_else(|| unknown(&duid))?;

            match plan {
                CleanPlan::Global => done(&duid, "Cleaning everywhere"),
                CleanPlan::Rooms(rooms) => done(&duid, &format!("Cleaning rooms {:?}", rooms)),
                CleanPlan::Scene(id) => done(&duid, &format!("Routine {} started", id)),
                CleanPlan::Conflict(reason) => {
                    println!("{} {}", "ROBOLINK".yellow().bold(), reason);
                }
            }
        }

        Commands::Pause { duid } => {
            service.pause_clean(&duid).await?.ok_or_else(|| unknown(&duid))?;
            done(&duid, "Paused");
        }

        Commands::Resume { duid } => {
            service.resume_clean(&duid).await?.ok_or_else(|| unknown(&duid))?;
            done(&duid, "Resumed");
        }

        Commands::Stop { duid } => {
            service.stop_clean(&duid).await?.ok_or_else(|| unknown(&duid))?;
            done(&duid, "Stopped");
        }

        Commands::Dock { duid } => {
            service.go_home(&duid).await?.ok_or_else(|| unknown(&duid))?;
            done(&duid, "Returning to dock");
        }

        Commands::Locate { duid } => {
            service.find_me(&duid).await?.ok_or_else(|| unknown(&duid))?;
            done(&duid, "Locating");
        }

        Commands::Network { duid } => {
            let info = service.network_info(&duid).await?;
            print_json(&duid, "network info", info)?;
        }

        Commands::Rooms { duid } => {
            let rooms = service.room_mapping(&duid).await?;
            print_json(&duid, "room mapping", rooms)?;
        }

        Commands::Mode {
            duid,
            suction,
            water,
            mop,
        } => {
            let mode = CleanMode {
                suction_power: suction,
                water_flow: water,
                mop_mode: mop,
            };
            if mode == CleanMode::default() {
                let current = service.clean_mode(&duid).await?;
                print_json(&duid, "clean mode", current)?;
            } else {
                service
                    .set_clean_mode(&duid, mode)
                    .await?
                    .ok_or_else(|| unknown(&duid))?;
                done(&duid, "Clean mode updated");
            }
        }

        Commands::Custom {
            duid,
            method,
            params,
            secure,
        } => {
            let mut request = RequestMessage::new(&method);
            if let Some(params) = params {
                let params = serde_json::from_str(&params).context("Invalid params JSON")?;
                request = request.with_params(params);
            }
            if secure {
                request = request.secure();
            }

            let result = service.custom(&duid, request).await?;
            print_json(&duid, &method, result)?;
        }
    }

    Ok(())
}

async fn watch_notifications(
    mut notifications: broadcast::Receiver<DeviceNotification>,
    shutdown_rx: &mut mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Ok(DeviceNotification::Battery { duid, level }) => {
                    println!("{} battery {}%", duid.yellow(), level);
                }
                Ok(DeviceNotification::Error { duid, code }) => {
                    println!("{} error {}", duid.yellow(), code.to_string().red());
                }
                Ok(DeviceNotification::Status { duid, status }) => {
                    println!(
                        "{} state {} cleaning {}",
                        duid.yellow(),
                        status.state.map_or_else(|| "?".into(), |s| s.to_string()),
                        status.is_cleaning()
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    info!(skipped, "Notification output lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown_rx.recv() => break,
        }
    }
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to parse log level")?;

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).compact())
            .init();
    }

    Ok(())
}

fn unknown(duid: &str) -> anyhow::Error {
    anyhow!("Unknown device {}", duid)
}

fn done(duid: &str, what: &str) {
    println!("{} {} {}", "ROBOLINK".cyan().bold(), duid.yellow(), what.green());
}

fn print_json<T: Serialize>(duid: &str, what: &str, value: Option<T>) -> Result<()> {
    let Some(value) = value else {
        bail!("{}: no {} (device did not answer)", duid, what);
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
