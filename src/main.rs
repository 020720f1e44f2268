//! Brainstim controller command line
//!
//! ```bash
//! # List stimulators in range
//! brainstim-controller scan
//!
//! # Configure channels 1 and 2, then start them
//! brainstim-controller send --device AA:BB:CC:DD:EE:FF --channels 1,2 configure --current 2.0
//! brainstim-controller send --device AA:BB:CC:DD:EE:FF --channels 1,2 enable
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use brainstim_controller_lib::commands::{self, StimRequest};
use brainstim_controller_lib::config::AppConfig;
use brainstim_controller_lib::core::Waveform;
use brainstim_controller_lib::logging::{OperatorLog, OperatorLogger};
use brainstim_controller_lib::state::AppState;
use clap::{Parser, Subcommand};
use log::{Level, info, warn};

/// Brainstim controller
#[derive(Parser, Debug)]
#[command(name = "brainstim-controller")]
#[command(author, version, about = "Multi-channel neurostimulator controller", long_about = None)]
struct Cli {
    /// Directory holding scan_config.json and stim_config.json
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan for stimulators and print what was found
    Scan {
        /// Scan window in seconds (overrides the config)
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Connect to a stimulator and send one command
    Send {
        /// Device address, platform id, or name for devices without an address
        #[arg(short, long)]
        device: String,

        /// Channels to address, e.g. 1,3 (defaults to the configured channels)
        #[arg(short, long, value_delimiter = ',')]
        channels: Option<Vec<u8>>,

        /// Seconds to wait for the device to become writable
        #[arg(long, default_value = "10")]
        timeout: u64,

        #[command(subcommand)]
        stim: StimCommand,
    },

    /// Write the default config files
    InitConfig,
}

#[derive(Subcommand, Debug)]
enum StimCommand {
    /// Set the stimulation frequency
    Frequency {
        /// Hz (defaults to the configured frequency)
        hz: Option<u32>,
    },
    /// Set phase, current and waveform
    Configure {
        #[arg(long)]
        phase: Option<u32>,
        /// mA
        #[arg(long)]
        current: Option<f32>,
        #[arg(long, default_value = "0")]
        frequency: u32,
        /// sine, triangle or sawtooth
        #[arg(long)]
        waveform: Option<Waveform>,
    },
    /// Set the ramp-up counter
    OnCounter { ticks: u32 },
    /// Set the ramp-down counter
    OffCounter { ticks: u32 },
    /// Start stimulation
    Enable,
    /// Stop stimulation
    Disable,
    /// Send the configured frequency, configuration and counters
    Apply,
}

fn init_logging(level: Level) -> OperatorLog {
    match OperatorLogger::init(level) {
        Ok(log) => log,
        Err(_) => {
            // Only fall back to env_logger when the operator logger cannot be installed
            let _ = env_logger::builder()
                .filter_level(level.to_level_filter())
                .try_init();
            OperatorLog::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = Level::from_str(&cli.log_level).unwrap_or(Level::Info);
    let operator_log = init_logging(level);
    info!("Brainstim controller v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(&cli.config_dir)
        .await
        .with_context(|| format!("Failed to load config from {:?}", cli.config_dir))?;

    match cli.command {
        Commands::InitConfig => {
            config.save(&cli.config_dir).await?;
            println!("Config written to {}", cli.config_dir.display());
        }
        Commands::Scan { duration } => {
            if let Some(secs) = duration {
                config.scan.duration_secs = secs;
            }
            let app_state = AppState::new(config, operator_log).await?;
            let devices = commands::scan_devices(&app_state).await.map_err(|e| anyhow!(e))?;

            if devices.is_empty() {
                println!("No devices found.");
            }
            for device in devices {
                println!(
                    "{:<20} {:<24} rssi={:<6} {}",
                    device.address.as_deref().unwrap_or("-"),
                    device.display_name,
                    device.rssi.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string()),
                    if device.identity_verified { "" } else { "(unverified)" },
                );
            }
        }
        Commands::Send {
            device,
            channels,
            timeout,
            stim,
        } => {
            let channels = channels.unwrap_or_else(|| config.stim.channels.clone());
            let app_state = AppState::new(config, operator_log).await?;

            commands::discover_device(&app_state, &device)
                .await
                .map_err(|e| anyhow!(e))?;
            commands::connect_to_device(&app_state, &device, Duration::from_secs(timeout))
                .await
                .map_err(|e| anyhow!(e))?;

            let result = send(&app_state, channels, stim).await;

            if let Err(e) = commands::disconnect(&app_state).await {
                warn!("Disconnect failed: {}", e);
            }
            for frame in result? {
                println!("{}", frame);
            }
        }
    }

    Ok(())
}

async fn send(
    app_state: &AppState,
    channels: Vec<u8>,
    stim: StimCommand,
) -> anyhow::Result<Vec<String>> {
    let defaults = &app_state.config.stim;
    let request = match stim {
        StimCommand::Apply => {
            return commands::apply_defaults(app_state).await.map_err(|e| anyhow!(e));
        }
        StimCommand::Frequency { hz } => StimRequest::SetFrequency {
            channels,
            frequency_hz: hz.unwrap_or(defaults.frequency_hz),
        },
        StimCommand::Configure {
            phase,
            current,
            frequency,
            waveform,
        } => StimRequest::Configure {
            channels,
            phase: phase.unwrap_or(defaults.phase),
            current_ma: current.unwrap_or(defaults.current_ma),
            frequency_hz: frequency,
            waveform: waveform.unwrap_or(defaults.waveform),
        },
        StimCommand::OnCounter { ticks } => StimRequest::SetOnCounter { channels, ticks },
        StimCommand::OffCounter { ticks } => StimRequest::SetOffCounter { channels, ticks },
        StimCommand::Enable => StimRequest::Enable { channels },
        StimCommand::Disable => StimRequest::Disable { channels },
    };

    let frame = commands::send_command(app_state, request)
        .await
        .map_err(|e| anyhow!(e))?;
    Ok(vec![frame])
}
