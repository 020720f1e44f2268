use crate::core::bluetooth::commands::{DEFAULT_CURRENT_LIMIT_MA, StimParams};
use crate::core::packet::{ChannelMask, FrameError, Waveform};
use crate::utils::ensure_directory_exists;
use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

const CONFIG_FILE_NAME: &str = "stim_config.json";

/// Operator defaults used when a command omits a parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StimConfig {
    /// Output channels (1-4)
    pub channels: Vec<u8>,
    /// Stimulation current in mA
    pub current_ma: f32,
    /// Stimulation frequency in Hz
    pub frequency_hz: u32,
    pub waveform: Waveform,
    pub phase: u32,
    /// Ramp-up ticks sent by `apply`; skipped when unset
    pub on_counter: Option<u32>,
    /// Ramp-down ticks sent by `apply`; skipped when unset
    pub off_counter: Option<u32>,
    /// Requests above this current are refused
    pub current_limit_ma: f32,
}

impl Default for StimConfig {
    fn default() -> Self {
        StimConfig {
            channels: vec![1],
            current_ma: 2.5,
            frequency_hz: 1000,
            waveform: Waveform::Sine,
            phase: 0,
            on_counter: None,
            off_counter: None,
            current_limit_ma: DEFAULT_CURRENT_LIMIT_MA,
        }
    }
}

impl StimConfig {
    pub fn channel_mask(&self) -> Result<ChannelMask, FrameError> {
        ChannelMask::from_channels(&self.channels)
    }

    /// CONFIGURE parameters built from the defaults. Frequency is sent separately.
    pub fn params(&self) -> StimParams {
        StimParams {
            phase: self.phase,
            current_ma: self.current_ma,
            frequency_hz: 0,
            waveform: self.waveform,
        }
    }

    /// Loads the config from `config_dir`, falling back to defaults when the file is missing.
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        if !file_path.exists() {
            warn!("Stimulation config file not found at {:?}, using default.", file_path_str);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Stimulation config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the current config into `config_dir`.
    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        ensure_directory_exists(config_dir).await?;

        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize stimulation config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;
        info!("Stimulation config saved to {:?}", file_path_str);
        Ok(())
    }
}
