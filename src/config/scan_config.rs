use crate::core::bluetooth::constants::DEFAULT_SCAN_DURATION_SECS;
use crate::utils::ensure_directory_exists;
use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use uuid::Uuid;

const CONFIG_FILE_NAME: &str = "scan_config.json";

/// Discovery and link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// How long a scan window stays open before it stops itself, in seconds
    pub duration_secs: u64,
    /// Ignore advertisements weaker than this (dBm). `None` shows everything.
    pub min_rssi: Option<i16>,
    /// Only list devices whose name contains this text (case-insensitive)
    pub name_filter: Option<String>,
    /// Characteristic to write commands to. `None` picks the first writable one.
    pub write_characteristic: Option<Uuid>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            duration_secs: DEFAULT_SCAN_DURATION_SECS,
            min_rssi: None,
            name_filter: None,
            write_characteristic: None,
        }
    }
}

impl ScanConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Loads the config from `config_dir`, falling back to defaults when the file is missing.
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        if !file_path.exists() {
            warn!("Scan config file not found at {:?}, using default.", file_path_str);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Scan config loaded from {:?}", file_path_str);
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
                error!("Failed to serialize scan config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;
        info!("Scan config saved to {:?}", file_path_str);
        Ok(())
    }
}
