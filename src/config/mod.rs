pub mod scan_config;
pub mod stim_config;

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::scan_config::ScanConfig;
use crate::config::stim_config::StimConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub scan: ScanConfig,
    pub stim: StimConfig,
}

impl AppConfig {
    pub async fn load(config_dir: &Path) -> Result<Self> {
        Ok(AppConfig {
            scan: ScanConfig::load_config(config_dir).await?,
            stim: StimConfig::load_config(config_dir).await?,
        })
    }

    pub async fn save(&self, config_dir: &Path) -> Result<()> {
        self.scan.save_config(config_dir).await?;
        self.stim.save_config(config_dir).await
    }
}
