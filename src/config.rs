//! usbwatch configuration file
//!
//! ```toml
//! [monitor]
//! poll_interval_ms = 100
//! thread_name = "usb-hotplug"
//!
//! [output]
//! json = false
//! show_initial = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use usbwatch_core::MonitorConfig;

/// Output preferences; command-line flags take precedence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Print JSON instead of text
    pub json: bool,
    /// Print the devices attached at startup before watching
    pub show_initial: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            json: false,
            show_initial: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub monitor: MonitorConfig,
    pub output: OutputConfig,
}

impl AppConfig {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("usbwatch")
            .join("config.toml")
    }

    /// Load config from a file, or return default if not found
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
