//! Updater Configuration Module
//! Handles loading and saving updater.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE: &str = "updater.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    #[serde(default = "default_artifact_name")]
    pub artifact_name: String,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub system_downloader: SystemDownloaderConfig,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_files")]
    pub files: Vec<String>,
    /// Per-request timeout of the in-process client
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Upper bound for a whole check or download
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemDownloaderConfig {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_program_args")]
    pub args: Vec<String>,
    #[serde(default = "default_operation_timeout")]
    pub timeout_secs: u64,
}

fn default_artifact_name() -> String {
    "local_blocklist".to_string()
}

fn default_event_capacity() -> usize {
    16
}

fn default_base_url() -> String {
    "https://download.rethinkdns.com".to_string()
}

fn default_files() -> Vec<String> {
    ["filetag.json", "basicconfig.json", "rd.txt", "td.txt"]
        .iter()
        .map(|f| f.to_string())
        .collect()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_operation_timeout() -> u64 {
    300
}

fn default_program() -> String {
    "curl".to_string()
}

fn default_program_args() -> Vec<String> {
    vec!["-fsSL".to_string()]
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            files: default_files(),
            request_timeout_secs: default_request_timeout(),
            operation_timeout_secs: default_operation_timeout(),
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl Default for SystemDownloaderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_program_args(),
            timeout_secs: default_operation_timeout(),
        }
    }
}

impl SystemDownloaderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            artifact_name: default_artifact_name(),
            remote: RemoteConfig::default(),
            system_downloader: SystemDownloaderConfig::default(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl UpdaterConfig {
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = data_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: UpdaterConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load the config, falling back to defaults when the file is missing
    pub fn load_or_default(data_dir: &Path) -> Result<Self, ConfigError> {
        match Self::load(data_dir) {
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(data_dir)?;
        let config_path = data_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }
}
