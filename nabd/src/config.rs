//! Daemon configuration
//!
//! YAML configuration with sane defaults: the file is created on first run
//! and reloaded in place when a `config-update` packet names the daemon or
//! the locale.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Default location of the daemon configuration.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nabd/config.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Daemon configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    pub media: MediaSettings,
    pub scheduler: SchedulerSettings,
    pub virt: VirtualSettings,
}

/// Daemon-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    pub bind_addr: String,
    pub port: u16,
    pub log_level: String,
}

/// Media library settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaSettings {
    pub root: String,
    pub locale: String,
}

/// Scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub rfid_write_timeout: f64,
}

/// Virtual backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualSettings {
    pub enabled: bool,
    /// Seed for wildcard resource choice; fixed seeds make runs repeatable.
    pub seed: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonSettings {
                bind_addr: "127.0.0.1".to_string(),
                port: nab_common::DEFAULT_PORT,
                log_level: "info".to_string(),
            },
            media: MediaSettings {
                root: "/var/lib/nabd/media".to_string(),
                locale: "en_US".to_string(),
            },
            scheduler: SchedulerSettings {
                rfid_write_timeout: crate::scheduler::RFID_WRITE_TIMEOUT_S,
            },
            virt: VirtualSettings { enabled: true, seed: 0 },
        }
    }
}

/// Configuration manager for the nabd daemon
pub struct ConfigManager {
    pub config_path: PathBuf,
    config: RwLock<DaemonConfig>,
}

impl ConfigManager {
    /// Load the configuration, creating the file with defaults when absent.
    pub async fn new(config_path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let config_path = config_path.into();
        let manager = Self {
            config_path,
            config: RwLock::new(DaemonConfig::default()),
        };
        manager.load_or_create().await?;
        Ok(manager)
    }

    /// In-memory defaults without touching the filesystem.
    pub fn for_tests(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            config: RwLock::new(DaemonConfig::default()),
        }
    }

    pub async fn get(&self) -> DaemonConfig {
        self.config.read().await.clone()
    }

    /// Re-read the file; keeps the previous configuration on error.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        info!("reloading configuration from {}", self.config_path.display());
        let content = fs::read_to_string(&self.config_path)
            .await
            .map_err(|source| ConfigError::Io {
                path: self.config_path.display().to_string(),
                source,
            })?;
        let parsed: DaemonConfig = serde_yaml::from_str(&content)?;
        *self.config.write().await = parsed;
        debug!("configuration reloaded");
        Ok(())
    }

    pub async fn save(&self) -> Result<(), ConfigError> {
        info!("saving configuration to {}", self.config_path.display());
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).await.map_err(|source| ConfigError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let content = serde_yaml::to_string(&*self.config.read().await)?;
        fs::write(&self.config_path, content)
            .await
            .map_err(|source| ConfigError::Io {
                path: self.config_path.display().to_string(),
                source,
            })?;
        Ok(())
    }

    async fn load_or_create(&self) -> Result<(), ConfigError> {
        if fs::metadata(&self.config_path).await.is_ok() {
            self.reload().await
        } else {
            warn!("configuration file not found, using defaults");
            self.save().await
        }
    }
}
