//! Application configuration management.
//!
//! This module handles loading and saving the configuration, which includes
//! the API base URL, the session timing knobs and the credential storage
//! backend.
//!
//! Configuration is stored at `~/.config/rentkey/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::auth::{FileStorage, KeyringStorage, MemoryStorage, TokenStorage};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "rentkey";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";

/// Proactive renewal lead time before expiry.
const DEFAULT_REFRESH_MARGIN_SECS: u64 = 300;

/// Remaining lifetime below which the UI warns that the session is ending.
const DEFAULT_EXPIRING_SOON_SECS: u64 = 300;

/// Background liveness check interval.
const DEFAULT_REVALIDATE_INTERVAL_SECS: u64 = 600;

/// HTTP request timeout, also the upper bound on a renewal call.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Where the credential is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub refresh_margin_secs: u64,
    pub expiring_soon_secs: u64,
    pub revalidate_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub storage: StorageKind,
    pub log_to_file: bool,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
            expiring_soon_secs: DEFAULT_EXPIRING_SOON_SECS,
            revalidate_interval_secs: DEFAULT_REVALIDATE_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            storage: StorageKind::default(),
            log_to_file: false,
            last_email: None,
        }
    }
}

/// Durations derived from the config, handed to the session machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub refresh_margin: Duration,
    pub expiring_soon: Duration,
    pub request_timeout: Duration,
    pub revalidate_interval: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Config::default().timings()
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn timings(&self) -> SessionTimings {
        SessionTimings {
            refresh_margin: Duration::from_secs(self.refresh_margin_secs),
            expiring_soon: Duration::from_secs(self.expiring_soon_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
            revalidate_interval: Duration::from_secs(self.revalidate_interval_secs.max(1)),
        }
    }

    /// Open the configured credential storage backend
    pub fn open_storage(&self) -> Result<Box<dyn TokenStorage>> {
        Ok(match self.storage {
            StorageKind::File => Box::new(FileStorage::new(self.cache_dir()?)),
            StorageKind::Keyring => Box::new(KeyringStorage),
            StorageKind::Memory => Box::new(MemoryStorage::new()),
        })
    }
}
