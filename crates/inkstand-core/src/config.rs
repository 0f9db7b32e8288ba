//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the
//! CMS base URL, where credentials are kept, and the refresh timing.
//!
//! Configuration is stored at `~/.config/inkstand/config.json`. The
//! `INKSTAND_API_URL` and `INKSTAND_STORAGE` environment variables override
//! the file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::client::REQUEST_TIMEOUT_SECS;
use crate::auth::session::{DEFAULT_LOGIN_PATH, DEFAULT_MIN_REFRESH_DELAY};
use crate::auth::{
    CredentialStore, FileStorage, KeyringStorage, MemoryStorage, SessionConfig,
    DEFAULT_EXPIRY_SKEW,
};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "inkstand";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";

pub const ENV_API_URL: &str = "INKSTAND_API_URL";
pub const ENV_STORAGE: &str = "INKSTAND_STORAGE";

/// Where the credential set is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
    Memory,
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "keyring" => Ok(StorageKind::Keyring),
            "memory" => Ok(StorageKind::Memory),
            other => Err(anyhow::anyhow!(
                "Unknown storage kind '{}' (expected file, keyring or memory)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub storage: StorageKind,
    pub refresh_skew_secs: u64,
    pub min_refresh_delay_secs: u64,
    pub request_timeout_secs: u64,
    pub login_path: String,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            storage: StorageKind::default(),
            refresh_skew_secs: DEFAULT_EXPIRY_SKEW.as_secs(),
            min_refresh_delay_secs: DEFAULT_MIN_REFRESH_DELAY.as_secs(),
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            last_email: None,
        }
    }
}

impl Config {
    /// Load the config file (defaults if absent) and apply env overrides
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
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

    /// Override fields from environment variables, looked up through `var`
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var(ENV_API_URL).filter(|u| !u.trim().is_empty()) {
            self.api_base_url = url.trim().to_string();
        }
        if let Some(kind) = var(ENV_STORAGE) {
            self.storage = kind
                .parse()
                .with_context(|| format!("Invalid {}", ENV_STORAGE))?;
        }
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

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            refresh_skew: Duration::from_secs(self.refresh_skew_secs),
            min_refresh_delay: Duration::from_secs(self.min_refresh_delay_secs),
            login_path: self.login_path.clone(),
        }
    }

    /// Open the credential store on the configured backend
    pub fn open_credential_store(&self) -> Result<CredentialStore> {
        let store = match self.storage {
            StorageKind::File => CredentialStore::open(FileStorage::new(self.cache_dir()?)),
            StorageKind::Keyring => CredentialStore::open(KeyringStorage::new()),
            StorageKind::Memory => CredentialStore::open(MemoryStorage::new()),
        };
        store.with_context(|| format!("Failed to open {:?} credential storage", self.storage))
    }
}
