//! Client configuration management.
//!
//! This module handles loading and saving the client configuration, which
//! includes the API base URL, timeouts, the credential backend and the last
//! used login email.
//!
//! Configuration is stored at `~/.config/maidease/config.json`. The
//! `MAIDEASE_API_URL` environment variable overrides the base URL.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::auth::refresh::{DEFAULT_REFRESH_PATH, DEFAULT_REFRESH_TIMEOUT};
use crate::auth::{
    CredentialStore, FileCredentialStore, KeyringCredentialStore, MemoryCredentialStore,
    RefreshSettings,
};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "maidease";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding `base_url`
pub const API_URL_ENV: &str = "MAIDEASE_API_URL";

/// Default API location for a local backend
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/v1";

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialBackend {
    #[default]
    File,
    Keyring,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub refresh_path: String,
    pub request_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    pub credential_backend: CredentialBackend,
    pub keyring_account: String,
    pub last_email: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT.as_secs(),
            credential_backend: CredentialBackend::default(),
            keyring_account: "default".to_string(),
            last_email: None,
        }
    }
}

impl ClientConfig {
    /// Load the config file (defaults if missing) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };
        config.apply_api_url_override(std::env::var(API_URL_ENV).ok());
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

    pub fn apply_api_url_override(&mut self, url: Option<String>) {
        if let Some(url) = url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty()) {
            self.base_url = url;
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding `session.json` for the file credential backend.
    pub fn session_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            path: self.refresh_path.clone(),
            timeout: Duration::from_secs(self.refresh_timeout_secs),
        }
    }

    /// Open the configured credential backend.
    pub fn open_credential_store(&self) -> Result<Arc<dyn CredentialStore>> {
        Ok(match self.credential_backend {
            CredentialBackend::File => Arc::new(FileCredentialStore::open(self.session_dir()?)?),
            CredentialBackend::Keyring => {
                Arc::new(KeyringCredentialStore::open(&self.keyring_account)?)
            }
            CredentialBackend::Memory => Arc::new(MemoryCredentialStore::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.credential_backend, CredentialBackend::File);
        assert_eq!(config.refresh_settings().path, "/auth/refresh");
        assert_eq!(config.refresh_settings().timeout, Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = serde_json::json!({
            "base_url": "https://api.maidease.app/api/v1",
            "credential_backend": "keyring"
        });
        let config: ClientConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.base_url, "https://api.maidease.app/api/v1");
        assert_eq!(config.credential_backend, CredentialBackend::Keyring);
        assert_eq!(config.refresh_timeout_secs, 5);
        assert_eq!(config.keyring_account, "default");
    }

    #[test]
    fn test_api_url_override() {
        let mut config = ClientConfig::default();
        config.apply_api_url_override(Some("  ".to_string()));
        assert_eq!(config.base_url, DEFAULT_BASE_URL);

        config.apply_api_url_override(Some("https://staging.maidease.app/api/v1".to_string()));
        assert_eq!(config.base_url, "https://staging.maidease.app/api/v1");

        config.apply_api_url_override(None);
        assert_eq!(config.base_url, "https://staging.maidease.app/api/v1");
    }

    #[test]
    fn test_memory_backend_opens_empty() {
        let config = ClientConfig {
            credential_backend: CredentialBackend::Memory,
            ..ClientConfig::default()
        };
        let store = config.open_credential_store().unwrap();
        assert!(store.get().is_none());
        assert_eq!(store.name(), "memory");
    }
}
