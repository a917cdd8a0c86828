//! Configuration management for RefSync
//!
//! This crate handles loading and validating `.refsync/config.toml`

use refsync_common::{RefError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory holding the config file and the local cache
pub const WORKSPACE_DIR: &str = ".refsync";

/// Environment variable that overrides `[server] api_key`
pub const API_KEY_ENV: &str = "REFSYNC_API_KEY";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Workspace root (set programmatically, not in TOML)
    #[serde(skip)]
    pub root: PathBuf,

    /// Remote API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Reconciliation and ledger settings
    #[serde(default)]
    pub sync: SyncSettings,

    /// Local cache settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Server configuration ([server])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Library path segment, e.g. `users/5770` or `groups/12`
    #[serde(default)]
    pub library_prefix: String,

    /// Never written back by `refsync init`; prefer the environment variable
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    #[serde(default = "default_api_version")]
    pub api_version: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.zotero.org".to_string()
}
fn default_api_version() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            library_prefix: String::new(),
            api_key: None,
            api_version: default_api_version(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// When a listing page stops the traversal of older pages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
    /// Stop as soon as one entry on the page is already current locally
    #[default]
    FirstUnchanged,
    /// Stop only when every entry on the page is already current locally
    WholePage,
}

/// Sync configuration ([sync])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    #[serde(default)]
    pub stop_policy: StopPolicy,

    /// Failed ledger entries are retried until they reach this many attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Below this fraction of locally known keys a keys listing is
    /// answered with a full refetch instead of per-key fetches
    #[serde(default = "default_keys_refetch_cutoff")]
    pub keys_refetch_cutoff: f64,

    /// Credential profile recorded on ledger entries
    #[serde(default = "default_credential")]
    pub credential: String,
}

fn default_page_size() -> u32 {
    50
}
fn default_max_attempts() -> u32 {
    5
}
fn default_keys_refetch_cutoff() -> f64 {
    0.7
}
fn default_credential() -> String {
    "default".to_string()
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            stop_policy: StopPolicy::default(),
            max_attempts: default_max_attempts(),
            keys_refetch_cutoff: default_keys_refetch_cutoff(),
            credential: default_credential(),
        }
    }
}

/// Storage configuration ([storage])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Relative paths resolve against the workspace root
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".refsync/cache.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Config {
    /// Load configuration from workspace root
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let config_path = workspace_root.join(WORKSPACE_DIR).join("config.toml");

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| RefError::ConfigError(format!("Failed to read config: {}", e)))?;
            Self::from_toml_str(&content)?
        } else {
            tracing::debug!("No config at {:?}, using defaults", config_path);
            Self::default()
        };

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                config.server.api_key = Some(key);
            }
        }

        config.root = workspace_root.to_path_buf();
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| RefError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Render the config as TOML (the API key is never written)
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RefError::ConfigError(format!("Failed to render config: {}", e)))
    }

    /// Absolute path of the SQLite cache
    pub fn db_path(&self) -> PathBuf {
        if self.storage.db_path.is_absolute() {
            self.storage.db_path.clone()
        } else {
            self.root.join(&self.storage.db_path)
        }
    }

    /// Validate settings needed to talk to the server
    pub fn validate(&self) -> Result<()> {
        if self.server.library_prefix.trim_matches('/').is_empty() {
            return Err(RefError::ConfigError(
                "server.library_prefix cannot be empty".to_string(),
            ));
        }
        if !self.server.base_url.starts_with("http://")
            && !self.server.base_url.starts_with("https://")
        {
            return Err(RefError::ConfigError(
                "server.base_url must start with http:// or https://".to_string(),
            ));
        }
        if self.sync.page_size == 0 {
            return Err(RefError::ConfigError(
                "sync.page_size must be positive".to_string(),
            ));
        }
        let cutoff = self.sync.keys_refetch_cutoff;
        if !(cutoff > 0.0 && cutoff <= 1.0) {
            return Err(RefError::ConfigError(format!(
                "sync.keys_refetch_cutoff must be in (0, 1], got {}",
                cutoff
            )));
        }
        Ok(())
    }
}
