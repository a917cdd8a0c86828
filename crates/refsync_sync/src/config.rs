//! Options for the sync engine

use refsync_common::RefError;
use refsync_config::{Config, StopPolicy};

/// Reconciliation and ledger settings, taken from `[sync]`
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    /// Entries requested per listing page
    pub page_size: u32,

    /// When a page ends the traversal of older pages
    pub stop_policy: StopPolicy,

    /// Failed requests are retried on later runs until they reach this many attempts
    pub max_attempts: u32,

    /// Known-key fraction below which a keys listing triggers a full refetch
    pub keys_refetch_cutoff: f64,

    /// Credential profile recorded on new ledger entries
    pub credential: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SyncOptions {
    fn from(config: &Config) -> Self {
        Self {
            page_size: config.sync.page_size,
            stop_policy: config.sync.stop_policy,
            max_attempts: config.sync.max_attempts,
            keys_refetch_cutoff: config.sync.keys_refetch_cutoff,
            credential: config.sync.credential.clone(),
        }
    }
}

impl SyncOptions {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), RefError> {
        if self.page_size == 0 {
            return Err(RefError::ConfigError("page_size must be positive".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(RefError::ConfigError("max_attempts must be positive".to_string()));
        }
        if !(self.keys_refetch_cutoff > 0.0 && self.keys_refetch_cutoff <= 1.0) {
            return Err(RefError::ConfigError(
                "keys_refetch_cutoff must be in (0, 1]".to_string(),
            ));
        }
        if self.credential.is_empty() {
            return Err(RefError::ConfigError("credential cannot be empty".to_string()));
        }
        Ok(())
    }
}
