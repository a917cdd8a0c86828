//! Common types and errors for RefSync
//!
//! This crate provides the pieces shared by every RefSync component:
//! configuration/IO errors, logging setup and log redaction.

pub mod sanitizer;
pub mod telemetry;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised outside the sync path (configuration, workspace files)
#[derive(Error, Debug)]
pub enum RefError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Invalid input: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// The three kinds of entity tracked by the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Item,
    Collection,
    Attachment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Item => "item",
            EntityKind::Collection => "collection",
            EntityKind::Attachment => "attachment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "item" => Some(EntityKind::Item),
            "collection" => Some(EntityKind::Collection),
            "attachment" => Some(EntityKind::Attachment),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, RefError>;

/// Exit code constants
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_SYNC_FAILURES: i32 = 3;
pub const EXIT_CONFIG_ERROR: i32 = 101;
pub const EXIT_TERMINATED: i32 = 130;
