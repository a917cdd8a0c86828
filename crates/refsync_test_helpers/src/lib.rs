//! Shared test utilities for RefSync test suites
//!
//! This crate provides common testing utilities to eliminate code duplication
//! across test suites and ensure consistent test environments.
//!
//! # Modules
//!
//! - [`workspace`]: Temporary workspaces and stores
//! - [`cli`]: Command builders with pre-configured environments
//! - [`logging`]: Quiet test logging and per-thread log capture
//! - [`fixtures`]: Builders for server response bodies
//! - [`transport`]: A scripted in-memory transport
//! - [`assertions`]: Domain-specific assertion helpers
//!
//! # Example
//!
//! ```rust,no_run
//! use refsync_test_helpers::prelude::*;
//!
//! fn my_test() {
//!     // Create a workspace with .refsync/config.toml
//!     let workspace = init_workspace();
//!
//!     // Use pre-configured command with RUST_LOG=error
//!     refsync_command()
//!         .current_dir(workspace.path())
//!         .arg("status")
//!         .assert()
//!         .success();
//! }
//! ```

pub mod assertions;
pub mod cli;
pub mod fixtures;
pub mod logging;
pub mod transport;
pub mod workspace;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::assertions::*;
    pub use crate::cli::{command_for, refsync_command};
    pub use crate::fixtures::{keys_body, EntryBuilder, FeedBuilder, API_BASE};
    pub use crate::logging::{capture_logs, init_test_logging, suppress_logs, LogCapture};
    pub use crate::transport::ScriptedTransport;
    pub use crate::workspace::{init_workspace, shared, temp_dir, temp_store};
}
