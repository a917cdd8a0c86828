//! CLI command builders for tests
//!
//! Provides pre-configured command builders with clean environments
//! to prevent log pollution and ensure consistent test execution.

use assert_cmd::Command;

/// Get a Command for the `refsync` binary with clean environment
///
/// This command is pre-configured with:
/// - `RUST_LOG=error` to suppress INFO/DEBUG logs in tests
/// - no `REFSYNC_API_KEY`, so the user's key never reaches a test
///
/// # Example
///
/// ```rust,no_run
/// use refsync_test_helpers::cli::refsync_command;
///
/// refsync_command().arg("--version").assert().success();
/// ```
#[allow(deprecated)]
pub fn refsync_command() -> Command {
    command_for("refsync")
}

/// Get a Command for a specific binary with clean environment
#[allow(deprecated)]
pub fn command_for(bin_name: &str) -> Command {
    let mut cmd = Command::cargo_bin(bin_name)
        .unwrap_or_else(|_| panic!("Failed to find {} binary", bin_name));
    cmd.env("RUST_LOG", "error");
    cmd.env_remove(refsync_config::API_KEY_ENV);
    cmd
}
