//! Workspace and store setup for tests

use assert_fs::TempDir;
use refsync_config::WORKSPACE_DIR;
use refsync_store::Store;
use std::fs;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Config written by [`init_workspace`]; nothing listens on the base URL
pub const TEST_CONFIG: &str = r#"[server]
base_url = "http://127.0.0.1:9"
library_prefix = "users/1"
timeout_secs = 2

[sync]
page_size = 25
"#;

/// Create a temporary directory for testing
///
/// The directory will be automatically cleaned up when the `TempDir` is dropped.
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Initialize a RefSync workspace in a temp directory
///
/// Creates `.refsync/config.toml` with [`TEST_CONFIG`].
///
/// # Example
///
/// ```rust
/// use refsync_test_helpers::workspace::init_workspace;
///
/// let workspace = init_workspace();
/// assert!(workspace.path().join(".refsync/config.toml").exists());
/// ```
pub fn init_workspace() -> TempDir {
    let temp = temp_dir();
    let dir = temp.path().join(WORKSPACE_DIR);
    fs::create_dir_all(&dir).expect("Failed to create .refsync directory");
    fs::write(dir.join("config.toml"), TEST_CONFIG).expect("Failed to write config.toml");
    temp
}

/// An on-disk store in a fresh temp directory
///
/// Keep the `TempDir` alive for as long as the store is used.
pub fn temp_store() -> (TempDir, Store) {
    let temp = temp_dir();
    let store = Store::open(&temp.path().join("cache.db")).expect("Failed to open store");
    (temp, store)
}

/// Wrap a store the way the sync engine shares it
pub fn shared(store: Store) -> Arc<Mutex<Store>> {
    Arc::new(Mutex::new(store))
}
