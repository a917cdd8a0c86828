//! CLI integration tests

use assert_fs::prelude::*;
use predicates::prelude::*;
use refsync_store::{NewRequest, Store};
use refsync_test_helpers::prelude::*;
use serde_json::json;

fn open_cache(workspace: &assert_fs::TempDir) -> Store {
    Store::open(&workspace.path().join(".refsync/cache.db")).unwrap()
}

#[test]
fn test_refsync_help() {
    refsync_command()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("RefSync"));
}

#[test]
fn test_refsync_version() {
    refsync_command()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_refsync_init() {
    let temp = temp_dir();

    refsync_command()
        .current_dir(temp.path())
        .args(["init", "--library", "users/5770"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Workspace initialized"));

    temp.child(".refsync/config.toml")
        .assert(predicate::str::contains("library_prefix = \"users/5770\""));
    temp.child(".gitignore")
        .assert(predicate::str::contains(".refsync/cache.db"));
}

#[test]
fn test_refsync_init_already_initialized() {
    let workspace = init_workspace();

    refsync_command()
        .current_dir(workspace.path())
        .arg("init")
        .assert()
        .success()
        .stderr(predicate::str::contains("already exists"));

    // Existing config is left alone
    workspace
        .child(".refsync/config.toml")
        .assert(predicate::str::contains("library_prefix = \"users/1\""));
}

#[test]
fn test_status_outside_workspace_fails() {
    let temp = temp_dir();

    refsync_command()
        .current_dir(temp.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a RefSync workspace"));
}

#[test]
fn test_status_json_counts() {
    let workspace = init_workspace();
    {
        let mut store = open_cache(&workspace);
        store
            .create_item("book", "Draft", json!({"title": "Draft"}))
            .unwrap();
    }

    let output = refsync_command()
        .current_dir(workspace.path())
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(valid_status_json().from_utf8())
        .get_output()
        .stdout
        .clone();

    let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(report["items"], 1);
    assert_eq!(report["dirty"]["new"], 1);
    assert_eq!(report["ledger"]["new"], 0);
}

#[test]
fn test_dirty_lists_temporary_keys() {
    let workspace = init_workspace();
    {
        let mut store = open_cache(&workspace);
        store.create_collection("Drafts", None).unwrap();
    }

    refsync_command()
        .current_dir(workspace.path())
        .arg("dirty")
        .assert()
        .success()
        .stdout(predicate::str::contains("collection"))
        .stdout(contains_temporary_key().from_utf8());
}

#[test]
fn test_dirty_on_clean_cache() {
    let workspace = init_workspace();

    refsync_command()
        .current_dir(workspace.path())
        .arg("dirty")
        .assert()
        .success()
        .stderr(predicate::str::contains("Cache matches the server"));
}

#[test]
fn test_retry_requeues_failed_requests() {
    let workspace = init_workspace();
    {
        let mut store = open_cache(&workspace);
        let entry = store
            .enqueue(&NewRequest::add_membership("COLL0001", "ITEM0001"))
            .unwrap();
        store.claim_next().unwrap();
        store
            .mark_error(&entry.uuid, Some(503), "server returned HTTP 503")
            .unwrap();
    }

    refsync_command()
        .current_dir(workspace.path())
        .args(["ledger", "--errors"])
        .assert()
        .success()
        .stderr(predicate::str::contains("HTTP 503"))
        .stderr(predicate::str::contains("/collections/COLL0001/items"));

    refsync_command()
        .current_dir(workspace.path())
        .arg("retry")
        .assert()
        .success()
        .stderr(predicate::str::contains("Requeued 1 failed requests"));

    let store = open_cache(&workspace);
    let counts = store.ledger_counts().unwrap();
    assert_eq!(counts.error, 0);
    assert_eq!(counts.new, 1);
}

#[test]
fn test_retry_unknown_entry_fails() {
    let workspace = init_workspace();

    refsync_command()
        .current_dir(workspace.path())
        .args(["retry", "no-such-entry"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No failed request"));
}

#[test]
fn test_sync_rejects_invalid_config() {
    let temp = temp_dir();
    temp.child(".refsync/config.toml")
        .write_str("[server]\nbase_url = \"ftp://example.org\"\nlibrary_prefix = \"users/1\"\n")
        .unwrap();

    refsync_command()
        .current_dir(temp.path())
        .arg("sync")
        .assert()
        .code(101)
        .stderr(predicate::str::contains("base_url"));
}

#[test]
fn test_sync_flags_conflict() {
    let workspace = init_workspace();

    refsync_command()
        .current_dir(workspace.path())
        .args(["sync", "--push-only", "--collection", "COLL0001"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_push_only_sync_with_unreachable_server_records_failure() {
    let workspace = init_workspace();
    {
        let mut store = open_cache(&workspace);
        store.create_collection("Drafts", None).unwrap();
    }

    refsync_command()
        .current_dir(workspace.path())
        .args(["sync", "--push-only"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("requests failed"));

    let store = open_cache(&workspace);
    assert_eq!(store.ledger_counts().unwrap().error, 1);
}
