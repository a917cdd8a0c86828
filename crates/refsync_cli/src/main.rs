//! RefSync CLI - keeps a local reference library cache in sync with the server
//!
//! Usage: refsync <command> [options]

use anyhow::Context;
use clap::{Parser, Subcommand};
use refsync_common::{RefError, EXIT_CONFIG_ERROR, EXIT_ERROR, EXIT_SYNC_FAILURES};
use refsync_config::{Config, WORKSPACE_DIR};
use refsync_store::{DirtyQueue, DirtyState, LedgerEntry, RequestStatus, Store};
use refsync_sync::{HttpTransport, SyncEngine, SyncOptions, SyncScope, Update};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

#[derive(Parser)]
#[command(
    name = "refsync",
    version = "0.1.0",
    about = "RefSync reference library sync client"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    /// Workspace root (defaults to the current directory)
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new RefSync workspace
    Init {
        /// Library path on the server, e.g. users/5770
        #[arg(long)]
        library: Option<String>,

        /// API base URL
        #[arg(long)]
        base_url: Option<String>,
    },

    /// Push local changes and pull remote ones
    Sync {
        /// Only pull the members of this collection
        #[arg(long, conflicts_with = "push_only")]
        collection: Option<String>,

        /// Push local changes without pulling anything new
        #[arg(long)]
        push_only: bool,
    },

    /// Show cache and ledger counts
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List queued and finished requests
    Ledger {
        /// Only show failed requests
        #[arg(long)]
        errors: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Requeue failed requests for the next sync
    Retry {
        /// Ledger entry to requeue (all failed entries when omitted)
        uuid: Option<String>,
    },

    /// List entities that differ from the server copy
    Dirty {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    refsync_common::telemetry::init_tracing(cli.verbose, cli.json_logs);
    tracing::debug!("RefSync CLI started");

    let root = cli.root.as_path();
    let result = match cli.command {
        Commands::Init { library, base_url } => cmd_init(root, library, base_url).await,
        Commands::Sync {
            collection,
            push_only,
        } => cmd_sync(root, collection, push_only).await,
        Commands::Status { json } => cmd_status(root, json).await,
        Commands::Ledger { errors, json } => cmd_ledger(root, errors, json).await,
        Commands::Retry { uuid } => cmd_retry(root, uuid).await,
        Commands::Dirty { json } => cmd_dirty(root, json).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        let code = match e.downcast_ref::<RefError>() {
            Some(RefError::ConfigError(_)) => EXIT_CONFIG_ERROR,
            _ => EXIT_ERROR,
        };
        std::process::exit(code);
    }
}

//
// Helper functions
//

/// Load the workspace config, refusing directories without `.refsync/`
fn load_config(root: &Path) -> anyhow::Result<Config> {
    if !root.join(WORKSPACE_DIR).is_dir() {
        anyhow::bail!(
            "{} is not a RefSync workspace (run `refsync init` first)",
            root.display()
        );
    }
    Ok(Config::load(root)?)
}

fn open_store(config: &Config) -> anyhow::Result<Store> {
    let path = config.db_path();
    Store::open(&path).with_context(|| format!("Failed to open cache at {}", path.display()))
}

fn format_time(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn print_entry(entry: &LedgerEntry) {
    let status = match entry.http_status {
        Some(code) => format!("{} ({})", entry.status, code),
        None => entry.status.to_string(),
    };
    eprintln!(
        "  {:>4}  {:<16} {:<6} {}",
        entry.seq,
        status,
        entry.method.as_str(),
        entry.path
    );
    eprintln!(
        "        {} · {} attempts · queued {}",
        entry.uuid,
        entry.attempts,
        format_time(entry.created_at)
    );
    if let Some(blocked) = &entry.blocked_on {
        eprintln!("        waiting for {}", blocked);
    }
    if let Some(error) = &entry.last_error {
        eprintln!("        ✗ {}", error);
    }
}

//
// Command implementations
//

async fn cmd_init(
    root: &Path,
    library: Option<String>,
    base_url: Option<String>,
) -> anyhow::Result<()> {
    use std::fs;

    let workspace = root.join(WORKSPACE_DIR);
    if !workspace.exists() {
        fs::create_dir_all(&workspace)?;
        eprintln!("✓ Created {}/", WORKSPACE_DIR);
    } else {
        eprintln!("✓ {}/ already exists", WORKSPACE_DIR);
    }

    let config_path = workspace.join("config.toml");
    if !config_path.exists() {
        let mut config = Config::default();
        if let Some(library) = library {
            config.server.library_prefix = library;
        }
        if let Some(base_url) = base_url {
            config.server.base_url = base_url;
        }
        let rendered = format!(
            "# RefSync configuration\n# The API key is read from {}\n\n{}",
            refsync_config::API_KEY_ENV,
            config.to_toml_string()?
        );
        fs::write(&config_path, rendered)?;
        eprintln!("✓ Created {}/config.toml", WORKSPACE_DIR);
    } else {
        eprintln!("✓ {}/config.toml already exists", WORKSPACE_DIR);
    }

    // Keep the cache out of version control
    let gitignore_path = root.join(".gitignore");
    let gitignore_entries = "\n# RefSync\n.refsync/cache.db\n";
    if gitignore_path.exists() {
        let content = fs::read_to_string(&gitignore_path)?;
        if !content.contains(".refsync/cache.db") {
            fs::write(&gitignore_path, format!("{}{}", content, gitignore_entries))?;
            eprintln!("✓ Updated .gitignore");
        }
    } else {
        fs::write(&gitignore_path, gitignore_entries.trim_start())?;
        eprintln!("✓ Created .gitignore");
    }

    eprintln!("✓ Workspace initialized");
    Ok(())
}

async fn cmd_sync(
    root: &Path,
    collection: Option<String>,
    push_only: bool,
) -> anyhow::Result<()> {
    use indicatif::{ProgressBar, ProgressStyle};
    use std::time::{Duration, Instant};

    let start = Instant::now();
    let config = load_config(root)?;
    config.validate()?;

    let scope = match (collection, push_only) {
        (Some(key), _) => SyncScope::Collection(key),
        (None, true) => SyncScope::PushOnly,
        (None, false) => SyncScope::Everything,
    };

    let store = Arc::new(Mutex::new(open_store(&config)?));
    let transport = HttpTransport::from_config(&config)?;
    let engine = SyncEngine::new(store, transport, SyncOptions::from(&config));

    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("⚠ Stopping after the current request...");
            cancel.cancel();
        }
    });

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message("Syncing...");
    pb.enable_steady_tick(Duration::from_millis(80));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let progress = pb.clone();
    let printer = tokio::spawn(async move {
        let mut touched = 0usize;
        while let Some(update) = rx.recv().await {
            match update {
                Ok(Update::EntityUpdated(entity)) => {
                    touched += 1;
                    progress.set_message(format!(
                        "{} entities · {} {} {:?}",
                        touched, entity.kind, entity.key, entity.change
                    ));
                }
                Ok(Update::QueuedMore(n)) => tracing::debug!("{} follow-up requests queued", n),
                Ok(Update::BatchComplete(_)) => {}
                Err(failure) => progress.println(format!("✗ {}", failure)),
            }
        }
    });

    let result = engine.sync(&scope, &tx).await;
    drop(tx);
    let _ = printer.await;
    pb.finish_and_clear();

    let summary = result?;
    eprintln!(
        "✓ Sync finished in {}ms: {} requests done, {} entities updated",
        start.elapsed().as_millis(),
        summary.requests_done,
        summary.entities_updated
    );
    if summary.requests_pending > 0 {
        eprintln!("  {} requests still queued", summary.requests_pending);
    }
    if summary.cancelled {
        eprintln!("⚠ Sync was cancelled");
    }
    if summary.requests_failed > 0 {
        eprintln!(
            "✗ {} requests failed (see `refsync ledger --errors`)",
            summary.requests_failed
        );
    }
    if !summary.is_clean() {
        std::process::exit(EXIT_SYNC_FAILURES);
    }
    Ok(())
}

async fn cmd_status(root: &Path, json: bool) -> anyhow::Result<()> {
    use serde_json::json;

    let config = load_config(root)?;
    let store = open_store(&config)?;
    let stats = store.stats()?;
    let ledger = store.ledger_counts()?;
    let dirty = DirtyQueue::snapshot(&store)?;

    if json {
        let report = json!({
            "items": stats.items,
            "collections": stats.collections,
            "attachments": stats.attachments,
            "memberships": stats.memberships,
            "tombstones": stats.tombstones,
            "dirty": {
                "new": dirty.count_in(DirtyState::New),
                "dirty": dirty.count_in(DirtyState::Dirty),
                "stale": dirty.count_in(DirtyState::Stale),
                "missing": dirty.count_in(DirtyState::Missing),
            },
            "ledger": ledger,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Library: {}", config.server.library_prefix);
    println!(
        "Cache:   {} items, {} collections, {} attachments",
        stats.items, stats.collections, stats.attachments
    );
    println!(
        "Local:   {} new, {} edited, {} deleted",
        dirty.count_in(DirtyState::New),
        dirty.count_in(DirtyState::Dirty),
        stats.tombstones
    );
    println!(
        "Remote:  {} stale, {} missing",
        dirty.count_in(DirtyState::Stale),
        dirty.count_in(DirtyState::Missing)
    );
    println!(
        "Ledger:  {} queued ({} blocked), {} failed, {} done",
        ledger.pending(),
        ledger.blocked,
        ledger.error,
        ledger.done
    );
    Ok(())
}

async fn cmd_ledger(root: &Path, errors: bool, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let store = open_store(&config)?;
    let filter = errors.then_some(RequestStatus::Error);
    let entries = store.ledger_entries(filter)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        eprintln!("✓ No requests in the ledger");
        return Ok(());
    }
    for entry in &entries {
        print_entry(entry);
    }
    Ok(())
}

async fn cmd_retry(root: &Path, uuid: Option<String>) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let mut store = open_store(&config)?;

    match uuid {
        Some(uuid) => {
            if !store.requeue_entry(&uuid)? {
                anyhow::bail!("No failed request with id {}", uuid);
            }
            eprintln!("✓ Requeued {}", uuid);
        }
        None => {
            let failed = store.ledger_entries(Some(RequestStatus::Error))?;
            let mut requeued = 0;
            for entry in &failed {
                if store.requeue_entry(&entry.uuid)? {
                    requeued += 1;
                }
            }
            eprintln!("✓ Requeued {} failed requests", requeued);
        }
    }
    Ok(())
}

async fn cmd_dirty(root: &Path, json: bool) -> anyhow::Result<()> {
    use serde_json::json;

    let config = load_config(root)?;
    let store = open_store(&config)?;
    let queue = DirtyQueue::snapshot(&store)?;

    if json {
        let entries: Vec<_> = queue
            .entries()
            .map(|e| json!({"kind": e.kind(), "key": e.key(), "dirty": e.dirty()}))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if queue.is_empty() {
        eprintln!("✓ Cache matches the server");
        return Ok(());
    }
    for entry in queue.entries() {
        println!(
            "{:<10} {:<8} {}",
            entry.kind().as_str(),
            entry.dirty().as_str(),
            entry.key()
        );
    }
    Ok(())
}
