//! # revkv - command-line front end for the revkv engine
//!
//! Opens a data directory, runs a single operation against it and closes it again, or
//! keeps the store open with the background compactor until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

use revkv::{
    Backend, BackendConfig, CompactionMode, Compactor, EventType, RangeOptions, Store,
    StoreConfig,
};

/// An embedded multi-version key-value store.
///
/// Every write creates a new revision; reads can be served at any revision that has not
/// been compacted away.
#[derive(Parser, Debug)]
#[command(name = "revkv", version, about = "Revision-indexed MVCC key-value store")]
struct Args {
    /// Path to the data directory.
    #[arg(long, default_value = "default.revkv")]
    data_dir: String,

    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Backend page cache size in megabytes.
    #[arg(long, default_value_t = 256)]
    cache_size_mb: u64,

    /// Flush the backend on every commit instead of in the background.
    #[arg(long, default_value_t = false)]
    sync: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Put a key.
    Put { key: String, value: String },

    /// Get a key or a range of keys.
    Get {
        key: String,

        /// Exclusive end of the range; "\0" reads every key from KEY onwards.
        #[arg(long, conflicts_with = "prefix")]
        end: Option<String>,

        /// Treat KEY as a prefix.
        #[arg(long)]
        prefix: bool,

        /// Revision to read at (0 reads the current revision).
        #[arg(long, default_value_t = 0)]
        rev: i64,

        /// Maximum number of keys returned (0 is unlimited).
        #[arg(long, default_value_t = 0)]
        limit: i64,

        /// Only print the number of keys.
        #[arg(long)]
        count_only: bool,
    },

    /// Delete a key or a range of keys.
    Del {
        key: String,

        #[arg(long, conflicts_with = "prefix")]
        end: Option<String>,

        #[arg(long)]
        prefix: bool,
    },

    /// Compact the history up to a revision and wait for the sweep.
    Compact { revision: i64 },

    /// Print every change from a revision onwards.
    Events {
        #[arg(default_value_t = 1)]
        from: i64,
    },

    /// Print store revisions and size.
    Status,

    /// Keep the store open with the background compactor until SIGINT/SIGTERM.
    Run {
        /// Compaction mode - 'periodic' or 'revision'.
        #[arg(long, default_value = "periodic")]
        compaction_mode: String,

        /// Retention for the mode: a duration such as "10m" (bare numbers are hours), or a
        /// number of revisions to keep.
        #[arg(long, default_value = "1h")]
        compaction_retention: String,

        /// How often the compactor samples the current revision, in milliseconds.
        #[arg(long, default_value_t = 60_000)]
        compaction_interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level)?;

    let backend = Backend::new(BackendConfig {
        data_dir: PathBuf::from(&args.data_dir),
        cache_size_mb: args.cache_size_mb,
        sync_on_commit: args.sync,
        ..BackendConfig::default()
    })
    .with_context(|| format!("failed to open backend at {}", args.data_dir))?;

    let store = Store::open(backend, StoreConfig::default()).context("failed to open store")?;

    let result = execute(&store, args.command).await;
    if let Err(e) = &result {
        error!("Command failed: {:?}", e);
    }

    store.close().context("failed to close store")?;
    result
}

async fn execute(store: &Arc<Store>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Put { key, value } => {
            let rev = store.put(key.as_bytes(), value.as_bytes())?;
            println!("OK (revision {})", rev);
        }
        Command::Get {
            key,
            end,
            prefix,
            rev,
            limit,
            count_only,
        } => {
            let end = range_end(&key, end, prefix);
            let opts = RangeOptions {
                limit,
                rev,
                count_only,
            };
            let result = store.range(key.as_bytes(), end.as_deref(), opts)?;

            if count_only {
                println!("{}", result.count);
            } else {
                for kv in &result.kvs {
                    println!(
                        "{}\n{}",
                        String::from_utf8_lossy(&kv.key),
                        String::from_utf8_lossy(&kv.value)
                    );
                }
                if result.more {
                    println!("({} of {} keys shown)", result.kvs.len(), result.count);
                }
            }
        }
        Command::Del { key, end, prefix } => {
            let end = range_end(&key, end, prefix);
            let (deleted, rev) = store.delete_range(key.as_bytes(), end.as_deref())?;
            println!("{} (revision {})", deleted, rev);
        }
        Command::Compact { revision } => {
            let compactor = Compactor::new(
                Arc::clone(store),
                CompactionMode::Revision { retain: 0 },
                Duration::from_secs(60),
            );
            compactor.compact_to(revision).await?;
            println!("compacted revision {}", revision);
        }
        Command::Events { from } => {
            for event in store.events(from)? {
                let kind = match event.event_type {
                    EventType::Put => "PUT",
                    EventType::Delete => "DELETE",
                };
                println!(
                    "{} {} {} {}",
                    event.kv.mod_revision,
                    kind,
                    String::from_utf8_lossy(&event.kv.key),
                    String::from_utf8_lossy(&event.kv.value)
                );
            }
        }
        Command::Status => {
            println!("Revision:            {}", store.current_revision());
            println!("Compacted revision:  {}", store.compact_revision());
            println!("Keys:                {}", store.key_count());
            println!("DB size:             {} bytes", store.db_size());
        }
        Command::Run {
            compaction_mode,
            compaction_retention,
            compaction_interval_ms,
        } => {
            let mode = CompactionMode::parse(&compaction_mode, &compaction_retention)?;
            let compactor = Compactor::new(
                Arc::clone(store),
                mode,
                Duration::from_millis(compaction_interval_ms.max(1)),
            );
            let handle = compactor.run();

            info!(
                "revkv running at revision {}, waiting for shutdown signal",
                store.current_revision()
            );
            wait_for_shutdown().await?;

            handle.abort();
            info!("Shutting down");
        }
    }
    Ok(())
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" => EnvFilter::new("trace"),
        "debug" => EnvFilter::new("debug"),
        "info" => EnvFilter::new("info"),
        "warn" => EnvFilter::new("warn"),
        "error" => EnvFilter::new("error"),
        _ => {
            eprintln!("Invalid log level: {}. Using 'warn'", log_level);
            EnvFilter::new("warn")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

/// Resolves the range end for a key argument.
fn range_end(key: &str, end: Option<String>, prefix: bool) -> Option<Vec<u8>> {
    if prefix {
        return Some(prefix_range_end(key.as_bytes()));
    }
    end.map(|e| if e == "\\0" { vec![0] } else { e.into_bytes() })
}

/// Returns the smallest key greater than every key starting with `prefix`.
///
/// A prefix of only 0xff bytes (or an empty one) has no such key and yields "\0", which
/// ranges to the end of the keyspace.
fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

/// Waits for SIGTERM or SIGINT.
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM signal");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT signal");
        }
    }
    Ok(())
}
