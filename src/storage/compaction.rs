//! Background compaction worker for the MVCC store.
//!
//! Compaction removes old revisions that are no longer needed, reclaiming disk and memory space.
//! This module provides a background task that periodically compacts the store without
//! interfering with normal read/write operations.
//!
//! Compaction modes:
//! - Periodic: keep every revision committed within the retention window
//! - Revision: keep the last N revisions

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::storage::{StorageError, StorageResult, Store};

/// Compaction strategy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompactionMode {
    /// Compact to the revision that was current `retention` ago
    Periodic { retention: Duration },

    /// Compact to `current_revision - retain`
    Revision { retain: i64 },
}

impl CompactionMode {
    /// Parses a mode name (`periodic` or `revision`) and its retention.
    ///
    /// Periodic retention accepts `500ms`, `30s`, `10m` or `2h`; a bare number is hours.
    /// Revision retention is a revision count.
    pub fn parse(mode: &str, retention: &str) -> StorageResult<Self> {
        match mode.to_lowercase().as_str() {
            "periodic" => Ok(CompactionMode::Periodic {
                retention: parse_duration(retention)?,
            }),
            "revision" => {
                let retain = retention.parse::<i64>().map_err(|e| {
                    StorageError::InvalidArgument(format!(
                        "invalid revision retention {:?}: {}",
                        retention, e
                    ))
                })?;
                if retain < 0 {
                    return Err(StorageError::InvalidArgument(format!(
                        "revision retention must not be negative, got {}",
                        retain
                    )));
                }
                Ok(CompactionMode::Revision { retain })
            }
            other => Err(StorageError::InvalidArgument(format!(
                "unknown compaction mode {:?} (expected periodic or revision)",
                other
            ))),
        }
    }
}

fn parse_duration(s: &str) -> StorageResult<Duration> {
    let s = s.trim();
    let invalid = || StorageError::InvalidArgument(format!("invalid retention {:?}", s));

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let n: u64 = number.parse().map_err(|_| invalid())?;

    let duration = match unit {
        "" | "h" => Duration::from_secs(n * 3600),
        "m" => Duration::from_secs(n * 60),
        "s" => Duration::from_secs(n),
        "ms" => Duration::from_millis(n),
        _ => return Err(invalid()),
    };
    if duration.is_zero() {
        return Err(invalid());
    }
    Ok(duration)
}

/// Background compactor that removes old revisions.
pub struct Compactor {
    /// Reference to the MVCC store
    store: Arc<Store>,

    /// Compaction mode
    mode: CompactionMode,

    /// How often the current revision is sampled
    interval: Duration,
}

impl Compactor {
    /// Creates a new compactor.
    pub fn new(store: Arc<Store>, mode: CompactionMode, interval: Duration) -> Self {
        Self {
            store,
            mode,
            interval,
        }
    }

    /// Spawns a background tokio task that performs compaction.
    ///
    /// Returns a JoinHandle that can be awaited or aborted.
    pub fn run(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            let mut samples = VecDeque::new();

            info!(
                "Starting compactor with mode {:?} and interval {:?}",
                self.mode, self.interval
            );

            loop {
                ticker.tick().await;

                let now = Instant::now();
                samples.push_back((now, self.store.current_revision()));

                let Some(target) = self.next_target(&mut samples, now) else {
                    continue;
                };

                debug!(
                    "Compaction due: current_rev={}, compact_rev={}, target={}",
                    self.store.current_revision(),
                    self.store.compact_revision(),
                    target
                );

                match self.compact_to(target).await {
                    Ok(()) => info!("Background compaction completed to revision {}", target),
                    Err(StorageError::Closed) => {
                        info!("Store closed, stopping compactor");
                        return;
                    }
                    Err(e) => warn!("Background compaction to revision {} failed: {}", target, e),
                }
            }
        })
    }

    /// Picks the revision to compact to, if any is due.
    ///
    /// `samples` holds `(when, current_revision)` observations, oldest first. Periodic mode
    /// consumes every sample at least `retention` old and targets the newest of them.
    fn next_target(&self, samples: &mut VecDeque<(Instant, i64)>, now: Instant) -> Option<i64> {
        let target = match &self.mode {
            CompactionMode::Periodic { retention } => {
                let mut target = None;
                while let Some(&(at, rev)) = samples.front() {
                    if now.saturating_duration_since(at) < *retention {
                        break;
                    }
                    target = Some(rev);
                    samples.pop_front();
                }
                target?
            }
            CompactionMode::Revision { retain } => {
                samples.clear();
                self.store.current_revision() - retain
            }
        };

        (target > 1 && target > self.store.compact_revision()).then_some(target)
    }

    /// Compacts to `revision` and waits for the sweep to finish.
    pub async fn compact_to(&self, revision: i64) -> StorageResult<()> {
        let done = self.store.compact(revision)?;

        tokio::task::spawn_blocking(move || done.recv())
            .await
            .map_err(|e| StorageError::Compaction(format!("compaction waiter failed: {}", e)))?
            .map_err(|_| {
                StorageError::Compaction("compaction thread exited without a result".to_string())
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Backend, BackendConfig, RangeOptions, StoreConfig};
    use tempfile::TempDir;

    fn setup_store() -> (Arc<Store>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = BackendConfig {
            data_dir: temp_dir.path().to_path_buf(),
            cache_size_mb: 16,
            flush_interval_ms: 0,
            sync_on_commit: false,
        };

        let backend = Backend::new(config).unwrap();
        (Store::open(backend, StoreConfig::default()).unwrap(), temp_dir)
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(
            CompactionMode::parse("periodic", "10m").unwrap(),
            CompactionMode::Periodic {
                retention: Duration::from_secs(600)
            }
        );
        assert_eq!(
            CompactionMode::parse("periodic", "2").unwrap(),
            CompactionMode::Periodic {
                retention: Duration::from_secs(7200)
            }
        );
        assert_eq!(
            CompactionMode::parse("periodic", "250ms").unwrap(),
            CompactionMode::Periodic {
                retention: Duration::from_millis(250)
            }
        );
        assert_eq!(
            CompactionMode::parse("revision", "1000").unwrap(),
            CompactionMode::Revision { retain: 1000 }
        );

        assert!(CompactionMode::parse("periodic", "0s").is_err());
        assert!(CompactionMode::parse("periodic", "10d").is_err());
        assert!(CompactionMode::parse("revision", "-1").is_err());
        assert!(CompactionMode::parse("weekly", "1").is_err());
    }

    #[tokio::test]
    async fn test_periodic_target_uses_samples_older_than_retention() {
        let (store, _dir) = setup_store();
        let compactor = Compactor::new(
            store,
            CompactionMode::Periodic {
                retention: Duration::from_secs(60),
            },
            Duration::from_secs(10),
        );

        let start = Instant::now();
        let mut samples = VecDeque::from([
            (start, 5),
            (start + Duration::from_secs(30), 8),
            (start + Duration::from_secs(50), 12),
        ]);

        assert_eq!(
            compactor.next_target(&mut samples, start + Duration::from_secs(40)),
            None
        );
        assert_eq!(samples.len(), 3);

        assert_eq!(
            compactor.next_target(&mut samples, start + Duration::from_secs(95)),
            Some(8)
        );
        assert_eq!(samples.len(), 1);
    }

    #[tokio::test]
    async fn test_revision_target() {
        let (store, _dir) = setup_store();
        for i in 0..10 {
            store.put(format!("key{}", i).as_bytes(), b"value").unwrap();
        }
        let current = store.current_revision();

        let compactor = Compactor::new(
            store.clone(),
            CompactionMode::Revision { retain: 4 },
            Duration::from_secs(1),
        );
        let mut samples = VecDeque::new();
        assert_eq!(
            compactor.next_target(&mut samples, Instant::now()),
            Some(current - 4)
        );

        compactor.compact_to(current - 4).await.unwrap();
        assert_eq!(compactor.next_target(&mut samples, Instant::now()), None);
    }

    #[tokio::test]
    async fn test_manual_compact() {
        let (store, _dir) = setup_store();

        for i in 0..5 {
            store.put(b"key", format!("value{}", i).as_bytes()).unwrap();
        }
        let current = store.current_revision();

        let compactor = Compactor::new(
            store.clone(),
            CompactionMode::Revision { retain: 0 },
            Duration::from_secs(60),
        );

        compactor.compact_to(current - 1).await.unwrap();
        assert_eq!(store.compact_revision(), current - 1);

        let result = store.range(b"key", None, RangeOptions::default()).unwrap();
        assert_eq!(result.kvs[0].value, b"value4");

        assert!(matches!(
            compactor.compact_to(current + 1).await,
            Err(StorageError::FutureRevision { .. })
        ));
    }

    #[tokio::test]
    async fn test_background_revision_compaction() {
        let (store, _dir) = setup_store();
        for i in 0..10 {
            store.put(b"key", format!("value{}", i).as_bytes()).unwrap();
        }
        let current = store.current_revision();

        let handle = Compactor::new(
            store.clone(),
            CompactionMode::Revision { retain: 2 },
            Duration::from_millis(20),
        )
        .run();

        for _ in 0..100 {
            if store.compact_revision() == current - 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();

        assert_eq!(store.compact_revision(), current - 2);
    }
}
