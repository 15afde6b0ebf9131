//! Download service: cache-aware, deduplicating, parallel
//!
//! Layers the resumable engine and the content cache:
//! - one network fetch per URL at a time (concurrent callers share the
//!   winner's outcome),
//! - cache-first when the expected hash is known,
//! - bounded parallel fan-out with aggregate progress,
//! - a missing-file sweep that only fetches what fails verification.

use crate::cache::CacheStore;
use crate::engine::{DownloadEngine, FetchOptions};
use crate::error::{DownloadError, Error, Result};
use crate::hasher;
use crate::types::{
    DownloadResult, DownloadTask, FileHash, MissingSweep, ProgressEvent, ServiceStats, Stage,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cloneable outcome shared with deduplicated callers
#[derive(Clone, Debug)]
enum FlightOutcome {
    Success {
        path: PathBuf,
        size: u64,
        hash: Option<FileHash>,
    },
    Failure {
        message: String,
    },
}

#[derive(Default)]
struct Counters {
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    bytes_downloaded: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// Cache-aware download service with in-flight deduplication
///
/// Cloning is cheap; clones share the engine, cache, dedup map and
/// counters.
#[derive(Clone)]
pub struct DownloadService {
    engine: DownloadEngine,
    cache: CacheStore,
    inflight: Arc<Mutex<HashMap<String, broadcast::Sender<FlightOutcome>>>>,
    max_parallel: Arc<AtomicUsize>,
    counters: Arc<Counters>,
    event_tx: broadcast::Sender<ProgressEvent>,
    cancel_root: CancellationToken,
}

impl DownloadService {
    /// Create a service over the given engine and cache
    pub fn new(
        engine: DownloadEngine,
        cache: CacheStore,
        max_parallel: usize,
        event_tx: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            engine,
            cache,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            max_parallel: Arc::new(AtomicUsize::new(max_parallel.clamp(1, 10))),
            counters: Arc::new(Counters::default()),
            event_tx,
            cancel_root: CancellationToken::new(),
        }
    }

    /// Change the fan-out width; applies to subsequent batches
    pub fn set_max_parallel(&self, max_parallel: usize) {
        self.max_parallel
            .store(max_parallel.clamp(1, 10), Ordering::Relaxed);
    }

    /// Cancel every in-flight and future download on this service
    pub fn cancel_all(&self) {
        self.cancel_root.cancel();
    }

    /// Access to the shared content cache
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Snapshot of the service counters
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            active: self.counters.active.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            bytes_downloaded: self.counters.bytes_downloaded.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
        }
    }

    /// Download one file, consulting the cache and the dedup map
    ///
    /// When the expected hash is known and the URL is cached, the cached
    /// file is copied to the destination without touching the network.
    /// Concurrent calls for the same URL observe one fetch; every caller
    /// ends up with the file at its own destination.
    pub async fn download_file(&self, task: &DownloadTask) -> Result<DownloadResult> {
        let started = Instant::now();

        // Cache-first: a hit is indistinguishable from a fresh download
        if let Some(expected) = &task.expected_hash {
            match self.cache.get(&task.url).await? {
                Some(cached_path) => {
                    copy_if_different(&cached_path, &task.dest_path).await?;
                    self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(url = %task.url, "served from cache");
                    return Ok(DownloadResult {
                        path: task.dest_path.clone(),
                        size: expected.size,
                        hash: Some(expected.clone()),
                        duration: started.elapsed(),
                        from_cache: true,
                    });
                }
                None => {
                    self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Dedup: join an existing flight for this URL if there is one
        let sender = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&task.url) {
                Some(sender) => {
                    let mut rx = sender.subscribe();
                    drop(inflight);
                    debug!(url = %task.url, "joining in-flight download");
                    return self.await_flight(&mut rx, task, started).await;
                }
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(task.url.clone(), tx.clone());
                    tx
                }
            }
        };

        self.counters.active.fetch_add(1, Ordering::Relaxed);
        let outcome = self.fetch_and_cache(task).await;
        self.counters.active.fetch_sub(1, Ordering::Relaxed);

        // Remove the flight before publishing so late arrivals start fresh
        self.inflight.lock().await.remove(&task.url);

        match outcome {
            Ok(result) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_downloaded
                    .fetch_add(result.size, Ordering::Relaxed);
                sender
                    .send(FlightOutcome::Success {
                        path: result.path.clone(),
                        size: result.size,
                        hash: result.hash.clone(),
                    })
                    .ok();
                Ok(result)
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                sender
                    .send(FlightOutcome::Failure {
                        message: e.to_string(),
                    })
                    .ok();
                Err(e)
            }
        }
    }

    /// Download a batch with bounded concurrency and aggregate progress
    ///
    /// Tasks are dispatched highest priority first; the result vector
    /// matches the order of the input tasks.
    pub async fn download_files(&self, tasks: Vec<DownloadTask>) -> Vec<Result<DownloadResult>> {
        let total = tasks.len();
        if total == 0 {
            return Vec::new();
        }

        let mut indexed: Vec<(usize, DownloadTask)> = tasks.into_iter().enumerate().collect();
        indexed.sort_by(|a, b| b.1.priority.cmp(&a.1.priority));

        let semaphore = Arc::new(Semaphore::new(self.max_parallel.load(Ordering::Relaxed)));
        let completed = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::with_capacity(total);
        for (index, task) in indexed {
            let service = self.clone();
            let semaphore = semaphore.clone();
            let completed = completed.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| Error::Cancelled)?;
                let result = service.download_file(&task).await;

                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                service
                    .event_tx
                    .send(ProgressEvent {
                        stage: Stage::Downloading,
                        percent: done as f32 / total as f32 * 100.0,
                        message: format!("{done}/{total} files"),
                        current_file: task
                            .dest_path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned()),
                        speed_bps: None,
                        eta_s: None,
                    })
                    .ok();
                result
            });
            handles.push((index, handle));
        }

        let mut results: Vec<Result<DownloadResult>> = (0..total)
            .map(|_| Err(Error::Other("download task did not run".into())))
            .collect();
        for (index, handle) in handles {
            results[index] = match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::Other(format!("download task panicked: {e}"))),
            };
        }
        results
    }

    /// Verify destinations and fetch only the files that fail
    ///
    /// Every task must carry an expected hash; files already matching on
    /// disk are skipped without touching the network.
    pub async fn download_missing(&self, tasks: Vec<DownloadTask>) -> Result<MissingSweep> {
        let mut sweep = MissingSweep::default();
        let mut to_fetch = Vec::new();

        for task in tasks {
            let Some(expected) = &task.expected_hash else {
                return Err(Error::Config {
                    message: format!("download_missing requires a hash for {}", task.url),
                    key: None,
                });
            };
            if hasher::verify_file(&task.dest_path, expected).await? {
                sweep.skipped.push(task.dest_path.clone());
            } else {
                to_fetch.push(task);
            }
        }

        info!(
            missing = to_fetch.len(),
            intact = sweep.skipped.len(),
            "missing-file sweep"
        );

        let fetched: Vec<(PathBuf, Result<DownloadResult>)> = {
            let paths: Vec<PathBuf> = to_fetch.iter().map(|t| t.dest_path.clone()).collect();
            let results = self.download_files(to_fetch).await;
            paths.into_iter().zip(results).collect()
        };

        for (path, result) in fetched {
            match result {
                Ok(_) => sweep.downloaded.push(path),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "sweep download failed");
                    sweep.failed.push((path, e.to_string()));
                }
            }
        }
        Ok(sweep)
    }

    /// Check a set of files against expected hashes
    pub async fn verify_files(
        &self,
        pairs: &[(PathBuf, FileHash)],
    ) -> Result<HashMap<PathBuf, bool>> {
        let mut out = HashMap::with_capacity(pairs.len());
        for (path, expected) in pairs {
            let ok = hasher::verify_file(path, expected).await?;
            out.insert(path.clone(), ok);
        }
        Ok(out)
    }

    /// Perform the network fetch and record the result in the cache
    async fn fetch_and_cache(&self, task: &DownloadTask) -> Result<DownloadResult> {
        let options = FetchOptions {
            resume: true,
            expected_hash: task.expected_hash.clone(),
            cancel: self.cancel_root.child_token(),
            destructive_cancel: false,
        };
        let result = self.engine.fetch(&task.url, &task.dest_path, &options).await?;

        // Verify-then-cache: only hash-verified results are indexed
        if let Some(hash) = &result.hash {
            if let Err(e) = self.cache.put(&task.url, &result.path, hash).await {
                warn!(url = %task.url, error = %e, "failed to index download in cache");
            }
        }
        Ok(result)
    }

    /// Wait for the winner of an in-flight fetch and adopt its outcome
    async fn await_flight(
        &self,
        rx: &mut broadcast::Receiver<FlightOutcome>,
        task: &DownloadTask,
        started: Instant,
    ) -> Result<DownloadResult> {
        match rx.recv().await {
            Ok(FlightOutcome::Success { path, size, hash }) => {
                copy_if_different(&path, &task.dest_path).await?;
                Ok(DownloadResult {
                    path: task.dest_path.clone(),
                    size,
                    hash,
                    duration: started.elapsed(),
                    from_cache: false,
                })
            }
            Ok(FlightOutcome::Failure { message }) => {
                Err(Error::Download(DownloadError::Failed {
                    url: task.url.clone(),
                    reason: message,
                }))
            }
            Err(_) => Err(Error::Download(DownloadError::Failed {
                url: task.url.clone(),
                reason: "in-flight download dropped without a result".into(),
            })),
        }
    }
}

/// Copy `src` to `dest` unless they are the same path
async fn copy_if_different(src: &Path, dest: &Path) -> Result<()> {
    if src == dest {
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(src, dest).await?;
    Ok(())
}
