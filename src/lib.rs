//! # hytale-content
//!
//! Content delivery and patch engine for Hytale launcher applications.
//!
//! ## Design Philosophy
//!
//! hytale-content is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Self-healing** - A failed incremental patch falls back to a full
//!   redownload of the same target build
//! - **Cache-transparent** - A cache hit is indistinguishable from a
//!   fresh, hash-verified download
//! - **Event-driven** - Consumers subscribe to one progress stream, no
//!   polling or per-call callbacks
//!
//! ## Quick Start
//!
//! ```no_run
//! use hytale_content::{Channel, ContentEngine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::new("/opt/hytale");
//!     let engine = ContentEngine::new(config).await?;
//!
//!     // Subscribe to progress events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("[{:?}] {}", event.stage, event.message);
//!         }
//!     });
//!
//!     // Bring the stable channel to the newest build
//!     engine.install_or_update(Channel::Latest).await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Token-bucket bandwidth limiting
pub mod bandwidth;
/// Content-addressed download cache
pub mod cache;
/// Configuration types
pub mod config;
/// Resumable single-URL download engine
pub mod engine;
/// Error types
pub mod error;
/// Archive extraction
pub mod extract;
/// Streaming file hashing
pub mod hasher;
/// Install and update orchestration
pub mod orchestrator;
/// External differential patch tool
pub mod patch_tool;
/// In-place binary string patching
pub mod patcher;
/// Canonical on-disk locations
pub mod paths;
/// CDN version discovery
pub mod probe;
/// Retry logic with exponential backoff
pub mod retry;
/// Cache-aware parallel download service
pub mod service;
/// Durable launcher state
pub mod state;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use bandwidth::BandwidthLimiter;
pub use cache::{CacheEntry, CacheStore};
pub use config::{CacheConfig, CdnConfig, EngineConfig, NetworkConfig, RemoteConfig, RetryConfig, ToolConfig};
pub use engine::{DownloadEngine, FetchOptions};
pub use error::{DownloadError, Error, FailureReport, PatchError, Result, StateError};
pub use orchestrator::PatchOrchestrator;
pub use patch_tool::{CliPatchTool, PatchTool};
pub use patcher::{BinaryPatcher, ReplacementRule, TextEncoding};
pub use paths::PathResolver;
pub use probe::VersionProbe;
pub use service::DownloadService;
pub use state::{Language, Settings, StateStore, WindowBounds};
pub use types::{
    BuildRecord, Channel, DownloadResult, DownloadTask, FileHash, MissingSweep, PatchInfo,
    PatchReport, Priority, ProgressEvent, ServiceStats, Stage,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Main engine instance (cloneable - all fields are Arc-wrapped)
///
/// Composes the downloader, cache, version probe, orchestrator, binary
/// patcher and state store behind the interface consumed by the
/// launcher's UI, mod and launch collaborators. Ownership is one-way:
/// the service owns the engine which owns the limiter; the orchestrator
/// holds the service and the state store; nothing refers back.
#[derive(Clone)]
pub struct ContentEngine {
    config: Arc<EngineConfig>,
    limiter: BandwidthLimiter,
    service: DownloadService,
    orchestrator: PatchOrchestrator,
    state: StateStore,
    paths: PathResolver,
    patcher: BinaryPatcher,
    event_tx: broadcast::Sender<ProgressEvent>,
}

impl ContentEngine {
    /// Create a new engine rooted at `config.root_dir`
    ///
    /// This initializes all core components:
    /// - Loads settings and build records (running migrations)
    /// - Opens the content cache and verifies its integrity
    /// - Builds the HTTP stack with bandwidth limiting and retries
    /// - Reads the shipped `config.json` for local-archive overrides
    ///
    /// Settings may override the configured bandwidth cap and fan-out
    /// width; the configuration supplies defaults.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let paths = PathResolver::new(&config.root_dir);
        tokio::fs::create_dir_all(paths.root()).await?;
        tokio::fs::create_dir_all(paths.temp_dir()).await?;

        let state = StateStore::load(&paths.settings_file(), &paths.version_file()).await?;
        let settings = state.settings().await;

        // Event buffer sized for bursty per-chunk progress
        let (event_tx, _rx) = broadcast::channel(1024);

        let bandwidth_cap = settings
            .max_download_speed_bps
            .filter(|bps| *bps > 0)
            .or(config.network.max_download_speed_bps.filter(|bps| *bps > 0));
        let limiter = BandwidthLimiter::new(bandwidth_cap);

        let engine = DownloadEngine::new(limiter.clone(), config.retry.clone(), event_tx.clone())?;
        let cache = CacheStore::open(
            &paths.cache_dir(),
            config.cache.max_bytes,
            config.cache.max_age,
        )
        .await?;

        let max_parallel = settings
            .max_parallel_downloads
            .unwrap_or(config.network.max_parallel_downloads);
        let service = DownloadService::new(engine, cache, max_parallel, event_tx.clone());

        let probe = VersionProbe::new(&config.cdn)?;
        let remote = RemoteConfig::load(&paths.root().join("config.json"))?;

        let orchestrator = PatchOrchestrator::new(
            service.clone(),
            probe,
            state.clone(),
            paths.clone(),
            remote,
            config.tool.clone(),
            event_tx.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            limiter,
            service,
            orchestrator,
            state,
            paths,
            patcher: BinaryPatcher,
            event_tx,
        })
    }

    /// Subscribe to the progress event stream
    ///
    /// Multiple subscribers are supported; each receives all events
    /// independently. Slow subscribers that fall behind the buffer
    /// receive a `Lagged` error and continue from the newest events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.event_tx.subscribe()
    }

    /// Download one file (cache-aware, deduplicated, resumable)
    pub async fn download_file(&self, task: &DownloadTask) -> Result<DownloadResult> {
        self.service.download_file(task).await
    }

    /// Download a batch with bounded concurrency
    pub async fn download_files(&self, tasks: Vec<DownloadTask>) -> Vec<Result<DownloadResult>> {
        self.service.download_files(tasks).await
    }

    /// Verify destinations and fetch only files that fail
    pub async fn download_missing(&self, tasks: Vec<DownloadTask>) -> Result<MissingSweep> {
        self.service.download_missing(tasks).await
    }

    /// Check files against expected hashes
    pub async fn verify_files(
        &self,
        pairs: &[(PathBuf, FileHash)],
    ) -> Result<HashMap<PathBuf, bool>> {
        self.service.verify_files(pairs).await
    }

    /// Bring a channel to the newest available build
    pub async fn install_or_update(&self, channel: Channel) -> Result<()> {
        self.orchestrator.install_or_update(channel).await
    }

    /// Delete a channel's game files so the next update reinstalls
    pub async fn repair(&self, channel: Channel) -> Result<()> {
        self.orchestrator.repair(channel).await
    }

    /// Rewrite well-known strings inside an executable or archive
    pub async fn patch_binary(
        &self,
        path: &Path,
        rules: &[ReplacementRule],
        encoding: TextEncoding,
    ) -> Result<PatchReport> {
        self.patcher.patch(path, rules, encoding).await
    }

    /// Snapshot of the download counters
    pub fn stats(&self) -> ServiceStats {
        self.service.stats()
    }

    /// Change the bandwidth cap at runtime (`None` = unlimited)
    pub async fn set_bandwidth_limit(&self, bps: Option<u64>) {
        self.limiter.set_limit(bps.filter(|b| *b > 0)).await;
    }

    /// Change the fan-out width at runtime
    pub fn set_max_parallel(&self, max_parallel: usize) {
        self.service.set_max_parallel(max_parallel);
    }

    /// Cancel every in-flight download
    pub fn cancel_all(&self) {
        self.service.cancel_all();
    }

    /// Current settings snapshot
    pub async fn settings(&self) -> Settings {
        self.state.settings().await
    }

    /// Replace the settings (validated, persisted atomically)
    pub async fn set_settings(&self, settings: Settings) -> Result<()> {
        self.state.set_settings(settings).await
    }

    /// Installed-build record for a channel
    pub async fn build_record(&self, channel: Channel) -> BuildRecord {
        self.state.build_record(channel).await
    }

    /// The engine configuration
    pub fn config(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.config)
    }

    /// Well-known paths under the application root
    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    /// The underlying orchestrator (tool injection for embedders)
    pub fn orchestrator(&self) -> &PatchOrchestrator {
        &self.orchestrator
    }
}

/// Helper to run the engine until the process receives a termination
/// signal, then cancel all in-flight work.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// In-flight transfers abort at the next chunk boundary, keeping their
/// `.part` files for resume on the next run.
///
/// # Example
///
/// ```no_run
/// use hytale_content::{ContentEngine, EngineConfig, cancel_on_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = ContentEngine::new(EngineConfig::new("/opt/hytale")).await?;
///     cancel_on_shutdown(engine).await;
///     Ok(())
/// }
/// ```
pub async fn cancel_on_shutdown(engine: ContentEngine) {
    wait_for_signal().await;
    engine.cancel_all();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
            } else {
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
            } else {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to listen for Ctrl+C signal");
        }
    }
}
