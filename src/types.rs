//! Core types for hytale-content

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Release channel of the game
///
/// Channels map to CDN prefixes: `latest` is served from the `release`
/// tree and `beta` from `pre-release`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Stable release track
    #[default]
    Latest,
    /// Pre-release track
    Beta,
}

impl Channel {
    /// The channel name as used in persisted state and configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Latest => "latest",
            Channel::Beta => "beta",
        }
    }

    /// The CDN directory name for this channel
    pub fn cdn_channel(&self) -> &'static str {
        match self {
            Channel::Latest => "release",
            Channel::Beta => "pre-release",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(Channel::Latest),
            "beta" => Ok(Channel::Beta),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Download priority
///
/// Advisory ordering within a fan-out batch; higher priorities are
/// dispatched first.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority (-1)
    Low = -1,
    /// Normal priority (0)
    #[default]
    Normal = 0,
    /// High priority (1)
    High = 1,
}

/// Lifecycle stage reported in progress events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Validating the installed state against the CDN
    Checking,
    /// Transferring bytes
    Downloading,
    /// Unpacking an archive payload
    Extracting,
    /// Applying a differential patch
    Patching,
    /// Hash-verifying files on disk
    Verifying,
    /// Operation finished
    Complete,
    /// Incremental patch failed; full redownload in progress
    RescueMode,
    /// Reconciling an existing install with the version record
    Syncing,
}

/// Progress event emitted on the engine's broadcast stream
///
/// A single tagged event stream replaces per-call progress callbacks;
/// subscribe via [`crate::ContentEngine::subscribe`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Current lifecycle stage
    pub stage: Stage,
    /// Completion percentage in `[0, 100]`
    pub percent: f32,
    /// Human-readable status line
    pub message: String,
    /// File currently being processed, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    /// Current transfer speed in bytes per second
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_bps: Option<u64>,
    /// Estimated seconds remaining
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_s: Option<u64>,
}

impl ProgressEvent {
    /// Convenience constructor for stage-only events
    pub fn stage(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            percent: 0.0,
            message: message.into(),
            current_file: None,
            speed_bps: None,
            eta_s: None,
        }
    }
}

/// Multi-algorithm digest of a file plus its size
///
/// All fields are required when a hash is recorded in the cache index.
/// Digests are lowercase hex. Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    /// File size in bytes
    pub size: u64,
    /// MD5 digest (32 hex chars)
    pub md5: String,
    /// SHA-1 digest (40 hex chars)
    pub sha1: String,
    /// SHA-256 digest (64 hex chars)
    pub sha256: String,
}

/// A single download request
#[derive(Clone, Debug)]
pub struct DownloadTask {
    /// Source URL
    pub url: String,
    /// Final destination path
    pub dest_path: PathBuf,
    /// Expected digest for post-verification and cache lookup
    pub expected_hash: Option<FileHash>,
    /// Ordering hint within a fan-out batch
    pub priority: Priority,
}

impl DownloadTask {
    /// Create a task with normal priority and no expected hash
    pub fn new(url: impl Into<String>, dest_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest_path: dest_path.into(),
            expected_hash: None,
            priority: Priority::Normal,
        }
    }

    /// Attach an expected hash for verification and cache lookups
    #[must_use]
    pub fn with_hash(mut self, hash: FileHash) -> Self {
        self.expected_hash = Some(hash);
        self
    }

    /// Set the scheduling priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Outcome of a completed download
#[derive(Clone, Debug)]
pub struct DownloadResult {
    /// Where the file landed
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Digest of the delivered file, when computed
    pub hash: Option<FileHash>,
    /// Wall-clock time of the operation
    pub duration: Duration,
    /// True when the file was served from the content cache
    pub from_cache: bool,
}

/// A patch available on the CDN
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchInfo {
    /// Build the patch applies on top of (`0` for a full payload)
    pub from_build: u64,
    /// Build the patch produces
    pub to_build: u64,
    /// Download URL of the `.pwr` blob
    pub url: String,
    /// True iff `from_build == 0`
    pub is_full: bool,
}

impl PatchInfo {
    /// Create a patch descriptor; `is_full` is derived from `from_build`
    pub fn new(from_build: u64, to_build: u64, url: impl Into<String>) -> Self {
        Self {
            from_build,
            to_build,
            url: url.into(),
            is_full: from_build == 0,
        }
    }
}

/// Installed-build record for one channel
///
/// `build == 0` means "no installation". One record per channel,
/// persisted in `gameVersion.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Installed build number (0 = not installed)
    pub build: u64,
    /// The channel this record belongs to
    pub channel: Channel,
    /// When the build was first installed
    pub installed_at: DateTime<Utc>,
    /// When the last binary patch was applied, if ever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patched_at: Option<DateTime<Utc>>,
}

impl BuildRecord {
    /// Record for a channel with nothing installed
    pub fn empty(channel: Channel) -> Self {
        Self {
            build: 0,
            channel,
            installed_at: Utc::now(),
            patched_at: None,
        }
    }

    /// True when no build is installed
    pub fn is_installed(&self) -> bool {
        self.build > 0
    }
}

/// Snapshot of download service counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Downloads currently in flight
    pub active: u64,
    /// Downloads completed successfully
    pub completed: u64,
    /// Downloads that failed
    pub failed: u64,
    /// Total bytes fetched from the network
    pub bytes_downloaded: u64,
    /// Requests satisfied from the content cache
    pub cache_hits: u64,
    /// Requests that had to hit the network
    pub cache_misses: u64,
}

/// Result of a missing-file sweep
///
/// Returned by [`crate::DownloadService::download_missing`]: files whose
/// on-disk content already matched their expected hash are skipped.
#[derive(Clone, Debug, Default)]
pub struct MissingSweep {
    /// Files that were fetched because verification failed
    pub downloaded: Vec<PathBuf>,
    /// Files that already matched their expected hash
    pub skipped: Vec<PathBuf>,
    /// Files that could not be fetched, with the failure message
    pub failed: Vec<(PathBuf, String)>,
}

/// Outcome of a binary patch operation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchReport {
    /// Number of byte-level replacements performed
    pub replacements: u64,
    /// Number of files whose content changed (archive entries count individually)
    pub files_modified: u64,
}

/// Format a byte count as a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// Format a transfer speed as a human-readable string
pub fn format_speed(bps: u64) -> String {
    format!("{}/s", format_bytes(bps))
}
