//! Configuration types for hytale-content

use crate::error::{Error, Result};
use crate::types::Channel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Network behavior configuration (bandwidth, concurrency)
///
/// Groups settings related to how bytes move over the wire.
/// Used as a nested sub-config within [`EngineConfig`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Bandwidth cap in bytes per second (None or 0 = unlimited)
    ///
    /// `0` doubles as "no limit configured" and "throttling disabled";
    /// the two states are deliberately the same.
    #[serde(default)]
    pub max_download_speed_bps: Option<u64>,

    /// Maximum concurrent downloads in a fan-out, clamped to `[1, 10]` (default: 3)
    #[serde(default = "default_max_parallel")]
    pub max_parallel_downloads: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_download_speed_bps: None,
            max_parallel_downloads: default_max_parallel(),
        }
    }
}

/// Content cache configuration
///
/// Used as a nested sub-config within [`EngineConfig`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total cache budget in bytes (default: 10 GiB)
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,

    /// Entries older than this are pruned on startup (default: 30 days)
    #[serde(default = "default_cache_max_age", with = "duration_secs")]
    pub max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_cache_max_bytes(),
            max_age: default_cache_max_age(),
        }
    }
}

/// Retry configuration for transient network failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of retries after the initial attempt (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 500ms)
    #[serde(default = "default_initial_delay", with = "duration_millis")]
    pub initial_delay: Duration,

    /// Upper bound on any single retry delay (default: 30s)
    #[serde(default = "default_max_delay", with = "duration_millis")]
    pub max_delay: Duration,

    /// Add random jitter to delays to avoid thundering herd (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            jitter: default_true(),
        }
    }
}

/// CDN endpoint configuration
///
/// Used as a nested sub-config within [`EngineConfig`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CdnConfig {
    /// Root of the patch URL tree (default: the Hytale patch host)
    #[serde(default = "default_cdn_base")]
    pub base_url: String,

    /// Upper bound of the latest-base binary search (default: 100)
    #[serde(default = "default_max_search")]
    pub max_search: u64,

    /// Per-probe timeout (default: 8s)
    #[serde(default = "default_probe_timeout", with = "duration_secs")]
    pub probe_timeout: Duration,
}

impl Default for CdnConfig {
    fn default() -> Self {
        Self {
            base_url: default_cdn_base(),
            max_search: default_max_search(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

/// External differential-patch tool configuration
///
/// Used as a nested sub-config within [`EngineConfig`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Explicit path to the tool binary (skips provisioning when set)
    #[serde(default)]
    pub tool_path: Option<PathBuf>,

    /// Archive URL the tool is provisioned from when absent under `tools/`
    #[serde(default)]
    pub download_url: Option<String>,

    /// Whether to search PATH for the tool binary as a fallback (default: false)
    #[serde(default)]
    pub search_path: bool,
}

/// Main configuration for the content engine
///
/// Fields are organized into logical sub-configs:
/// - [`network`](NetworkConfig) — bandwidth cap and fan-out width
/// - [`cache`](CacheConfig) — content cache budget and age limit
/// - [`retry`](RetryConfig) — transient failure handling
/// - [`cdn`](CdnConfig) — patch tree endpoint and probe tuning
/// - [`tool`](ToolConfig) — external patch tool location/provisioning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Application root; all well-known paths derive from it
    pub root_dir: PathBuf,

    /// Network behavior settings
    #[serde(flatten)]
    pub network: NetworkConfig,

    /// Content cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// CDN endpoint settings
    #[serde(default)]
    pub cdn: CdnConfig,

    /// External patch tool settings
    #[serde(default)]
    pub tool: ToolConfig,
}

impl EngineConfig {
    /// Configuration rooted at the given application directory, all defaults otherwise
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            network: NetworkConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            cdn: CdnConfig::default(),
            tool: ToolConfig::default(),
        }
    }

    /// Validate cross-field constraints
    ///
    /// Returns a [`Error::Config`] naming the offending key on failure.
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.network.max_parallel_downloads) {
            return Err(Error::Config {
                message: format!(
                    "max_parallel_downloads must be in [1, 10], got {}",
                    self.network.max_parallel_downloads
                ),
                key: Some("max_parallel_downloads".into()),
            });
        }
        if self.cdn.base_url.is_empty() {
            return Err(Error::Config {
                message: "cdn.base_url must not be empty".into(),
                key: Some("cdn.base_url".into()),
            });
        }
        if self.cdn.max_search == 0 {
            return Err(Error::Config {
                message: "cdn.max_search must be at least 1".into(),
                key: Some("cdn.max_search".into()),
            });
        }
        Ok(())
    }
}

/// One release entry in the shipped `config.json`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReleaseEntry {
    /// Display version string
    pub version: String,
    /// Payload location: an HTTP(S) URL, a `file://` URL, or a path
    /// relative to the config file
    #[serde(default)]
    pub url: Option<String>,
    /// Release notes
    #[serde(default)]
    pub notes: Option<String>,
    /// Whether the update is mandatory
    #[serde(default)]
    pub mandatory: bool,
}

/// The shipped `config.json` document
///
/// When a channel's entry carries an HTTP(S) URL, the orchestrator treats
/// it as a local-archive override source; a plain path or `file://` URL
/// is used directly.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Launcher self-update entry
    #[serde(default)]
    pub launcher: Option<ReleaseEntry>,
    /// Per-channel game entries
    #[serde(default)]
    pub hytale: HashMap<Channel, ReleaseEntry>,
}

impl RemoteConfig {
    /// Parse a `config.json` document from disk; missing file yields defaults
    pub fn load(path: &std::path::Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

fn default_max_parallel() -> usize {
    3
}

fn default_cache_max_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_cache_max_age() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_cdn_base() -> String {
    "https://game-patches.hytale.com/patches".to_string()
}

fn default_max_search() -> u64 {
    100
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(8)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
