//! Durable launcher state
//!
//! Persists user settings (`user-settings.json`, schema-versioned) and
//! the per-channel installed-build map (`gameVersion.json`) as JSON.
//! Settings migrate forward through a chain of pure functions; files from
//! a newer schema refuse to load. Corrupt or invalid files fall back to
//! in-memory defaults so the launcher keeps working, and writes that hit
//! a read-only disk keep the in-memory state instead of failing.

use crate::error::{Error, Result, StateError};
use crate::types::{BuildRecord, Channel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Current settings schema version
pub const SETTINGS_VERSION: u32 = 2;

/// Launcher display language
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    /// Brazilian Portuguese
    #[serde(rename = "pt-BR")]
    PtBr,
    /// US English
    #[default]
    #[serde(rename = "en-US")]
    EnUs,
    /// Spanish
    #[serde(rename = "es-ES")]
    EsEs,
}

/// Launcher window size
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowBounds {
    /// Window width, at least 800
    pub width: u32,
    /// Window height, at least 600
    pub height: u32,
}

impl Default for WindowBounds {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// User settings, schema v2
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Schema version; enables forward migration
    #[serde(default = "default_version")]
    pub version: u32,

    /// Custom game directory override
    #[serde(default)]
    pub game_dir: Option<PathBuf>,

    /// Selected release channel
    #[serde(default)]
    pub game_channel: Channel,

    /// Launch with a user-provided Java runtime
    #[serde(default)]
    pub use_custom_java: bool,

    /// Path of the user-provided Java runtime
    #[serde(default)]
    pub custom_java_path: Option<PathBuf>,

    /// Display language
    #[serde(default)]
    pub language: Language,

    /// Launcher window size
    #[serde(default)]
    pub window_bounds: WindowBounds,

    /// Whether installed mods are loaded
    #[serde(default)]
    pub mods_enabled: bool,

    /// Bandwidth cap in bytes per second (absent or 0 = unlimited)
    #[serde(default)]
    pub max_download_speed_bps: Option<u64>,

    /// Fan-out width override, within `[1, 10]`
    #[serde(default)]
    pub max_parallel_downloads: Option<usize>,

    /// Whether anonymous usage analytics are sent
    #[serde(default = "default_true")]
    pub analytics_enabled: bool,

    /// Whether updates are applied automatically on launch
    #[serde(default = "default_true")]
    pub auto_update_enabled: bool,

    /// Hide the launcher window while the game runs
    #[serde(default)]
    pub hide_launcher: bool,

    /// Player account UUID, once known
    #[serde(default)]
    pub player_uuid: Option<String>,

    /// Display name, non-empty and at most 16 characters
    #[serde(default = "default_player_name")]
    pub player_name: String,

    /// First-run setup URL override
    #[serde(default)]
    pub setup_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            game_dir: None,
            game_channel: Channel::Latest,
            use_custom_java: false,
            custom_java_path: None,
            language: Language::default(),
            window_bounds: WindowBounds::default(),
            mods_enabled: false,
            max_download_speed_bps: None,
            max_parallel_downloads: None,
            analytics_enabled: true,
            auto_update_enabled: true,
            hide_launcher: false,
            player_uuid: None,
            player_name: default_player_name(),
            setup_url: None,
        }
    }
}

impl Settings {
    /// Validate value constraints of the latest schema
    pub fn validate(&self) -> Result<()> {
        if self.player_name.is_empty() || self.player_name.chars().count() > 16 {
            return Err(Error::State(StateError::Validation(format!(
                "player_name must be 1..=16 characters, got {:?}",
                self.player_name
            ))));
        }
        if self.window_bounds.width < 800 || self.window_bounds.height < 600 {
            return Err(Error::State(StateError::Validation(format!(
                "window_bounds must be at least 800x600, got {}x{}",
                self.window_bounds.width, self.window_bounds.height
            ))));
        }
        if let Some(parallel) = self.max_parallel_downloads {
            if !(1..=10).contains(&parallel) {
                return Err(Error::State(StateError::Validation(format!(
                    "max_parallel_downloads must be in [1, 10], got {parallel}"
                ))));
            }
        }
        Ok(())
    }
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_player_name() -> String {
    "Player".to_string()
}

/// Migrate a raw settings document one step, from schema v1 to v2
///
/// v1 stored the display name as `nickname` and predates the bandwidth
/// fields; those fields pick up defaults during deserialization.
fn migrate_v1_to_v2(mut doc: serde_json::Value) -> std::result::Result<serde_json::Value, String> {
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| "settings document is not an object".to_string())?;

    if let Some(nickname) = obj.remove("nickname") {
        obj.insert("player_name".to_string(), nickname);
    }
    obj.insert("version".to_string(), serde_json::json!(2));
    Ok(doc)
}

/// Apply the migration chain up to [`SETTINGS_VERSION`]
fn migrate_settings(mut doc: serde_json::Value, from: u32) -> Result<serde_json::Value> {
    let mut version = from;
    while version < SETTINGS_VERSION {
        doc = match version {
            1 => migrate_v1_to_v2(doc),
            other => Err(format!("no migration defined from version {other}")),
        }
        .map_err(|reason| Error::State(StateError::MigrationFailed { from: version, reason }))?;
        version += 1;
        debug!(version, "settings migrated");
    }
    Ok(doc)
}

/// Persisted settings and per-channel build records
///
/// Cloning is cheap; clones share state. All writes are atomic
/// (tmp + rename) and tolerate read-only disks by keeping the in-memory
/// state.
#[derive(Clone, Debug)]
pub struct StateStore {
    settings_path: PathBuf,
    version_path: PathBuf,
    settings: Arc<RwLock<Settings>>,
    builds: Arc<RwLock<HashMap<Channel, BuildRecord>>>,
}

impl StateStore {
    /// Load state from the two well-known files
    ///
    /// Missing files yield defaults in memory with a best-effort save.
    /// A settings file from a newer schema is refused; corrupt or invalid
    /// content falls back to defaults and logs.
    pub async fn load(settings_path: &Path, version_path: &Path) -> Result<Self> {
        let settings = Self::load_settings(settings_path).await?;
        let builds = Self::load_builds(version_path).await;

        let store = Self {
            settings_path: settings_path.to_path_buf(),
            version_path: version_path.to_path_buf(),
            settings: Arc::new(RwLock::new(settings)),
            builds: Arc::new(RwLock::new(builds)),
        };

        if !settings_path.exists() {
            store.persist_settings().await;
        }
        Ok(store)
    }

    async fn load_settings(path: &Path) -> Result<Settings> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no settings file, using defaults");
                return Ok(Settings::default());
            }
            Err(e) => return Err(e.into()),
        };

        let doc: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "settings corrupt, using defaults");
                return Ok(Settings::default());
            }
        };

        let version = doc
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1) as u32;

        // Forward-only: a newer schema cannot be downgraded safely
        if version > SETTINGS_VERSION {
            return Err(Error::State(StateError::UnsupportedVersion {
                path: path.to_path_buf(),
                version,
            }));
        }

        let migrated = migrate_settings(doc, version)?;
        let settings: Settings = match serde_json::from_value(migrated) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "settings invalid, using defaults");
                return Ok(Settings::default());
            }
        };

        match settings.validate() {
            Ok(()) => Ok(settings),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "settings failed validation, using defaults");
                Ok(Settings::default())
            }
        }
    }

    async fn load_builds(path: &Path) -> HashMap<Channel, BuildRecord> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(_) => return HashMap::new(),
        };

        // Current form: { "<channel>": BuildRecord }
        if let Ok(map) = serde_json::from_str::<HashMap<Channel, BuildRecord>>(&raw) {
            return map;
        }

        // Legacy form: one bare record; key it by its channel
        if let Ok(record) = serde_json::from_str::<BuildRecord>(&raw) {
            info!(channel = %record.channel, "migrating legacy single-record gameVersion.json");
            return HashMap::from([(record.channel, record)]);
        }

        warn!(path = %path.display(), "gameVersion.json corrupt, starting empty");
        HashMap::new()
    }

    /// Current settings snapshot
    pub async fn settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Replace the settings, validating before the write
    ///
    /// A permission error on disk keeps the new state in memory and
    /// continues; the launcher must not block on a read-only disk.
    pub async fn set_settings(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        *self.settings.write().await = settings;
        self.persist_settings().await;
        Ok(())
    }

    /// Build record for a channel, an empty record when none exists
    pub async fn build_record(&self, channel: Channel) -> BuildRecord {
        self.builds
            .read()
            .await
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| BuildRecord::empty(channel))
    }

    /// Record an installed build for its channel
    pub async fn set_build_record(&self, record: BuildRecord) -> Result<()> {
        {
            let mut builds = self.builds.write().await;
            builds.insert(record.channel, record);
        }
        self.persist_builds().await;
        Ok(())
    }

    /// Reset a channel's record to "not installed" (explicit repair)
    pub async fn reset_build(&self, channel: Channel) -> Result<()> {
        {
            let mut builds = self.builds.write().await;
            builds.insert(channel, BuildRecord::empty(channel));
        }
        self.persist_builds().await;
        Ok(())
    }

    async fn persist_settings(&self) {
        let settings = self.settings.read().await.clone();
        if let Err(e) = write_json_atomic(&self.settings_path, &settings).await {
            log_write_failure(&self.settings_path, &e);
        }
    }

    async fn persist_builds(&self) {
        let builds = self.builds.read().await.clone();
        if let Err(e) = write_json_atomic(&self.version_path, &builds).await {
            log_write_failure(&self.version_path, &e);
        }
    }
}

fn log_write_failure(path: &Path, error: &Error) {
    // Read-only disks are survivable: keep the in-memory state
    warn!(path = %path.display(), error = %error, "state write failed, keeping in-memory state");
}

/// Serialize to JSON and write atomically (tmp file + rename)
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, raw).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
