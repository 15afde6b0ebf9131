//! Install and update orchestration
//!
//! Owns the lifecycle of a channel's installed build: deciding between a
//! fresh install, incremental patches and a rescue (full redownload),
//! invoking the external differential tool, and keeping the build record
//! in sync with what is actually on disk.
//!
//! On-disk ground truth wins: a recorded build whose executable is gone
//! is demoted to "not installed", and game files present without a record
//! are synchronized by assuming the CDN's current latest base (a stale
//! tree is recovered by the rescue path on the next failing increment).

use crate::config::{RemoteConfig, ToolConfig};
use crate::error::{Error, PatchError, Result};
use crate::extract;
use crate::patch_tool::{self, CliPatchTool, PatchTool};
use crate::paths::PathResolver;
use crate::probe::VersionProbe;
use crate::service::DownloadService;
use crate::state::StateStore;
use crate::types::{BuildRecord, Channel, DownloadTask, PatchInfo, ProgressEvent, Stage};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// Delete attempts for a locked game directory during repair
const REPAIR_ATTEMPTS: u32 = 3;
const REPAIR_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Resolved local-archive override source for a channel
#[derive(Clone, Debug, PartialEq, Eq)]
enum OverrideSource {
    /// Download the archive from an HTTP(S) URL
    Http(String),
    /// Use an archive already on disk
    File(PathBuf),
}

/// Install/update decision engine for all channels
///
/// Cloning is cheap; clones share state. Two concurrent invocations for
/// the same channel are serialized; different channels may progress
/// concurrently.
#[derive(Clone)]
pub struct PatchOrchestrator {
    service: DownloadService,
    probe: VersionProbe,
    state: StateStore,
    paths: PathResolver,
    remote: RemoteConfig,
    tool_config: ToolConfig,
    /// Lazily provisioned patch tool (or an injected implementation)
    tool: Arc<Mutex<Option<Arc<dyn PatchTool>>>>,
    channel_locks: Arc<Mutex<HashMap<Channel, Arc<Mutex<()>>>>>,
    event_tx: broadcast::Sender<ProgressEvent>,
}

impl PatchOrchestrator {
    /// Create an orchestrator over the given collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service: DownloadService,
        probe: VersionProbe,
        state: StateStore,
        paths: PathResolver,
        remote: RemoteConfig,
        tool_config: ToolConfig,
        event_tx: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            service,
            probe,
            state,
            paths,
            remote,
            tool_config,
            tool: Arc::new(Mutex::new(None)),
            channel_locks: Arc::new(Mutex::new(HashMap::new())),
            event_tx,
        }
    }

    /// Inject a patch tool implementation, bypassing provisioning
    pub async fn set_patch_tool(&self, tool: Arc<dyn PatchTool>) {
        *self.tool.lock().await = Some(tool);
    }

    /// Bring a channel to the newest available build
    ///
    /// Runs the full decision chain: local-archive override, fresh
    /// install when nothing is installed, then incremental patches until
    /// the CDN has no successor build. Serialized per channel.
    pub async fn install_or_update(&self, channel: Channel) -> Result<()> {
        let lock = self.channel_lock(channel).await;
        let _guard = lock.lock().await;

        info!(channel = %channel, "install_or_update starting");
        self.emit(Stage::Checking, 0.0, format!("checking {channel} installation"));

        self.sync_with_disk(channel).await?;

        // Step 1: a configured or dropped-in archive overrides the CDN
        if !self.state.build_record(channel).await.is_installed() {
            if let Some(source) = self.resolve_local_override(channel) {
                info!(channel = %channel, ?source, "installing from local-archive override");
                if self.install_from_override(channel, source).await? {
                    if !self.record_latest_base(channel).await? {
                        // Override installed a playable game but the CDN has
                        // no builds to reconcile against; nothing more to do
                        self.emit(Stage::Complete, 100.0, "installation complete");
                        return Ok(());
                    }
                } else {
                    warn!(channel = %channel, "local archive yielded no game, falling back to CDN");
                }
            }
        }

        // Step 2: fresh install when nothing (valid) is installed
        let mut current = self.state.build_record(channel).await.build;
        if current == 0 {
            current = self.fresh_install(channel).await?;
        }

        // Step 3: walk incremental patches until the CDN runs out
        loop {
            let Some(patch) = self.probe.find_next_patch(channel, current).await? else {
                break;
            };
            self.apply_or_rescue(channel, &patch).await?;
            self.record_build(channel, patch.to_build).await?;
            current = patch.to_build;
        }

        self.emit(Stage::Complete, 100.0, format!("{channel} is up to date"));
        info!(channel = %channel, build = current, "install_or_update finished");
        Ok(())
    }

    /// Delete the channel's game directory so the next update reinstalls
    ///
    /// Retries the removal to tolerate transient file locks right after a
    /// game process exit.
    pub async fn repair(&self, channel: Channel) -> Result<()> {
        let lock = self.channel_lock(channel).await;
        let _guard = lock.lock().await;

        let game_dir = self.paths.game_dir(channel);
        info!(channel = %channel, dir = %game_dir.display(), "repairing installation");

        let mut last_error: Option<std::io::Error> = None;
        for attempt in 1..=REPAIR_ATTEMPTS {
            match tokio::fs::remove_dir_all(&game_dir).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "failed to remove game directory");
                    last_error = Some(e);
                    if attempt < REPAIR_ATTEMPTS {
                        tokio::time::sleep(REPAIR_RETRY_DELAY).await;
                    }
                }
            }
        }
        if let Some(e) = last_error {
            return Err(e.into());
        }

        self.state.reset_build(channel).await?;
        self.emit(Stage::Complete, 100.0, format!("{channel} repaired"));
        Ok(())
    }

    /// Reconcile the recorded build with what is on disk
    async fn sync_with_disk(&self, channel: Channel) -> Result<()> {
        let record = self.state.build_record(channel).await;
        let executable = self.paths.game_executable(channel);

        if record.is_installed() && !executable.exists() {
            // Files are gone; the record lies. Force a fresh install.
            warn!(
                channel = %channel,
                recorded_build = record.build,
                "executable missing, demoting to fresh install"
            );
            self.state.reset_build(channel).await?;
        } else if !record.is_installed() && executable.exists() {
            // Files exist with no record: assume the CDN's latest base.
            // If that guess is newer than the real tree, a failing
            // increment lands in rescue which re-downloads in full.
            self.emit(Stage::Syncing, 0.0, "synchronizing version record");
            self.record_latest_base(channel).await?;
        }
        Ok(())
    }

    /// Perform a full install via the `0 -> N` payload
    async fn fresh_install(&self, channel: Channel) -> Result<u64> {
        let Some(patch) = self.probe.find_latest_base(channel).await? else {
            return Err(Error::Patch(PatchError::NoBuildsAvailable {
                channel: channel.to_string(),
            }));
        };

        info!(channel = %channel, build = patch.to_build, "fresh install");
        self.apply_patch(channel, &patch).await?;
        self.record_build(channel, patch.to_build).await?;
        Ok(patch.to_build)
    }

    /// Apply an incremental patch, rescuing with a full payload on failure
    ///
    /// Rescue targets the same build via `0 -> to`; it is a last resort
    /// and is never itself rescued.
    async fn apply_or_rescue(&self, channel: Channel, patch: &PatchInfo) -> Result<()> {
        match self.apply_patch(channel, patch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(
                    channel = %channel,
                    from = patch.from_build,
                    to = patch.to_build,
                    error = %e,
                    "incremental patch failed, entering rescue mode"
                );
                self.emit(
                    Stage::RescueMode,
                    0.0,
                    format!("patch {}->{} failed, re-downloading build {}",
                        patch.from_build, patch.to_build, patch.to_build),
                );

                let rescue = PatchInfo::new(
                    0,
                    patch.to_build,
                    self.probe.patch_url(channel, 0, patch.to_build),
                );
                self.apply_patch(channel, &rescue).await
            }
        }
    }

    /// Download one `.pwr` blob and run the external tool over the game dir
    async fn apply_patch(&self, channel: Channel, patch: &PatchInfo) -> Result<()> {
        self.emit(
            Stage::Downloading,
            0.0,
            format!("downloading patch {}->{}", patch.from_build, patch.to_build),
        );

        // The tool validates its own payload, so no expected hash here
        let blob_path = self
            .service
            .cache()
            .staging_path(&format!("{}-{}.pwr", patch.from_build, patch.to_build));
        self.service
            .download_file(&DownloadTask::new(patch.url.clone(), blob_path.clone()))
            .await?;

        let game_dir = self.paths.game_dir(channel);
        tokio::fs::create_dir_all(&game_dir).await?;
        sweep_stale_files(&game_dir).await;

        let staging_dir = game_dir.join("staging-temp");
        tokio::fs::create_dir_all(&staging_dir).await?;

        self.emit(
            Stage::Patching,
            0.0,
            format!("applying patch {}->{}", patch.from_build, patch.to_build),
        );

        let tool = self.patch_tool().await?;
        let applied = tool.apply(&blob_path, &game_dir, &staging_dir).await;

        // The blob and the staging directory go away no matter what
        tokio::fs::remove_file(&blob_path).await.ok();
        tokio::fs::remove_dir_all(&staging_dir).await.ok();

        applied.map_err(|e| {
            Error::Patch(PatchError::ApplyFailed {
                from_build: patch.from_build,
                to_build: patch.to_build,
                stderr: e.to_string(),
            })
        })?;

        restore_executable_bit(&self.paths.game_executable(channel)).await;
        Ok(())
    }

    /// Install from a local-archive override source
    ///
    /// Returns true when the extraction produced a playable game.
    async fn install_from_override(
        &self,
        channel: Channel,
        source: OverrideSource,
    ) -> Result<bool> {
        let archive_path = match source {
            OverrideSource::Http(url) => {
                self.emit(Stage::Downloading, 0.0, "downloading game archive");
                let dest = self.paths.temp_dir().join("local-override.zip");
                self.service
                    .download_file(&DownloadTask::new(url, dest.clone()))
                    .await?;
                dest
            }
            OverrideSource::File(path) => path,
        };

        let game_dir = self.paths.game_dir(channel);
        tokio::fs::create_dir_all(&game_dir).await?;

        self.emit(Stage::Extracting, 0.0, "extracting game archive");
        extract::extract_zip(&archive_path, &game_dir).await?;

        let installed = self.paths.game_executable(channel).exists();
        if installed {
            restore_executable_bit(&self.paths.game_executable(channel)).await;
        }
        Ok(installed)
    }

    /// Resolve the override source by documented precedence:
    /// config HTTP(S) URL, then config file path, then the newest ZIP
    /// under `<app>/cdn`
    fn resolve_local_override(&self, channel: Channel) -> Option<OverrideSource> {
        if let Some(entry) = self.remote.hytale.get(&channel) {
            if let Some(raw) = &entry.url {
                match url::Url::parse(raw) {
                    Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                        return Some(OverrideSource::Http(raw.clone()));
                    }
                    Ok(parsed) if parsed.scheme() == "file" => {
                        return Some(OverrideSource::File(PathBuf::from(parsed.path())));
                    }
                    _ => {}
                }
                let path = PathBuf::from(raw);
                let path = if path.is_absolute() {
                    path
                } else {
                    // Relative paths resolve against the app root, where
                    // config.json ships
                    self.paths.root().join(path)
                };
                return Some(OverrideSource::File(path));
            }
        }

        self.paths
            .local_override_archive(self.paths.root())
            .map(OverrideSource::File)
    }

    /// Record the CDN's latest base as installed; false when none exists
    async fn record_latest_base(&self, channel: Channel) -> Result<bool> {
        match self.probe.find_latest_base(channel).await? {
            Some(latest) => {
                self.record_build(channel, latest.to_build).await?;
                Ok(true)
            }
            None => {
                warn!(channel = %channel, "cannot synchronize: no builds on CDN");
                Ok(false)
            }
        }
    }

    async fn record_build(&self, channel: Channel, build: u64) -> Result<()> {
        let previous = self.state.build_record(channel).await;
        let record = BuildRecord {
            build,
            channel,
            installed_at: if previous.is_installed() {
                previous.installed_at
            } else {
                chrono::Utc::now()
            },
            patched_at: previous.is_installed().then(chrono::Utc::now),
        };
        self.state.set_build_record(record).await
    }

    /// The patch tool, provisioning the CLI binary on first use
    async fn patch_tool(&self) -> Result<Arc<dyn PatchTool>> {
        let mut slot = self.tool.lock().await;
        if let Some(tool) = slot.as_ref() {
            return Ok(tool.clone());
        }

        let binary =
            patch_tool::ensure_tool(&self.tool_config, &self.paths.tools_dir(), &self.service)
                .await?;
        let tool: Arc<dyn PatchTool> = Arc::new(CliPatchTool::new(binary));
        *slot = Some(tool.clone());
        Ok(tool)
    }

    async fn channel_lock(&self, channel: Channel) -> Arc<Mutex<()>> {
        let mut locks = self.channel_locks.lock().await;
        locks
            .entry(channel)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn emit(&self, stage: Stage, percent: f32, message: impl Into<String>) {
        self.event_tx
            .send(ProgressEvent {
                stage,
                percent,
                message: message.into(),
                current_file: None,
                speed_bps: None,
                eta_s: None,
            })
            .ok();
    }
}

/// Remove leftover temp files from an interrupted patch run
async fn sweep_stale_files(game_dir: &std::path::Path) {
    let Ok(mut entries) = tokio::fs::read_dir(game_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".tmp") || name.starts_with("sf-") {
            debug!(file = %name, "sweeping stale patch leftover");
            tokio::fs::remove_file(entry.path()).await.ok();
        }
    }
}

/// The tool does not always preserve the executable bit
async fn restore_executable_bit(path: &std::path::Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if path.exists() {
            let perms = std::fs::Permissions::from_mode(0o755);
            tokio::fs::set_permissions(path, perms).await.ok();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}
