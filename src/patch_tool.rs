//! External differential patch tool
//!
//! The engine consumes patches but never produces them: an opaque binary
//! transformer is invoked as
//! `tool apply --staging-dir=<staging> <patch_file> <game_dir>` with exit
//! code 0 on success and diagnostics on stderr. This module wraps that
//! contract behind a trait so orchestration code can be exercised without
//! the real binary, plus one-time provisioning of the tool under
//! `tools/`.

use crate::error::{Error, PatchError, Result};
use crate::extract;
use crate::service::DownloadService;
use crate::types::DownloadTask;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Captured tool output is truncated beyond this size
const OUTPUT_CAP: usize = 10 * 1024 * 1024;

/// Conventional name of the tool binary under `tools/`
pub fn tool_binary_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "butler.exe"
    } else {
        "butler"
    }
}

/// Abstraction over the differential patch applier
#[async_trait]
pub trait PatchTool: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> &str;

    /// Apply `patch_file` onto `game_dir` using `staging_dir` as scratch
    ///
    /// Implementations must return an error when the tool reports failure;
    /// the error message should carry the tool's diagnostics.
    async fn apply(&self, patch_file: &Path, game_dir: &Path, staging_dir: &Path) -> Result<()>;
}

/// [`PatchTool`] backed by the external CLI binary
pub struct CliPatchTool {
    binary: PathBuf,
}

impl CliPatchTool {
    /// Wrap an existing tool binary
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Discover the binary on PATH
    pub fn from_path() -> Option<Self> {
        which::which("butler").ok().map(Self::new)
    }
}

#[async_trait]
impl PatchTool for CliPatchTool {
    fn name(&self) -> &str {
        "cli"
    }

    async fn apply(&self, patch_file: &Path, game_dir: &Path, staging_dir: &Path) -> Result<()> {
        debug!(
            tool = %self.binary.display(),
            patch = %patch_file.display(),
            game_dir = %game_dir.display(),
            "invoking patch tool"
        );

        let output = tokio::process::Command::new(&self.binary)
            .arg("apply")
            .arg(format!("--staging-dir={}", staging_dir.display()))
            .arg(patch_file)
            .arg(game_dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::ExternalTool(format!("failed to spawn patch tool: {e}")))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = truncate_output(&output.stderr);
        let stdout = truncate_output(&output.stdout);
        let diagnostics = if stderr.trim().is_empty() {
            stdout
        } else {
            stderr
        };
        Err(Error::ExternalTool(format!(
            "patch tool exited with {}: {}",
            output.status,
            diagnostics.trim()
        )))
    }
}

fn truncate_output(raw: &[u8]) -> String {
    let slice = if raw.len() > OUTPUT_CAP {
        &raw[..OUTPUT_CAP]
    } else {
        raw
    };
    String::from_utf8_lossy(slice).into_owned()
}

/// Locate the tool binary, provisioning it when necessary
///
/// Resolution order: explicit configured path, existing binary under
/// `tools/`, PATH discovery (when enabled), then a one-time download of
/// the configured archive which is extracted into `tools/` and marked
/// executable on non-Windows platforms.
pub async fn ensure_tool(
    config: &crate::config::ToolConfig,
    tools_dir: &Path,
    service: &DownloadService,
) -> Result<PathBuf> {
    if let Some(explicit) = &config.tool_path {
        if explicit.exists() {
            return Ok(explicit.clone());
        }
        warn!(path = %explicit.display(), "configured tool path does not exist");
    }

    let installed = tools_dir.join(tool_binary_name());
    if installed.exists() {
        return Ok(installed);
    }

    if config.search_path {
        if let Ok(found) = which::which("butler") {
            debug!(path = %found.display(), "patch tool found on PATH");
            return Ok(found);
        }
    }

    let Some(url) = &config.download_url else {
        return Err(Error::Patch(PatchError::ToolUnavailable(
            "tool binary missing and no download URL configured".into(),
        )));
    };

    info!(url = %url, "provisioning patch tool");
    tokio::fs::create_dir_all(tools_dir).await?;

    let archive_path = tools_dir.join("butler-download.zip");
    service
        .download_file(&DownloadTask::new(url.clone(), archive_path.clone()))
        .await
        .map_err(|e| {
            Error::Patch(PatchError::ToolUnavailable(format!(
                "tool download failed: {e}"
            )))
        })?;

    extract::extract_zip(&archive_path, tools_dir).await?;
    tokio::fs::remove_file(&archive_path).await.ok();

    if !installed.exists() {
        return Err(Error::Patch(PatchError::ToolUnavailable(format!(
            "downloaded archive did not contain {}",
            tool_binary_name()
        ))));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        tokio::fs::set_permissions(&installed, perms).await?;
    }

    info!(path = %installed.display(), "patch tool provisioned");
    Ok(installed)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    async fn write_stub_tool(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("stub-tool.sh");
        tokio::fs::write(&path, format!("#!/bin/sh\n{script}\n"))
            .await
            .unwrap();
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .await
            .unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_tool_success_on_exit_zero() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub_tool(dir.path(), "exit 0").await;

        let tool = CliPatchTool::new(stub);
        tool.apply(
            &dir.path().join("patch.pwr"),
            &dir.path().join("game"),
            &dir.path().join("staging"),
        )
        .await
        .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_tool_surfaces_stderr_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub_tool(dir.path(), "echo 'signature invalid' >&2; exit 3").await;

        let tool = CliPatchTool::new(stub);
        let err = tool
            .apply(
                &dir.path().join("patch.pwr"),
                &dir.path().join("game"),
                &dir.path().join("staging"),
            )
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("signature invalid"), "got: {message}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_tool_receives_contract_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args.txt");
        let stub = write_stub_tool(
            dir.path(),
            &format!("echo \"$@\" > {}", args_file.display()),
        )
        .await;

        let tool = CliPatchTool::new(stub);
        tool.apply(
            Path::new("/tmp/7.pwr"),
            Path::new("/tmp/game"),
            Path::new("/tmp/staging"),
        )
        .await
        .unwrap();

        let args = tokio::fs::read_to_string(&args_file).await.unwrap();
        assert_eq!(
            args.trim(),
            "apply --staging-dir=/tmp/staging /tmp/7.pwr /tmp/game"
        );
    }

    #[tokio::test]
    async fn missing_binary_is_an_external_tool_error() {
        let tool = CliPatchTool::new("/nonexistent/butler-binary");
        let err = tool
            .apply(Path::new("/p"), Path::new("/g"), Path::new("/s"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExternalTool(_)));
    }

    #[test]
    fn output_truncation_caps_large_buffers() {
        let big = vec![b'x'; OUTPUT_CAP + 100];
        assert_eq!(truncate_output(&big).len(), OUTPUT_CAP);
        assert_eq!(truncate_output(b"short"), "short");
    }
}
