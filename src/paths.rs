//! Canonical on-disk locations
//!
//! Pure derivations from the application root. Nothing here performs I/O
//! beyond `stat`/`readdir` (used only by the local-override archive scan).

use crate::types::Channel;
use std::path::{Path, PathBuf};

/// Derives well-known paths from the application root
///
/// The layout under the root:
///
/// ```text
/// <root>/install/release/package/game/<channel>/   game files
/// <root>/install/release/package/jre/latest/       Java runtime
/// <root>/cache/                                    download cache + index
/// <root>/tools/                                    external patch tool
/// <root>/UserData/                                 launcher-owned profile data
/// <root>/user-settings.json                        settings
/// <root>/gameVersion.json                          build records
/// ```
#[derive(Clone, Debug)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// Resolver rooted at the given application directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The application root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Game directory for a channel
    pub fn game_dir(&self, channel: Channel) -> PathBuf {
        self.root
            .join("install")
            .join("release")
            .join("package")
            .join("game")
            .join(channel.as_str())
    }

    /// Bundled Java runtime directory
    pub fn jre_dir(&self) -> PathBuf {
        self.root
            .join("install")
            .join("release")
            .join("package")
            .join("jre")
            .join("latest")
    }

    /// Download cache directory
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// External tool directory
    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("tools")
    }

    /// Scratch directory for staged downloads and extractions
    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// Launcher-owned user profile directory
    pub fn user_data_dir(&self) -> PathBuf {
        self.root.join("UserData")
    }

    /// The settings file
    pub fn settings_file(&self) -> PathBuf {
        self.root.join("user-settings.json")
    }

    /// The per-channel build record file
    pub fn version_file(&self) -> PathBuf {
        self.root.join("gameVersion.json")
    }

    /// Conventional game client executable for a channel
    pub fn game_executable(&self, channel: Channel) -> PathBuf {
        let client = self.game_dir(channel).join("Client");
        if cfg!(target_os = "windows") {
            client.join("HytaleClient.exe")
        } else if cfg!(target_os = "macos") {
            client
                .join("Hytale.app")
                .join("Contents")
                .join("MacOS")
                .join("HytaleClient")
        } else {
            client.join("HytaleClient")
        }
    }

    /// Conventional server jar for a channel
    pub fn server_jar(&self, channel: Channel) -> PathBuf {
        self.game_dir(channel).join("Server").join("HytaleServer.jar")
    }

    /// Newest ZIP under `<app>/cdn`, if any
    ///
    /// This is the lowest-precedence local-archive override source; scan
    /// order is by file modification time, newest first.
    pub fn local_override_archive(&self, app_dir: &Path) -> Option<PathBuf> {
        let cdn_dir = app_dir.join("cdn");
        let entries = std::fs::read_dir(&cdn_dir).ok()?;

        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_zip = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("zip"))
                .unwrap_or(false);
            if !is_zip {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let mtime = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            match &newest {
                Some((best, _)) if *best >= mtime => {}
                _ => newest = Some((mtime, path)),
            }
        }
        newest.map(|(_, path)| path)
    }
}
