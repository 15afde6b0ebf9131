//! In-place binary string patching
//!
//! Rewrites literal byte sequences inside executables and archives
//! without changing file length. Two rule kinds exist:
//!
//! - **Simple** replaces every occurrence of a string with another of the
//!   same encoded length.
//! - **SmartDomain** handles domain-like strings where only the TLD
//!   differs in its final character (e.g. `x.com` -> `x.ws` embedded as
//!   `x.comX`): the stub before the last character is replaced and the
//!   single trailing unit rewritten, preserving length in one pass.
//!
//! Targets are backed up to `<path>.bak` before the first patch, and a
//! sidecar flag file records the applied rules so repeat invocations are
//! no-ops. ZIP/JAR targets are rewritten entry by entry.

use crate::error::{Error, PatchError, Result};
use crate::types::PatchReport;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Text encoding used to match and write rule strings
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    /// UTF-8 bytes
    Utf8,
    /// UTF-16 little-endian code units
    Utf16Le,
}

impl TextEncoding {
    fn encode(&self, s: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => s.as_bytes().to_vec(),
            TextEncoding::Utf16Le => s
                .encode_utf16()
                .flat_map(|unit| unit.to_le_bytes())
                .collect(),
        }
    }
}

/// One string replacement rule, applied in order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplacementRule {
    /// Replace `old` with `new`; both must share encoded length
    Simple {
        /// String to search for
        old: String,
        /// Replacement of the same encoded length
        new: String,
    },
    /// Domain-style replacement tolerating a different final character
    SmartDomain {
        /// Domain to search for (e.g. `hytale.com`)
        old: String,
        /// Replacement domain (e.g. `sanasol.ws`)
        new: String,
    },
}

impl ReplacementRule {
    /// Validate the encoded-length constraints for this rule
    fn validate(&self, encoding: TextEncoding) -> Result<()> {
        match self {
            ReplacementRule::Simple { old, new } => {
                if old.is_empty() {
                    return Err(Error::Patch(PatchError::InvalidRule(
                        "simple rule with empty search string".into(),
                    )));
                }
                let old_len = encoding.encode(old).len();
                let new_len = encoding.encode(new).len();
                if old_len != new_len {
                    return Err(Error::Patch(PatchError::InvalidRule(format!(
                        "simple rule length mismatch: {old:?} encodes to {old_len} bytes, {new:?} to {new_len}"
                    ))));
                }
            }
            ReplacementRule::SmartDomain { old, new } => {
                let (old_stub, old_last) = split_last_char(old)?;
                let (new_stub, new_last) = split_last_char(new)?;
                let old_stub_len = encoding.encode(old_stub).len();
                let new_stub_len = encoding.encode(new_stub).len();
                if old_stub_len != new_stub_len {
                    return Err(Error::Patch(PatchError::InvalidRule(format!(
                        "smart-domain stub length mismatch: {old_stub:?} vs {new_stub:?}"
                    ))));
                }
                let old_last_len = encoding.encode(&old_last.to_string()).len();
                let new_last_len = encoding.encode(&new_last.to_string()).len();
                if old_last_len != new_last_len {
                    return Err(Error::Patch(PatchError::InvalidRule(
                        "smart-domain trailing characters encode to different lengths".into(),
                    )));
                }
            }
        }
        Ok(())
    }

    /// Apply this rule to a buffer in place, returning the replacement count
    fn apply(&self, buf: &mut [u8], encoding: TextEncoding) -> u64 {
        match self {
            ReplacementRule::Simple { old, new } => {
                overwrite_matches(buf, &encoding.encode(old), &encoding.encode(new))
            }
            ReplacementRule::SmartDomain { old, new } => {
                // validate() guarantees both strings are non-empty
                let Ok((old_stub, old_last)) = split_last_char(old) else {
                    return 0;
                };
                let Ok((new_stub, new_last)) = split_last_char(new) else {
                    return 0;
                };
                let old_stub = encoding.encode(old_stub);
                let new_stub = encoding.encode(new_stub);
                let old_last = encoding.encode(&old_last.to_string());
                let new_last = encoding.encode(&new_last.to_string());

                let mut count = 0u64;
                let mut pos = 0usize;
                while pos + old_stub.len() + old_last.len() <= buf.len() {
                    let stub_end = pos + old_stub.len();
                    if buf[pos..stub_end] == old_stub[..]
                        && buf[stub_end..stub_end + old_last.len()] == old_last[..]
                    {
                        buf[pos..stub_end].copy_from_slice(&new_stub);
                        buf[stub_end..stub_end + new_last.len()].copy_from_slice(&new_last);
                        count += 1;
                    }
                    pos += 1;
                }
                count
            }
        }
    }
}

/// Replace every occurrence of `old` with `new` (same length), scanning
/// left to right and advancing one position after each match so
/// overlapping candidates are considered
fn overwrite_matches(buf: &mut [u8], old: &[u8], new: &[u8]) -> u64 {
    debug_assert_eq!(old.len(), new.len());
    if old.is_empty() || buf.len() < old.len() {
        return 0;
    }
    let mut count = 0u64;
    let mut pos = 0usize;
    while pos + old.len() <= buf.len() {
        if &buf[pos..pos + old.len()] == old {
            buf[pos..pos + old.len()].copy_from_slice(new);
            count += 1;
        }
        pos += 1;
    }
    count
}

fn split_last_char(s: &str) -> Result<(&str, char)> {
    let last = s.chars().next_back().ok_or_else(|| {
        Error::Patch(PatchError::InvalidRule(
            "smart-domain rule with empty string".into(),
        ))
    })?;
    Ok((&s[..s.len() - last.len_utf8()], last))
}

/// Archive entry name suffixes eligible for patching
const ARCHIVE_ENTRY_SUFFIXES: [&str; 5] = [".class", ".properties", ".json", ".xml", ".yml"];

/// Sidecar flag persisted after a successful patch
#[derive(Clone, Debug, Serialize, Deserialize)]
struct PatchFlag {
    /// When the patch was applied
    patched_at: chrono::DateTime<chrono::Utc>,
    /// The file the flag belongs to
    target: PathBuf,
    /// Digest of the rule set and encoding that were applied
    rules_digest: String,
}

/// In-place binary patcher for executables and archive payloads
#[derive(Clone, Debug, Default)]
pub struct BinaryPatcher;

impl BinaryPatcher {
    /// Apply `rules` to the file at `path`
    ///
    /// Idempotent: when the sidecar flag already records this rule set the
    /// call returns `replacements = 0` without touching the file. A clean
    /// base is guaranteed by restoring `<path>.bak` when one exists and
    /// creating it otherwise.
    pub async fn patch(
        &self,
        path: &Path,
        rules: &[ReplacementRule],
        encoding: TextEncoding,
    ) -> Result<PatchReport> {
        for rule in rules {
            rule.validate(encoding)?;
        }

        let path = path.to_path_buf();
        let rules = rules.to_vec();
        tokio::task::spawn_blocking(move || patch_sync(&path, &rules, encoding))
            .await
            .map_err(|e| std::io::Error::other(format!("patch task panicked: {e}")))?
    }
}

fn patch_sync(
    path: &Path,
    rules: &[ReplacementRule],
    encoding: TextEncoding,
) -> Result<PatchReport> {
    let is_archive = path
        .extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            ext == "zip" || ext == "jar"
        })
        .unwrap_or(false);

    let flag_path = flag_path_for(path, is_archive);
    let digest = rules_digest(rules, encoding);

    if let Some(flag) = read_flag(&flag_path) {
        if flag.rules_digest == digest {
            debug!(path = %path.display(), "already patched with this rule set");
            return Ok(PatchReport::default());
        }
    }

    let backup_path = backup_path_for(path);
    if backup_path.exists() {
        // A previous patch ran with different rules; restore the clean base
        std::fs::copy(&backup_path, path)?;
    } else {
        std::fs::copy(path, &backup_path)?;
    }

    let report = if is_archive {
        patch_archive(path, rules, encoding)?
    } else {
        patch_flat(path, rules, encoding)?
    };

    let flag = PatchFlag {
        patched_at: chrono::Utc::now(),
        target: path.to_path_buf(),
        rules_digest: digest,
    };
    std::fs::write(&flag_path, serde_json::to_vec_pretty(&flag)?)?;

    info!(
        path = %path.display(),
        replacements = report.replacements,
        files_modified = report.files_modified,
        "binary patch applied"
    );
    Ok(report)
}

/// Patch a flat binary file (executable or similar) in memory
fn patch_flat(path: &Path, rules: &[ReplacementRule], encoding: TextEncoding) -> Result<PatchReport> {
    let mut buf = std::fs::read(path)?;
    let original_len = buf.len();

    let mut replacements = 0u64;
    for rule in rules {
        replacements += rule.apply(&mut buf, encoding);
    }

    debug_assert_eq!(buf.len(), original_len, "patching must preserve length");

    if replacements > 0 {
        std::fs::write(path, &buf)?;
    }
    Ok(PatchReport {
        replacements,
        files_modified: u64::from(replacements > 0),
    })
}

/// Patch eligible entries of a ZIP/JAR archive, rewriting it in place
fn patch_archive(
    path: &Path,
    rules: &[ReplacementRule],
    encoding: TextEncoding,
) -> Result<PatchReport> {
    let raw = std::fs::read(path)?;
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(raw)).map_err(|e| {
        Error::Patch(PatchError::BinaryPatchFailed {
            path: path.to_path_buf(),
            reason: format!("failed to read archive: {e}"),
        })
    })?;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let mut replacements = 0u64;
    let mut files_modified = 0u64;

    for index in 0..archive.len() {
        let name = {
            let entry = archive.by_index(index).map_err(|e| {
                Error::Patch(PatchError::BinaryPatchFailed {
                    path: path.to_path_buf(),
                    reason: format!("failed to read entry {index}: {e}"),
                })
            })?;
            entry.name().to_string()
        };

        let eligible = ARCHIVE_ENTRY_SUFFIXES
            .iter()
            .any(|suffix| name.ends_with(suffix));

        if eligible {
            let mut data = Vec::new();
            archive
                .by_index(index)
                .map_err(|e| archive_error(path, &name, e.to_string()))?
                .read_to_end(&mut data)?;

            let mut entry_count = 0u64;
            for rule in rules {
                entry_count += rule.apply(&mut data, encoding);
            }

            if entry_count > 0 {
                replacements += entry_count;
                files_modified += 1;
                writer
                    .start_file(name.clone(), zip::write::FileOptions::default())
                    .map_err(|e| archive_error(path, &name, e.to_string()))?;
                writer.write_all(&data)?;
                continue;
            }
        }

        // Unchanged entries are copied over without recompression
        let entry = archive
            .by_index_raw(index)
            .map_err(|e| archive_error(path, &name, e.to_string()))?;
        writer
            .raw_copy_file(entry)
            .map_err(|e| archive_error(path, &name, e.to_string()))?;
    }

    let out = writer
        .finish()
        .map_err(|e| archive_error(path, "<central directory>", e.to_string()))?
        .into_inner();

    if files_modified > 0 {
        std::fs::write(path, out)?;
    }
    Ok(PatchReport {
        replacements,
        files_modified,
    })
}

fn archive_error(path: &Path, entry: &str, reason: String) -> Error {
    Error::Patch(PatchError::BinaryPatchFailed {
        path: path.to_path_buf(),
        reason: format!("entry {entry}: {reason}"),
    })
}

/// Flag sidecar location: `<path>.patched_custom` for flat targets,
/// `patched_server.json` next to archive targets
fn flag_path_for(path: &Path, is_archive: bool) -> PathBuf {
    if is_archive {
        path.parent()
            .unwrap_or_else(|| Path::new("."))
            .join("patched_server.json")
    } else {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".patched_custom");
        path.with_file_name(name)
    }
}

fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".bak");
    path.with_file_name(name)
}

fn read_flag(flag_path: &Path) -> Option<PatchFlag> {
    let raw = std::fs::read(flag_path).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Stable digest of a rule set and its encoding
fn rules_digest(rules: &[ReplacementRule], encoding: TextEncoding) -> String {
    let mut hasher = sha2::Sha256::new();
    if let Ok(serialized) = serde_json::to_vec(&(rules, encoding)) {
        hasher.update(&serialized);
    }
    hex::encode(hasher.finalize())
}
