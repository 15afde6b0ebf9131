//! Error types for hytale-content
//!
//! This module provides comprehensive error handling for the library, including:
//! - Domain-specific error types (Download, Patch, State)
//! - Structured failure reports with machine-readable error codes
//! - Context information (URL, file path, build numbers, etc.)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for hytale-content operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for hytale-content
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_parallel_downloads")
        key: Option<String>,
    },

    /// Download-related error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Patch application or binary patching error
    #[error("patch error: {0}")]
    Patch(#[from] PatchError),

    /// Durable state (settings / build record) error
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// External tool execution failed (differential patch tool)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Download-related errors
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Server responded with a non-success HTTP status
    #[error("HTTP {status} for {url}")]
    HttpStatus {
        /// The HTTP status code returned by the server
        status: u16,
        /// The URL that produced the status
        url: String,
    },

    /// Fewer bytes arrived than the server advertised
    #[error("incomplete download for {url}: got {received} of {expected} bytes")]
    Incomplete {
        /// The URL being downloaded
        url: String,
        /// Bytes actually received
        received: u64,
        /// Bytes advertised via Content-Length
        expected: u64,
    },

    /// Downloaded file failed hash verification
    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        /// The file that failed verification (already deleted)
        path: PathBuf,
        /// The expected SHA-256 digest
        expected: String,
        /// The digest actually computed
        actual: String,
    },

    /// The download failed for a reason that is not retryable
    #[error("download failed for {url}: {reason}")]
    Failed {
        /// The URL that failed
        url: String,
        /// Why the download failed
        reason: String,
    },
}

/// Patch orchestration and binary patching errors
#[derive(Debug, Error)]
pub enum PatchError {
    /// The external differential tool exited non-zero
    #[error("patch tool failed applying {from_build}->{to_build}: {stderr}")]
    ApplyFailed {
        /// Source build of the failed patch
        from_build: u64,
        /// Target build of the failed patch
        to_build: u64,
        /// Diagnostics captured from the tool's stderr
        stderr: String,
    },

    /// The external tool binary could not be provisioned
    #[error("patch tool unavailable: {0}")]
    ToolUnavailable(String),

    /// No installable build was found on the CDN
    #[error("no builds available for channel {channel}")]
    NoBuildsAvailable {
        /// The channel that was probed
        channel: String,
    },

    /// A replacement rule is malformed (encoded lengths differ)
    #[error("invalid replacement rule: {0}")]
    InvalidRule(String),

    /// The binary patch target could not be processed
    #[error("binary patch failed for {path}: {reason}")]
    BinaryPatchFailed {
        /// The file being patched
        path: PathBuf,
        /// Why patching failed
        reason: String,
    },
}

/// Durable state errors (settings file, build records)
#[derive(Debug, Error)]
pub enum StateError {
    /// The persisted file could not be parsed
    #[error("corrupt state file {path}: {reason}")]
    Corrupt {
        /// The state file that failed to parse
        path: PathBuf,
        /// Parse failure detail
        reason: String,
    },

    /// A schema migration step failed
    #[error("migration from version {from} failed: {reason}")]
    MigrationFailed {
        /// The schema version being migrated from
        from: u32,
        /// Why the migration failed
        reason: String,
    },

    /// The file carries a schema version newer than this build understands
    #[error("state file {path} has unsupported schema version {version}")]
    UnsupportedVersion {
        /// The state file with the future schema
        path: PathBuf,
        /// The version found in the file
        version: u32,
    },

    /// Validation of loaded state failed
    #[error("invalid state: {0}")]
    Validation(String),
}

/// Structured failure report surfaced to launcher collaborators
///
/// Every error that escapes the engine can be rendered into this shape:
/// a machine-readable code, a human-readable message, and an optional
/// context map with the details a UI layer may want to display.
///
/// # Example JSON
///
/// ```json
/// {
///   "code": "hash_mismatch",
///   "message": "hash mismatch for game.pwr: expected ab12.., got cd34..",
///   "context": { "path": "game.pwr" }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    /// Machine-readable error code (e.g., "hash_mismatch", "patch_apply_failed")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl Error {
    /// Get the machine-readable error code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Download(e) => match e {
                DownloadError::HttpStatus { .. } => "http_status",
                DownloadError::Incomplete { .. } => "incomplete_download",
                DownloadError::HashMismatch { .. } => "hash_mismatch",
                DownloadError::Failed { .. } => "download_failed",
            },
            Error::Patch(e) => match e {
                PatchError::ApplyFailed { .. } => "patch_apply_failed",
                PatchError::ToolUnavailable(_) => "tool_unavailable",
                PatchError::NoBuildsAvailable { .. } => "no_builds_available",
                PatchError::InvalidRule(_) => "invalid_rule",
                PatchError::BinaryPatchFailed { .. } => "binary_patch_failed",
            },
            Error::State(e) => match e {
                StateError::Corrupt { .. } => "config_corrupt",
                StateError::MigrationFailed { .. } => "migration_failed",
                StateError::UnsupportedVersion { .. } => "unsupported_version",
                StateError::Validation(_) => "invalid_state",
            },
            Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => "permission",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_transport",
            Error::Serialization(_) => "serialization_error",
            Error::ExternalTool(_) => "external_tool_error",
            Error::Cancelled => "cancelled",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<&Error> for FailureReport {
    fn from(error: &Error) -> Self {
        let code = error.code().to_string();
        let message = error.to_string();

        let context = match error {
            Error::Download(DownloadError::HttpStatus { status, url }) => {
                Some(serde_json::json!({ "status": status, "url": url }))
            }
            Error::Download(DownloadError::Incomplete {
                url,
                received,
                expected,
            }) => Some(serde_json::json!({
                "url": url,
                "received_bytes": received,
                "expected_bytes": expected,
            })),
            Error::Download(DownloadError::HashMismatch { path, .. }) => {
                Some(serde_json::json!({ "path": path }))
            }
            Error::Patch(PatchError::ApplyFailed {
                from_build,
                to_build,
                ..
            }) => Some(serde_json::json!({
                "from_build": from_build,
                "to_build": to_build,
            })),
            Error::Patch(PatchError::NoBuildsAvailable { channel }) => {
                Some(serde_json::json!({ "channel": channel }))
            }
            Error::State(StateError::UnsupportedVersion { path, version }) => {
                Some(serde_json::json!({ "path": path, "version": version }))
            }
            Error::Config { key: Some(key), .. } => Some(serde_json::json!({ "key": key })),
            _ => None,
        };

        FailureReport {
            code,
            message,
            context,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Error codes: every variant maps to a stable machine-readable code
    // -----------------------------------------------------------------------

    fn all_error_variants() -> Vec<(Error, &'static str)> {
        vec![
            (
                Error::Config {
                    message: "bad value".into(),
                    key: Some("max_parallel_downloads".into()),
                },
                "config_error",
            ),
            (
                Error::Download(DownloadError::HttpStatus {
                    status: 404,
                    url: "http://cdn/0/1.pwr".into(),
                }),
                "http_status",
            ),
            (
                Error::Download(DownloadError::Incomplete {
                    url: "http://cdn/0/1.pwr".into(),
                    received: 100,
                    expected: 200,
                }),
                "incomplete_download",
            ),
            (
                Error::Download(DownloadError::HashMismatch {
                    path: PathBuf::from("/tmp/file"),
                    expected: "ab".into(),
                    actual: "cd".into(),
                }),
                "hash_mismatch",
            ),
            (
                Error::Download(DownloadError::Failed {
                    url: "http://cdn/x".into(),
                    reason: "gone".into(),
                }),
                "download_failed",
            ),
            (
                Error::Patch(PatchError::ApplyFailed {
                    from_build: 7,
                    to_build: 8,
                    stderr: "corrupt signature".into(),
                }),
                "patch_apply_failed",
            ),
            (
                Error::Patch(PatchError::ToolUnavailable("no download url".into())),
                "tool_unavailable",
            ),
            (
                Error::Patch(PatchError::NoBuildsAvailable {
                    channel: "latest".into(),
                }),
                "no_builds_available",
            ),
            (
                Error::Patch(PatchError::InvalidRule("length mismatch".into())),
                "invalid_rule",
            ),
            (
                Error::State(StateError::Corrupt {
                    path: PathBuf::from("user-settings.json"),
                    reason: "truncated".into(),
                }),
                "config_corrupt",
            ),
            (
                Error::State(StateError::MigrationFailed {
                    from: 1,
                    reason: "missing field".into(),
                }),
                "migration_failed",
            ),
            (
                Error::State(StateError::UnsupportedVersion {
                    path: PathBuf::from("user-settings.json"),
                    version: 99,
                }),
                "unsupported_version",
            ),
            (Error::Cancelled, "cancelled"),
            (
                Error::ExternalTool("spawn failed".into()),
                "external_tool_error",
            ),
            (Error::Other("unknown".into()), "internal_error"),
        ]
    }

    #[test]
    fn every_variant_maps_to_expected_code() {
        for (error, expected_code) in all_error_variants() {
            assert_eq!(error.code(), expected_code, "unexpected code for {error:?}");
        }
    }

    #[test]
    fn permission_denied_io_gets_dedicated_code() {
        let err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only disk",
        ));
        assert_eq!(err.code(), "permission");

        let other = Error::Io(std::io::Error::other("disk fail"));
        assert_eq!(other.code(), "io_error");
    }

    // -----------------------------------------------------------------------
    // FailureReport conversion preserves structured context
    // -----------------------------------------------------------------------

    #[test]
    fn report_from_http_status_has_status_and_url() {
        let err = Error::Download(DownloadError::HttpStatus {
            status: 503,
            url: "http://cdn/7/8.pwr".into(),
        });
        let report = FailureReport::from(&err);

        assert_eq!(report.code, "http_status");
        let ctx = report.context.expect("should have context");
        assert_eq!(ctx["status"], 503);
        assert_eq!(ctx["url"], "http://cdn/7/8.pwr");
    }

    #[test]
    fn report_from_apply_failed_has_build_numbers() {
        let err = Error::Patch(PatchError::ApplyFailed {
            from_build: 7,
            to_build: 8,
            stderr: "bad signature".into(),
        });
        let report = FailureReport::from(&err);

        assert_eq!(report.code, "patch_apply_failed");
        let ctx = report.context.expect("should have context");
        assert_eq!(ctx["from_build"], 7);
        assert_eq!(ctx["to_build"], 8);
    }

    #[test]
    fn report_from_incomplete_download_has_byte_counts() {
        let err = Error::Download(DownloadError::Incomplete {
            url: "http://cdn/0/9.pwr".into(),
            received: 41_943_040,
            expected: 104_857_600,
        });
        let report = FailureReport::from(&err);

        let ctx = report.context.expect("should have context");
        assert_eq!(ctx["received_bytes"], 41_943_040_u64);
        assert_eq!(ctx["expected_bytes"], 104_857_600_u64);
    }

    #[test]
    fn report_from_cancelled_has_no_context() {
        let report = FailureReport::from(&Error::Cancelled);
        assert_eq!(report.code, "cancelled");
        assert!(report.context.is_none());
    }

    #[test]
    fn report_message_matches_error_display() {
        let err = Error::Patch(PatchError::NoBuildsAvailable {
            channel: "beta".into(),
        });
        let display = err.to_string();
        let report = FailureReport::from(&err);
        assert_eq!(report.message, display);
    }

    #[test]
    fn report_without_context_omits_field_in_json() {
        let report = FailureReport::from(&Error::Cancelled);
        let json = serde_json::to_value(&report).unwrap();
        assert!(
            json.get("context").is_none(),
            "context field should be omitted from JSON when None"
        );
    }
}
