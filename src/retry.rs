//! Retry logic with exponential backoff
//!
//! This module provides configurable retry logic for transient failures.
//! It implements exponential backoff with optional jitter to prevent
//! thundering herd. Backoff sleeps are suspension points: they race the
//! caller's cancellation token, so a cancelled operation never sits out
//! a multi-second delay.
//!
//! # Example
//!
//! ```no_run
//! use hytale_content::retry::{retry_with_backoff, Cancellable, IsRetryable};
//! use hytale_content::config::RetryConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//!     Cancelled,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! impl Cancellable for MyError {
//!     fn cancelled() -> Self {
//!         MyError::Cancelled
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! let cancel = CancellationToken::new();
//! let value = retry_with_backoff(&config, &cancel, || async {
//!     Ok::<_, MyError>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{DownloadError, Error};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, connection reset, 5xx) should
/// return `true`. Permanent failures (hash mismatch, 4xx, corrupt state)
/// should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

/// Trait for errors that can represent a cancelled retry loop
///
/// [`retry_with_backoff`] returns this value when its cancellation token
/// fires during a backoff sleep or between attempts.
pub trait Cancellable {
    /// The error value representing cancellation
    fn cancelled() -> Self;
}

/// Case-insensitive substrings that mark a message as a transport fault
const TRANSPORT_MARKERS: [&str; 8] = [
    "connection reset",
    "connection refused",
    "timeout",
    "timed out",
    "network",
    "broken pipe",
    "unresolved",
    "dns",
];

/// Classify an arbitrary error message as a transport fault
fn message_is_transport(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    TRANSPORT_MARKERS.iter().any(|marker| msg.contains(marker))
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Transport faults are the canonical retryable class
            Error::Network(e) => {
                e.is_timeout() || e.is_connect() || message_is_transport(&e.to_string())
            }
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Download(e) => match e {
                // Server-side failures may clear up; client errors will not
                DownloadError::HttpStatus { status, .. } => *status >= 500,
                // Short reads usually mean the connection dropped mid-stream
                DownloadError::Incomplete { .. } => true,
                // Verification failure is final; the caller decides what next
                DownloadError::HashMismatch { .. } => false,
                DownloadError::Failed { .. } => false,
            },
            // Rescue handles patch failures at exactly one layer; never here
            Error::Patch(_) => false,
            Error::State(_) => false,
            Error::Config { .. } => false,
            Error::Serialization(_) => false,
            Error::ExternalTool(msg) => message_is_transport(msg),
            Error::Cancelled => false,
            Error::Other(msg) => message_is_transport(msg),
        }
    }
}

impl Cancellable for Error {
    fn cancelled() -> Self {
        Error::Cancelled
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// The delay before attempt `n` is `min(initial * 2^(n-1), max_delay)`,
/// optionally jittered. Returns the successful result, or the last error
/// once the error is non-retryable or attempts are exhausted.
///
/// Cancellation is observed between attempts and during backoff sleeps:
/// the sleep races `cancel.cancelled()` and the cancelled error value is
/// returned immediately instead of waiting out the delay.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + Cancellable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        if cancel.is_cancelled() {
            return Err(E::cancelled());
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "operation failed, retrying"
                );

                let jittered = if config.jitter { add_jitter(delay) } else { delay };
                tokio::select! {
                    () = tokio::time::sleep(jittered) => {}
                    () = cancel.cancelled() => {
                        tracing::info!("retry backoff cancelled");
                        return Err(E::cancelled());
                    }
                }

                delay = delay.saturating_mul(2).min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter between 0% and 100% of the delay
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + factor))
}
