//! Single-URL resumable HTTP download engine
//!
//! Fetches one URL to a destination path with range-based resume, a
//! `.part` sidecar, bandwidth throttling, progress events, cancellation
//! and hash post-verification. Retries wrap the whole fetch including
//! resume detection; hash mismatches are surfaced without retry so the
//! caller decides what to do.

use crate::bandwidth::BandwidthLimiter;
use crate::config::RetryConfig;
use crate::error::{DownloadError, Error, Result};
use crate::hasher;
use crate::retry::retry_with_backoff;
use crate::types::{DownloadResult, FileHash, ProgressEvent, Stage};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Minimum interval between progress events (~10 Hz)
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Options for a single fetch
#[derive(Clone, Debug)]
pub struct FetchOptions {
    /// Resume from an existing `.part` file when present
    pub resume: bool,
    /// Expected digest; verified after completion
    pub expected_hash: Option<FileHash>,
    /// Cancellation signal; aborts at the next chunk boundary
    pub cancel: CancellationToken,
    /// When true, cancellation also removes the `.part` file
    pub destructive_cancel: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            resume: true,
            expected_hash: None,
            cancel: CancellationToken::new(),
            destructive_cancel: false,
        }
    }
}

/// Resumable single-URL download engine
///
/// Cloning is cheap; clones share the HTTP connection pool and the
/// bandwidth limiter.
#[derive(Clone)]
pub struct DownloadEngine {
    client: reqwest::Client,
    limiter: BandwidthLimiter,
    retry: RetryConfig,
    event_tx: broadcast::Sender<ProgressEvent>,
}

impl DownloadEngine {
    /// Create an engine sharing the given limiter and event stream
    ///
    /// The HTTP client keeps connections alive with no socket cap and
    /// sets `TCP_NODELAY`.
    pub fn new(
        limiter: BandwidthLimiter,
        retry: RetryConfig,
        event_tx: broadcast::Sender<ProgressEvent>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .tcp_nodelay(true)
            .pool_max_idle_per_host(usize::MAX)
            .build()?;

        Ok(Self {
            client,
            limiter,
            retry,
            event_tx,
        })
    }

    /// Fetch `url` into `dest_path`
    ///
    /// The transfer streams into `<dest_path>.part` and is renamed into
    /// place only after the response body ends cleanly. See the module
    /// docs for the full guarantee set.
    pub async fn fetch(
        &self,
        url: &str,
        dest_path: &Path,
        options: &FetchOptions,
    ) -> Result<DownloadResult> {
        let started = Instant::now();

        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let size = retry_with_backoff(&self.retry, &options.cancel, || {
            self.fetch_once(url, dest_path, options)
        })
        .await?;

        // Post-verification is deliberately outside the retry loop: a hash
        // mismatch on intact transport will not fix itself
        let hash = match &options.expected_hash {
            Some(expected) => {
                let actual = hasher::hash_file(dest_path).await?;
                if actual.size != expected.size || actual.sha256 != expected.sha256 {
                    tokio::fs::remove_file(dest_path).await.ok();
                    return Err(Error::Download(DownloadError::HashMismatch {
                        path: dest_path.to_path_buf(),
                        expected: expected.sha256.clone(),
                        actual: actual.sha256,
                    }));
                }
                Some(actual)
            }
            None => None,
        };

        info!(
            url,
            dest = %dest_path.display(),
            size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "download complete"
        );

        Ok(DownloadResult {
            path: dest_path.to_path_buf(),
            size,
            hash,
            duration: started.elapsed(),
            from_cache: false,
        })
    }

    /// One fetch attempt; returns the final file size
    async fn fetch_once(&self, url: &str, dest_path: &Path, options: &FetchOptions) -> Result<u64> {
        let part_path = part_path_for(dest_path);
        let mut allow_resume = options.resume;

        loop {
            match self
                .transfer(url, dest_path, &part_path, allow_resume, options)
                .await
            {
                Ok(size) => return Ok(size),
                Err(Error::Download(DownloadError::HttpStatus { status: 416, .. }))
                    if allow_resume =>
                {
                    // The server cannot satisfy our range: the partial is
                    // stale. Restart clean; 416 is never surfaced.
                    warn!(url, "range not satisfiable, restarting without resume");
                    tokio::fs::remove_file(&part_path).await.ok();
                    allow_resume = false;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn transfer(
        &self,
        url: &str,
        dest_path: &Path,
        part_path: &Path,
        allow_resume: bool,
        options: &FetchOptions,
    ) -> Result<u64> {
        let mut resume_from = 0u64;
        if allow_resume {
            if let Ok(meta) = tokio::fs::metadata(part_path).await {
                resume_from = meta.len();
            }
        }

        let mut request = self.client.get(url);
        if resume_from > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={resume_from}-"));
            debug!(url, resume_from, "resuming partial download");
        }

        let response = request.send().await?;
        let status = response.status();

        match status.as_u16() {
            206 => {}
            200 => {
                if resume_from > 0 {
                    // Server ignored the range; start over from scratch
                    debug!(url, "server ignored range request, restarting");
                    resume_from = 0;
                }
            }
            code => {
                return Err(Error::Download(DownloadError::HttpStatus {
                    status: code,
                    url: url.to_string(),
                }));
            }
        }

        let content_length = response.content_length();
        // When resuming, the advertised length covers the remainder only
        let total = content_length.map(|len| len + resume_from);

        let mut file = if resume_from > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(part_path)
                .await?
        } else {
            tokio::fs::File::create(part_path).await?
        };

        let file_name = dest_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());

        let mut downloaded = resume_from;
        let mut stream = response.bytes_stream();
        // Backdate the first tick so the first chunk emits an event
        let mut last_tick = Instant::now()
            .checked_sub(PROGRESS_INTERVAL)
            .unwrap_or_else(Instant::now);
        let mut last_bytes = downloaded;

        while let Some(chunk) = stream.next().await {
            if options.cancel.is_cancelled() {
                file.flush().await?;
                drop(file);
                if options.destructive_cancel {
                    tokio::fs::remove_file(part_path).await.ok();
                }
                return Err(Error::Cancelled);
            }

            let chunk = chunk?;
            self.limiter.acquire(chunk.len() as u64).await;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            let elapsed = last_tick.elapsed();
            if elapsed >= PROGRESS_INTERVAL {
                let speed = ((downloaded - last_bytes) as f64 / elapsed.as_secs_f64()) as u64;
                self.emit_progress(&file_name, downloaded, total, speed);
                last_tick = Instant::now();
                last_bytes = downloaded;
            }
        }

        file.flush().await?;
        drop(file);

        if let Some(expected) = total {
            if downloaded < expected {
                // Keep the partial so the retry resumes instead of restarting
                return Err(Error::Download(DownloadError::Incomplete {
                    url: url.to_string(),
                    received: downloaded,
                    expected,
                }));
            }
        }

        tokio::fs::rename(part_path, dest_path).await?;
        Ok(downloaded)
    }

    fn emit_progress(
        &self,
        file_name: &Option<String>,
        downloaded: u64,
        total: Option<u64>,
        speed_bps: u64,
    ) {
        let percent = total
            .filter(|t| *t > 0)
            .map(|t| (downloaded as f32 / t as f32 * 100.0).min(100.0))
            .unwrap_or(0.0);
        let eta_s = match (total, speed_bps) {
            (Some(t), speed) if speed > 0 && t > downloaded => Some((t - downloaded) / speed),
            _ => None,
        };

        self.event_tx
            .send(ProgressEvent {
                stage: Stage::Downloading,
                percent,
                message: format!(
                    "downloading at {}",
                    crate::types::format_speed(speed_bps)
                ),
                current_file: file_name.clone(),
                speed_bps: Some(speed_bps),
                eta_s,
            })
            .ok();
    }
}

/// Sidecar path for in-progress transfers (`<dest>.part`)
pub fn part_path_for(dest_path: &Path) -> PathBuf {
    let mut name = dest_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest_path.with_file_name(name)
}
