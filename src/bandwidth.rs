//! Bandwidth limiting using a token bucket
//!
//! The `BandwidthLimiter` provides a global throttle gate shared by all
//! concurrent downloads. Tokens represent bytes; the bucket refills on a
//! 100 ms cadence up to a capacity of one second's worth of the limit.
//!
//! A limit of `0`/`None` means unlimited: this single state covers both
//! "no limit configured" and "throttling disabled".
//!
//! # Ordering
//!
//! Acquisitions are served in arrival order: the bucket state sits behind
//! a fair async mutex, so waiters drain FIFO. Requests larger than the
//! bucket capacity consume tokens in slices across refills and therefore
//! always make progress in bounded time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Refill cadence; also bounds how quickly a live limit change takes effect
const REFILL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

/// Global bandwidth limiter shared across all downloads
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct BandwidthLimiter {
    /// Limit in bytes per second (0 = unlimited)
    limit_bps: Arc<AtomicU64>,
    /// Bucket state; tokio's Mutex is fair, giving FIFO service
    bucket: Arc<Mutex<Bucket>>,
}

impl BandwidthLimiter {
    /// Create a limiter with the given limit (`None` = unlimited)
    #[must_use]
    pub fn new(limit_bps: Option<u64>) -> Self {
        let limit = limit_bps.unwrap_or(0);
        Self {
            limit_bps: Arc::new(AtomicU64::new(limit)),
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: limit,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Change the limit at runtime
    ///
    /// Takes effect live: raising the limit adds the difference to the
    /// bucket so current waiters are released promptly; lowering shrinks
    /// capacity but never revokes tokens that were already granted.
    pub async fn set_limit(&self, limit_bps: Option<u64>) {
        let new_limit = limit_bps.unwrap_or(0);
        let old_limit = self.limit_bps.swap(new_limit, Ordering::SeqCst);

        if new_limit > old_limit {
            let mut bucket = self.bucket.lock().await;
            bucket.tokens = bucket.tokens.saturating_add(new_limit - old_limit);
        }
    }

    /// The current limit, `None` when unlimited
    pub fn limit(&self) -> Option<u64> {
        match self.limit_bps.load(Ordering::Relaxed) {
            0 => None,
            bps => Some(bps),
        }
    }

    /// Consume `bytes` tokens, suspending until they are available
    ///
    /// Returns immediately when the limiter is unlimited or `bytes == 0`.
    /// Large requests are satisfied in capacity-sized slices, so two
    /// concurrent acquirers each asking for more than the bucket holds
    /// still both complete.
    pub async fn acquire(&self, bytes: u64) {
        if bytes == 0 || self.limit_bps.load(Ordering::Relaxed) == 0 {
            return;
        }

        let mut remaining = bytes;

        loop {
            // Re-read each iteration so set_limit takes effect mid-wait
            let limit = self.limit_bps.load(Ordering::Relaxed);
            if limit == 0 {
                return;
            }

            {
                let mut bucket = self.bucket.lock().await;
                Self::refill(&mut bucket, limit);

                let take = remaining.min(bucket.tokens);
                bucket.tokens -= take;
                remaining -= take;
            }

            if remaining == 0 {
                return;
            }

            // Wait roughly until the next refill covers what is left,
            // capped at the refill cadence so limit changes are noticed
            let wait_ms = (remaining.saturating_mul(1000) / limit).clamp(10, 100);
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }
    }

    /// Add elapsed-time tokens, capped at the bucket capacity (the limit)
    fn refill(bucket: &mut Bucket, limit: u64) {
        let elapsed = bucket.last_refill.elapsed();
        if elapsed < REFILL_INTERVAL {
            return;
        }
        let added = (limit as f64 * elapsed.as_secs_f64()) as u64;
        if added > 0 {
            // Refill never pushes the bucket above capacity, but excess left
            // over from a previous higher limit is kept until consumed
            let cap = limit.max(bucket.tokens);
            bucket.tokens = bucket.tokens.saturating_add(added).min(cap);
            bucket.last_refill = Instant::now();
        }
    }
}
