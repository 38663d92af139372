//! Bandwidth throttling for sync transfers.
//!
//! Token bucket over 1 KiB cells: one cell per KiB written, refilled at the
//! configured rate with a one-second burst.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use humansize::{format_size, DECIMAL};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

const CELL_BYTES: u64 = 1024;

/// Bandwidth limit configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthLimit {
    /// Bytes per second; 0 means unlimited.
    pub bytes_per_second: u64,
}

impl BandwidthLimit {
    pub fn new(bytes_per_second: u64) -> Self {
        Self { bytes_per_second }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_limited(&self) -> bool {
        self.bytes_per_second > 0
    }
}

impl fmt::Display for BandwidthLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_limited() {
            write!(f, "{}/s", format_size(self.bytes_per_second, DECIMAL))
        } else {
            f.write_str("unlimited")
        }
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Shared limiter; clones draw from the same bucket.
#[derive(Clone, Default)]
pub struct BandwidthLimiter {
    limiter: Option<Arc<DirectLimiter>>,
    burst: u32,
    limit: BandwidthLimit,
}

impl BandwidthLimiter {
    pub fn new(limit: BandwidthLimit) -> Self {
        if !limit.is_limited() {
            return Self::default();
        }
        let cells_per_second = (limit.bytes_per_second / CELL_BYTES).clamp(1, u32::MAX as u64) as u32;
        match NonZeroU32::new(cells_per_second) {
            Some(rate) => Self {
                limiter: Some(Arc::new(RateLimiter::direct(Quota::per_second(rate)))),
                burst: rate.get(),
                limit,
            },
            None => Self::default(),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn limit(&self) -> BandwidthLimit {
        self.limit
    }

    /// Wait until `bytes` may be written. No-op when unlimited.
    pub async fn acquire(&self, bytes: u64) {
        let Some(limiter) = &self.limiter else {
            return;
        };
        let mut cells = bytes.div_ceil(CELL_BYTES).max(1);
        while cells > 0 {
            let batch = cells.min(self.burst as u64) as u32;
            if let Some(n) = NonZeroU32::new(batch) {
                // batch never exceeds the burst size, so capacity is always sufficient
                if limiter.until_n_ready(n).await.is_err() {
                    return;
                }
            }
            cells -= batch as u64;
        }
    }
}

impl fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("limit", &self.limit)
            .finish()
    }
}
