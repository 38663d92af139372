//! Byte-level progress for a sync run.
//!
//! The completed counter is the one piece of state written from several
//! transfer workers at once; it is a relaxed atomic, and readers tolerate a
//! slightly stale value.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use humansize::{format_size, BINARY};

/// Point-in-time view of a tracker, for periodic display.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub completed: u64,
    pub total: u64,
    pub percent_complete: f64,
    pub bytes_per_second: f64,
    pub eta: Duration,
}

#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    completed: AtomicU64,
    started: Instant,
}

impl ProgressTracker {
    /// Start tracking towards `total` bytes.
    pub fn new(total: u64) -> Self {
        Self {
            total,
            completed: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn advance(&self, bytes: u64) {
        self.completed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Percentage of `total` completed. May exceed 100 if the tree grew mid-run.
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed() as f64 / self.total as f64 * 100.0
    }

    /// Average rate since the tracker was created.
    pub fn bytes_per_second(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.completed() as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Remaining time at the average rate. Zero before any progress or once done.
    pub fn eta(&self) -> Duration {
        let completed = self.completed();
        let rate = self.bytes_per_second();
        if completed == 0 || rate <= 0.0 {
            return Duration::ZERO;
        }
        let remaining = self.total.saturating_sub(completed);
        Duration::from_secs_f64(remaining as f64 / rate)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: self.completed(),
            total: self.total,
            percent_complete: self.percent_complete(),
            bytes_per_second: self.bytes_per_second(),
            eta: self.eta(),
        }
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1}% ({}/s) ETA: {}s",
            self.percent_complete,
            format_size(self.bytes_per_second as u64, BINARY),
            self.eta.as_secs()
        )
    }
}

impl fmt::Display for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.snapshot().fmt(f)
    }
}
