//! Byte counters with a sliding throughput window.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default span of the throughput window
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(5);

/// Monotonic byte counter plus current throughput
///
/// Increments and reads may happen concurrently from any thread; the total is
/// an atomic and only the throughput samples sit behind a short lock.
#[derive(Debug)]
pub struct TransferCounter {
    total: AtomicU64,
    samples: Mutex<VecDeque<(Instant, u64)>>,
    window: Duration,
}

impl TransferCounter {
    /// Create an empty counter
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(DEFAULT_RATE_WINDOW)
    }

    /// Create a counter with a custom throughput window
    #[must_use]
    pub fn with_window(window: Duration) -> Self {
        Self {
            total: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::new()),
            window,
        }
    }

    /// Record `bytes` transferred now
    pub fn add(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.total.fetch_add(bytes, Ordering::Relaxed);

        let now = Instant::now();
        let mut samples = self.samples.lock();
        samples.push_back((now, bytes));
        Self::prune(&mut samples, now, self.window);
    }

    /// Total bytes recorded
    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Throughput over the window (bytes/sec)
    #[must_use]
    pub fn current_rate(&self) -> f64 {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, now, self.window);
        let bytes: u64 = samples.iter().map(|(_, b)| b).sum();
        bytes as f64 / self.window.as_secs_f64()
    }

    fn prune(samples: &mut VecDeque<(Instant, u64)>, now: Instant, window: Duration) {
        while let Some((at, _)) = samples.front() {
            if now.duration_since(*at) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for TransferCounter {
    fn default() -> Self {
        Self::new()
    }
}
