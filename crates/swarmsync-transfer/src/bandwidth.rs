//! Bandwidth shaping shared across connections.
//!
//! One [`BandwidthLimiter`] exists per network class and direction. Every
//! chunk sent or received first acquires its size from the limiter of its
//! peer's class; callers queue in FIFO order and sleep until the token bucket
//! allows the transfer.

use crate::config::BandwidthSettings;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};

/// Network class of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkClass {
    /// Local network
    Lan,
    /// Internet
    Wan,
}

impl NetworkClass {
    /// Class of a peer from its LAN flag
    #[must_use]
    pub fn of(on_lan: bool) -> Self {
        if on_lan { Self::Lan } else { Self::Wan }
    }
}

/// Traffic direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Outgoing
    Upload,
    /// Incoming
    Download,
}

/// Token bucket allowing up to two seconds of burst
///
/// Tokens may go negative: a caller takes what it needs at once and waits
/// out the debt, so a large chunk is never starved by small ones.
#[derive(Debug)]
struct TokenBucket {
    limit: u64,
    tokens: f64,
    capacity: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(limit: u64) -> Self {
        let mut bucket = Self {
            limit: 0,
            tokens: 0.0,
            capacity: 0.0,
            last_refill: Instant::now(),
        };
        bucket.set_limit(limit);
        bucket
    }

    fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
        self.last_refill = Instant::now();
        if limit == 0 {
            self.tokens = 0.0;
            self.capacity = 0.0;
            return;
        }
        self.capacity = limit as f64 * 2.0;
        self.tokens = self.tokens.min(self.capacity).max(0.0);
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.limit as f64).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Take `bytes`, returning how long the caller has to wait
    fn consume(&mut self, bytes: usize) -> Option<Duration> {
        if self.limit == 0 {
            return None;
        }
        self.refill();
        self.tokens -= bytes as f64;
        if self.tokens >= 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(-self.tokens / self.limit as f64))
        }
    }
}

/// Rate limiter shared by all connections of one class and direction
#[derive(Debug)]
pub struct BandwidthLimiter {
    name: &'static str,
    bucket: Mutex<TokenBucket>,
    queue: AsyncMutex<()>,
}

impl BandwidthLimiter {
    /// Create a limiter (0 = unlimited)
    #[must_use]
    pub fn new(name: &'static str, limit: u64) -> Self {
        Self {
            name,
            bucket: Mutex::new(TokenBucket::new(limit)),
            queue: AsyncMutex::new(()),
        }
    }

    /// Current limit in bytes/sec (0 = unlimited)
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.bucket.lock().limit
    }

    /// Change the limit
    pub fn set_limit(&self, limit: u64) {
        let mut bucket = self.bucket.lock();
        if bucket.limit != limit {
            debug!(limiter = self.name, "Bandwidth limit {} -> {} bytes/sec", bucket.limit, limit);
            bucket.set_limit(limit);
        }
    }

    /// Whether the limiter lets everything through
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.limit() == 0
    }

    /// Wait until `bytes` may be transferred
    ///
    /// Callers are served in arrival order.
    pub async fn acquire(&self, bytes: usize) {
        if bytes == 0 || self.is_unlimited() {
            return;
        }

        let _turn = self.queue.lock().await;
        let wait = self.bucket.lock().consume(bytes);
        if let Some(delay) = wait {
            trace!(limiter = self.name, "Throttled {} bytes for {:?}", bytes, delay);
            tokio::time::sleep(delay).await;
        }
    }
}

/// The four limiters (LAN/WAN x upload/download) and the settings behind them
#[derive(Debug)]
pub struct BandwidthProvider {
    lan_upload: Arc<BandwidthLimiter>,
    lan_download: Arc<BandwidthLimiter>,
    wan_upload: Arc<BandwidthLimiter>,
    wan_download: Arc<BandwidthLimiter>,
    settings: RwLock<BandwidthSettings>,
}

impl BandwidthProvider {
    /// Create limiters for `settings`
    #[must_use]
    pub fn new(settings: BandwidthSettings) -> Self {
        let provider = Self {
            lan_upload: Arc::new(BandwidthLimiter::new("lan-out", 0)),
            lan_download: Arc::new(BandwidthLimiter::new("lan-in", 0)),
            wan_upload: Arc::new(BandwidthLimiter::new("wan-out", 0)),
            wan_download: Arc::new(BandwidthLimiter::new("wan-in", 0)),
            settings: RwLock::new(settings.clone()),
        };
        provider.apply(settings);
        provider
    }

    /// Limiter of a class and direction
    #[must_use]
    pub fn limiter(&self, class: NetworkClass, direction: Direction) -> Arc<BandwidthLimiter> {
        let limiter = match (class, direction) {
            (NetworkClass::Lan, Direction::Upload) => &self.lan_upload,
            (NetworkClass::Lan, Direction::Download) => &self.lan_download,
            (NetworkClass::Wan, Direction::Upload) => &self.wan_upload,
            (NetworkClass::Wan, Direction::Download) => &self.wan_download,
        };
        Arc::clone(limiter)
    }

    /// Current settings
    #[must_use]
    pub fn settings(&self) -> BandwidthSettings {
        self.settings.read().clone()
    }

    /// Store new settings and propagate the effective rates
    pub fn apply(&self, settings: BandwidthSettings) {
        self.lan_upload.set_limit(settings.effective(settings.lan_upload));
        self.lan_download.set_limit(settings.effective(settings.lan_download));
        self.wan_upload.set_limit(settings.effective(settings.wan_upload));
        self.wan_download.set_limit(settings.effective(settings.wan_download));
        *self.settings.write() = settings;
    }

    /// Modify the settings in place and propagate
    pub fn update<F: FnOnce(&mut BandwidthSettings)>(&self, change: F) {
        let mut settings = self.settings();
        change(&mut settings);
        self.apply(settings);
    }
}

impl Default for BandwidthProvider {
    fn default() -> Self {
        Self::new(BandwidthSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_unlimited() {
        let mut bucket = TokenBucket::new(0);
        assert!(bucket.consume(usize::MAX / 2).is_none());
    }

    #[test]
    fn test_bucket_debt() {
        let mut bucket = TokenBucket::new(1000);
        // Starts empty: the whole request becomes debt
        let wait = bucket.consume(500).unwrap();
        assert!(wait <= Duration::from_millis(500));
        assert!(wait >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_unlimited_acquire_does_not_wait() {
        let limiter = BandwidthLimiter::new("test", 0);
        let start = Instant::now();
        limiter.acquire(10 * 1024 * 1024).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_acquire_throttles() {
        let limiter = BandwidthLimiter::new("test", 10_000);
        let start = Instant::now();
        limiter.acquire(1_000).await;
        limiter.acquire(1_000).await;
        // 2000 bytes at 10000 bytes/sec
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_silent_mode_throttles_all_classes() {
        let provider = BandwidthProvider::new(BandwidthSettings {
            lan_upload: 100_000,
            wan_download: 40_000,
            ..Default::default()
        });
        assert_eq!(provider.limiter(NetworkClass::Lan, Direction::Upload).limit(), 100_000);

        provider.update(|s| {
            s.silent_mode = true;
            s.silent_throttle_percent = 25;
        });

        assert_eq!(provider.limiter(NetworkClass::Lan, Direction::Upload).limit(), 25_000);
        assert_eq!(provider.limiter(NetworkClass::Wan, Direction::Download).limit(), 10_000);
        assert!(provider.limiter(NetworkClass::Wan, Direction::Upload).is_unlimited());
        assert_eq!(provider.settings().lan_upload, 100_000);

        provider.update(|s| s.silent_mode = false);
        assert_eq!(provider.limiter(NetworkClass::Lan, Direction::Upload).limit(), 100_000);
    }
}
