//! Transfer engine configuration.
//!
//! Everything the engine needs is passed in through [`TransferConfig`] at
//! construction; there is no global state.

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use swarmsync_files::DEFAULT_PART_SIZE;

/// Lowest non-zero upload limit accepted (bytes/sec)
pub const MIN_UPLOAD_CPS: u64 = 3 * 1024;

/// Largest part a single request may ask for
pub const MAX_PART_SIZE: usize = 16 * 1024 * 1024;

/// Bandwidth limits per network class and direction (bytes/sec, 0 = unlimited)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthSettings {
    /// Upload limit towards LAN peers
    pub lan_upload: u64,
    /// Download limit from LAN peers
    pub lan_download: u64,
    /// Upload limit towards WAN peers
    pub wan_upload: u64,
    /// Download limit from WAN peers
    pub wan_download: u64,
    /// Whether silent mode (throttled background operation) is active
    pub silent_mode: bool,
    /// Share of the configured limits used in silent mode (10 to 100)
    pub silent_throttle_percent: u8,
}

impl Default for BandwidthSettings {
    fn default() -> Self {
        Self {
            lan_upload: 0,
            lan_download: 0,
            wan_upload: 0,
            wan_download: 0,
            silent_mode: false,
            silent_throttle_percent: 50,
        }
    }
}

impl BandwidthSettings {
    /// Limit actually applied for a configured value
    ///
    /// Unlimited stays unlimited whatever the throttle.
    #[must_use]
    pub fn effective(&self, configured: u64) -> u64 {
        if configured == 0 || !self.silent_mode {
            return configured;
        }
        (configured.saturating_mul(u64::from(self.silent_throttle_percent)) / 100).max(1)
    }

    /// Check limits and throttle
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidConfig`] if an upload limit is below
    /// [`MIN_UPLOAD_CPS`] or the throttle is outside 10..=100.
    pub fn validate(&self) -> Result<()> {
        for (name, limit) in [("lan_upload", self.lan_upload), ("wan_upload", self.wan_upload)] {
            if limit != 0 && limit < MIN_UPLOAD_CPS {
                return Err(TransferError::InvalidConfig(format!(
                    "{} of {} bytes/sec is below the minimum of {}",
                    name, limit, MIN_UPLOAD_CPS
                )));
            }
        }
        if !(10..=100).contains(&self.silent_throttle_percent) {
            return Err(TransferError::InvalidConfig(format!(
                "silent_throttle_percent must be between 10 and 100, got {}",
                self.silent_throttle_percent
            )));
        }
        Ok(())
    }
}

/// Transfer engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Transfers enabled at all
    pub enabled: bool,
    /// Maximum distinct WAN peers uploaded to at the same time
    pub max_concurrent_uploads: usize,
    /// Maximum downloads served by one LAN peer
    pub max_downloads_per_peer_lan: usize,
    /// Maximum downloads served by one WAN peer
    pub max_downloads_per_peer_wan: usize,
    /// Part requests kept in flight per download source
    pub max_requests_queued: usize,
    /// Bytes per part request
    pub part_size: usize,
    /// Maximum sources of one download
    pub max_sources_per_download: usize,
    /// Files up to this size are read into memory for uploading
    pub upload_buffer_threshold: u64,
    /// Timeout waiting for the next part request (ms)
    pub request_timeout_ms: u64,
    /// Timeout waiting for the first request after start (ms)
    pub first_request_timeout_ms: u64,
    /// Maintenance loop tick (ms)
    pub wait_time_ms: u64,
    /// Delay before acknowledging a queued upload (ms)
    pub queued_ack_delay_ms: u64,
    /// Interval of partial-sync statistics sampling (ms)
    pub partial_stats_interval_ms: u64,
    /// Interval of the completed-transfer cleanup (ms)
    pub cleanup_interval_ms: u64,
    /// Remove old completed transfers automatically
    pub auto_cleanup: bool,
    /// Age after which completed transfers are removed (days)
    pub cleanup_days: u32,
    /// Smallest local base file worth a parts-record negotiation
    pub parts_record_min_size: u64,
    /// Upload workers running at the same time
    pub upload_workers: usize,
    /// Directory of persisted transfer state, none disables persistence
    pub state_dir: Option<PathBuf>,
    /// Configuration profile name, used for the state file name
    pub profile: String,
    /// Bandwidth limits
    pub bandwidth: BandwidthSettings,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_uploads: 5,
            max_downloads_per_peer_lan: 10,
            max_downloads_per_peer_wan: 4,
            max_requests_queued: 15,
            part_size: DEFAULT_PART_SIZE,
            max_sources_per_download: 8,
            upload_buffer_threshold: 512 * 1024,
            request_timeout_ms: 60_000,
            first_request_timeout_ms: 300_000,
            wait_time_ms: 10_000,
            queued_ack_delay_ms: 5,
            partial_stats_interval_ms: 10_000,
            cleanup_interval_ms: 24 * 60 * 60 * 1000,
            auto_cleanup: false,
            cleanup_days: 5,
            parts_record_min_size: 1024 * 1024,
            upload_workers: 32,
            state_dir: None,
            profile: "default".to_string(),
            bandwidth: BandwidthSettings::default(),
        }
    }
}

impl TransferConfig {
    /// Parse and validate a TOML document
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Check settings for consistency
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidConfig`] naming the first bad setting.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_concurrent_uploads", self.max_concurrent_uploads),
            ("max_downloads_per_peer_lan", self.max_downloads_per_peer_lan),
            ("max_downloads_per_peer_wan", self.max_downloads_per_peer_wan),
            ("max_requests_queued", self.max_requests_queued),
            ("part_size", self.part_size),
            ("max_sources_per_download", self.max_sources_per_download),
            ("upload_workers", self.upload_workers),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TransferError::InvalidConfig(format!("{} must be > 0", name)));
            }
        }

        if self.part_size > MAX_PART_SIZE {
            return Err(TransferError::InvalidConfig(format!(
                "part_size {} exceeds {}",
                self.part_size, MAX_PART_SIZE
            )));
        }

        if self.wait_time_ms == 0 || self.request_timeout_ms == 0 {
            return Err(TransferError::InvalidConfig(
                "wait_time_ms and request_timeout_ms must be > 0".into(),
            ));
        }

        if self.profile.is_empty() || self.profile.contains(['/', '\\']) {
            return Err(TransferError::InvalidConfig(format!(
                "invalid profile name {:?}",
                self.profile
            )));
        }

        self.bandwidth.validate()
    }

    /// Cap of an upload's pending-request queue
    #[must_use]
    pub fn upload_queue_limit(&self) -> usize {
        self.max_requests_queued.saturating_mul(5)
    }

    /// Timeout waiting for the next part request
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Timeout waiting for the first request after start
    #[must_use]
    pub fn first_request_timeout(&self) -> Duration {
        Duration::from_millis(self.first_request_timeout_ms.max(self.request_timeout_ms))
    }

    /// Maintenance loop tick
    #[must_use]
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    /// Delay before acknowledging a queued upload
    #[must_use]
    pub fn queued_ack_delay(&self) -> Duration {
        Duration::from_millis(self.queued_ack_delay_ms)
    }

    /// Interval of partial-sync statistics sampling
    #[must_use]
    pub fn partial_stats_interval(&self) -> Duration {
        Duration::from_millis(self.partial_stats_interval_ms.max(1))
    }

    /// Interval of the completed-transfer cleanup
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = TransferConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.upload_queue_limit(), 75);
        assert_eq!(config.partial_stats_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_from_toml() {
        let config = TransferConfig::from_toml_str(
            r#"
            max_concurrent_uploads = 3
            part_size = 32768
            profile = "work"

            [bandwidth]
            wan_upload = 10240
            silent_mode = true
            silent_throttle_percent = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.max_concurrent_uploads, 3);
        assert_eq!(config.part_size, 32768);
        assert_eq!(config.profile, "work");
        assert_eq!(config.max_requests_queued, 15);
        assert_eq!(config.bandwidth.wan_upload, 10240);
        assert_eq!(config.bandwidth.effective(10240), 2048);
    }

    #[test]
    fn test_upload_floor_rejected() {
        let result = TransferConfig::from_toml_str("[bandwidth]\nlan_upload = 1000\n");
        assert!(matches!(result, Err(TransferError::InvalidConfig(_))));
    }

    #[test]
    fn test_throttle_bounds() {
        let mut settings = BandwidthSettings {
            silent_throttle_percent: 5,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        settings.silent_throttle_percent = 100;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_unlimited_stays_unlimited() {
        let settings = BandwidthSettings {
            silent_mode: true,
            silent_throttle_percent: 10,
            ..Default::default()
        };
        assert_eq!(settings.effective(0), 0);
        assert_eq!(settings.effective(100_000), 10_000);
    }

    #[test]
    fn test_malformed_toml() {
        let result = TransferConfig::from_toml_str("max_concurrent_uploads = \"many\"");
        assert!(matches!(result, Err(TransferError::ConfigParse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.toml");
        std::fs::write(&path, "auto_cleanup = true\ncleanup_days = 2\n").unwrap();

        let config = TransferConfig::load(&path).unwrap();
        assert!(config.auto_cleanup);
        assert_eq!(config.cleanup_days, 2);
    }
}
