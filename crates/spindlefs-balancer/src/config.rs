//! Configuration for the disk balancing worker.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BalancerError, BalancerResult};

/// Lowest plan version this worker understands.
pub const MIN_PLAN_VERSION: u64 = 1;

/// Highest plan version this worker understands.
pub const MAX_PLAN_VERSION: u64 = 1;

/// Default bandwidth ceiling for block moves, in MB/s.
pub const DEFAULT_MAX_DISK_THROUGHPUT_MB: u64 = 10;

/// Default tolerance band, in percent of the remaining byte target.
pub const DEFAULT_BLOCK_TOLERANCE_PERCENT: u64 = 10;

/// Default number of per-item I/O errors tolerated before a pair is abandoned.
pub const DEFAULT_MAX_DISK_ERRORS: u64 = 5;

/// Default age, in hours, after which an unforced plan is rejected.
pub const DEFAULT_PLAN_VALID_HOURS: u64 = 24;

/// Node-level configuration for the disk balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Master gate; when false every public operation fails.
    pub enabled: bool,
    /// Node-default bandwidth ceiling in MB/s.
    pub max_disk_throughput_mb: u64,
    /// Node-default tolerance band in percent.
    pub block_tolerance_percent: u64,
    /// Node-default error budget per work item.
    pub max_disk_errors: u64,
    /// Plans older than this many hours are rejected unless forced.
    pub plan_valid_hours: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_disk_throughput_mb: DEFAULT_MAX_DISK_THROUGHPUT_MB,
            block_tolerance_percent: DEFAULT_BLOCK_TOLERANCE_PERCENT,
            max_disk_errors: DEFAULT_MAX_DISK_ERRORS,
            plan_valid_hours: DEFAULT_PLAN_VALID_HOURS,
        }
    }
}

impl BalancerConfig {
    /// Loads a config from a TOML or JSON file, keyed on the extension.
    pub fn from_file(path: &Path) -> BalancerResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| BalancerError::Internal(format!("bad config file: {e}"))),
            "json" => serde_json::from_str(&contents)
                .map_err(|e| BalancerError::Internal(format!("bad config file: {e}"))),
            _ => Err(BalancerError::Internal(format!(
                "unsupported config file extension: {ext}"
            ))),
        }
    }

    /// Returns a copy with user-supplied zero values replaced by defaults.
    ///
    /// These are operator-provided numbers; a zero throughput or tolerance
    /// cannot be honored, so it is logged and ignored.
    pub fn sanitized(&self) -> Self {
        let mut cfg = self.clone();
        if cfg.max_disk_throughput_mb == 0 {
            debug!(
                "found 0 for max disk throughput, ignoring config value, using {}",
                DEFAULT_MAX_DISK_THROUGHPUT_MB
            );
            cfg.max_disk_throughput_mb = DEFAULT_MAX_DISK_THROUGHPUT_MB;
        }
        if cfg.block_tolerance_percent == 0 {
            debug!(
                "found 0 for block tolerance, ignoring config value, using {}",
                DEFAULT_BLOCK_TOLERANCE_PERCENT
            );
            cfg.block_tolerance_percent = DEFAULT_BLOCK_TOLERANCE_PERCENT;
        }
        if cfg.plan_valid_hours == 0 {
            debug!(
                "found 0 for plan validity hours, ignoring config value, using {}",
                DEFAULT_PLAN_VALID_HOURS
            );
            cfg.plan_valid_hours = DEFAULT_PLAN_VALID_HOURS;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cfg = BalancerConfig::default();
        assert!(!cfg.enabled);
        assert_eq!(cfg.max_disk_throughput_mb, 10);
        assert_eq!(cfg.block_tolerance_percent, 10);
        assert_eq!(cfg.max_disk_errors, 5);
        assert_eq!(cfg.plan_valid_hours, 24);
    }

    #[test]
    fn test_sanitized_replaces_zeroes() {
        let cfg = BalancerConfig {
            enabled: true,
            max_disk_throughput_mb: 0,
            block_tolerance_percent: 0,
            max_disk_errors: 0,
            plan_valid_hours: 0,
        };
        let cfg = cfg.sanitized();
        assert_eq!(cfg.max_disk_throughput_mb, DEFAULT_MAX_DISK_THROUGHPUT_MB);
        assert_eq!(cfg.block_tolerance_percent, DEFAULT_BLOCK_TOLERANCE_PERCENT);
        assert_eq!(cfg.plan_valid_hours, DEFAULT_PLAN_VALID_HOURS);
        // zero is a legal error budget, not a missing value
        assert_eq!(cfg.max_disk_errors, 0);
        assert!(cfg.enabled);
    }

    #[test]
    fn test_sanitized_keeps_good_values() {
        let cfg = BalancerConfig {
            enabled: true,
            max_disk_throughput_mb: 50,
            block_tolerance_percent: 5,
            max_disk_errors: 7,
            plan_valid_hours: 48,
        };
        let out = cfg.sanitized();
        assert_eq!(out.max_disk_throughput_mb, 50);
        assert_eq!(out.block_tolerance_percent, 5);
        assert_eq!(out.max_disk_errors, 7);
        assert_eq!(out.plan_valid_hours, 48);
    }

    #[test]
    fn test_from_file_toml() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "enabled = true\n\
             max_disk_throughput_mb = 40\n\
             block_tolerance_percent = 5\n\
             max_disk_errors = 2\n\
             plan_valid_hours = 12"
        )
        .unwrap();
        let cfg = BalancerConfig::from_file(file.path()).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.max_disk_throughput_mb, 40);
        assert_eq!(cfg.block_tolerance_percent, 5);
        assert_eq!(cfg.max_disk_errors, 2);
        assert_eq!(cfg.plan_valid_hours, 12);
    }

    #[test]
    fn test_from_file_json() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "enabled": false,
                "max_disk_throughput_mb": 30,
                "block_tolerance_percent": 20,
                "max_disk_errors": 4,
                "plan_valid_hours": 24
            }}"#
        )
        .unwrap();
        let cfg = BalancerConfig::from_file(file.path()).unwrap();
        assert!(!cfg.enabled);
        assert_eq!(cfg.max_disk_throughput_mb, 30);
    }

    #[test]
    fn test_from_file_unknown_extension() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(file, "enabled: true").unwrap();
        assert!(BalancerConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_serialization_round_trip() {
        let cfg = BalancerConfig {
            enabled: true,
            max_disk_throughput_mb: 25,
            block_tolerance_percent: 15,
            max_disk_errors: 3,
            plan_valid_hours: 12,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let decoded: BalancerConfig = serde_json::from_str(&json).unwrap();
        assert!(decoded.enabled);
        assert_eq!(decoded.max_disk_throughput_mb, 25);
        assert_eq!(decoded.block_tolerance_percent, 15);
        assert_eq!(decoded.max_disk_errors, 3);
        assert_eq!(decoded.plan_valid_hours, 12);
    }
}
