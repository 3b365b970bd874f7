//! Global constants for driftscan
//!
//! Centralized location for application-wide constants

use std::time::Duration;

/// Application subsystem identifier, used for Unified Logging on macOS
pub const APP_SUBSYSTEM: &str = "com.microsoft.sysinternals.driftscan";

/// Directory name under the user's config/data directories
pub const APP_DIR_NAME: &str = "driftscan";

/// Settings file name inside the config directory
pub const SETTINGS_FILE_NAME: &str = "config.toml";

/// Store snapshot file name inside the store directory
pub const STORE_FILE_NAME: &str = "store.json";

/// Suffixes appended to a guided session id
pub const GUIDED_BASELINE_SUFFIX: &str = "baseline";
pub const GUIDED_AFTER_SUFFIX: &str = "after";
pub const GUIDED_MONITORING_SUFFIX: &str = "monitoring";

/// How often the drain loop reads the pending write count
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often the drain loop samples the drain rate
pub const DRAIN_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Shard factors below this get a one-time "increase shards" advisory
pub const SHARD_ADVISORY_CEILING: usize = 7;

/// A sample that drained less than this fraction of the previous backlog is a stall
pub const MATERIAL_DRAIN_FRACTION: f64 = 0.05;

/// Consecutive empty readings required before the queue counts as drained
pub const DRAIN_EMPTY_READINGS: u32 = 2;

/// Bounds for monitor polling intervals, in seconds.
/// Note: must match the message in `SettingsError::InvalidInterval`
pub const POLLING_INTERVAL_MIN: f64 = 0.1;
pub const POLLING_INTERVAL_MAX: f64 = 300.0;

/// Bounds for the store shard factor
pub const SHARD_FACTOR_MIN: usize = 1;
pub const SHARD_FACTOR_MAX: usize = 64;

/// Bounds for the drain poll interval, in milliseconds
pub const DRAIN_POLL_MIN_MS: u64 = 10;
pub const DRAIN_POLL_MAX_MS: u64 = 5000;

/// Label used as rule source when the embedded rule set is in use
pub const EMBEDDED_RULES_SOURCE: &str = "embedded";
