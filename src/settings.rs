//! Settings file
//!
//! Handles TOML parsing, bounds validation, and conversion into the options
//! the coordinators take. A missing file means defaults.
//!
//! ```toml
//! [store]
//! path = "/var/lib/driftscan"
//! shard_factor = 4
//!
//! [analysis]
//! rules_path = "/etc/driftscan/rules.json"
//! parallelism = 8
//! apply_sub_object_rules = true
//!
//! [drain]
//! poll_interval_ms = 100
//! sample_interval_secs = 10
//! shard_advisory_ceiling = 7
//!
//! [monitor]
//! poll_interval_secs = 1.0
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::analysis::AnalyzerOptions;
use crate::constants::{
    APP_DIR_NAME, DRAIN_POLL_INTERVAL, DRAIN_POLL_MAX_MS, DRAIN_POLL_MIN_MS, DRAIN_SAMPLE_INTERVAL,
    POLLING_INTERVAL_MAX, POLLING_INTERVAL_MIN, SETTINGS_FILE_NAME, SHARD_ADVISORY_CEILING, SHARD_FACTOR_MAX,
    SHARD_FACTOR_MIN,
};
use crate::drain::DrainSettings;
use crate::rules::RuleSource;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Note: bounds must match SHARD_FACTOR_MIN/MAX in constants.rs
    #[error("Invalid shard factor: {0}. Must be between 1 and 64")]
    InvalidShardFactor(usize),

    /// Note: bounds must match POLLING_INTERVAL_MIN/MAX in constants.rs
    #[error("Invalid polling interval: {0}. Must be between 0.1 and 300.0 seconds")]
    InvalidInterval(f64),

    /// Note: bounds must match DRAIN_POLL_MIN_MS/MAX_MS in constants.rs
    #[error("Invalid drain poll interval: {0}ms. Must be between 10 and 5000 milliseconds")]
    InvalidDrainPoll(u64),

    #[error("Invalid {field}: must be greater than zero")]
    Zero { field: &'static str },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub store: StoreSettings,
    pub analysis: AnalysisSettings,
    pub drain: DrainFileSettings,
    pub monitor: MonitorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    /// Directory holding the store file; in-memory only when unset
    pub path: Option<PathBuf>,
    pub shard_factor: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: None,
            shard_factor: SHARD_FACTOR_MIN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisSettings {
    /// Embedded rules when unset
    pub rules_path: Option<PathBuf>,
    /// Classification threads; available parallelism when unset
    pub parallelism: Option<usize>,
    pub apply_sub_object_rules: bool,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            rules_path: None,
            parallelism: None,
            apply_sub_object_rules: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DrainFileSettings {
    pub poll_interval_ms: u64,
    pub sample_interval_secs: u64,
    pub shard_advisory_ceiling: usize,
}

impl Default for DrainFileSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: DRAIN_POLL_INTERVAL.as_millis() as u64,
            sample_interval_secs: DRAIN_SAMPLE_INTERVAL.as_secs(),
            shard_advisory_ceiling: SHARD_ADVISORY_CEILING,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorSettings {
    /// Seconds between monitor polls (0.1-300.0)
    pub poll_interval_secs: f64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self { poll_interval_secs: 1.0 }
    }
}

/// `<config_dir>/driftscan/config.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Default directory for the persisted store
pub fn default_store_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join(APP_DIR_NAME))
}

impl Settings {
    /// Load from `path`, or the default location when `None`.
    /// An explicit path must exist; the default location may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        match std::fs::read_to_string(&path) {
            Ok(content) => {
                log::debug!("Loading settings from {}", path.display());
                Self::from_toml(&content, &path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Ok(Self::default()),
            Err(source) => Err(SettingsError::Io { path, source }),
        }
    }

    pub fn from_toml(content: &str, origin: &Path) -> Result<Self, SettingsError> {
        let settings: Settings = toml::from_str(content).map_err(|source| SettingsError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        validate_shard_factor(self.store.shard_factor)?;
        validate_polling_interval(self.monitor.poll_interval_secs)?;

        let poll = self.drain.poll_interval_ms;
        if !(DRAIN_POLL_MIN_MS..=DRAIN_POLL_MAX_MS).contains(&poll) {
            return Err(SettingsError::InvalidDrainPoll(poll));
        }
        if self.drain.sample_interval_secs == 0 {
            return Err(SettingsError::Zero {
                field: "drain.sample_interval_secs",
            });
        }
        if self.analysis.parallelism == Some(0) {
            return Err(SettingsError::Zero {
                field: "analysis.parallelism",
            });
        }
        Ok(())
    }

    pub fn drain_settings(&self) -> DrainSettings {
        DrainSettings {
            poll_interval: Duration::from_millis(self.drain.poll_interval_ms),
            sample_interval: Duration::from_secs(self.drain.sample_interval_secs),
            advisory_ceiling: self.drain.shard_advisory_ceiling,
            ..DrainSettings::default()
        }
    }

    pub fn analyzer_options(&self) -> AnalyzerOptions {
        AnalyzerOptions {
            parallelism: self.analysis.parallelism,
            apply_sub_object_rules: self.analysis.apply_sub_object_rules,
            ..AnalyzerOptions::default()
        }
    }

    pub fn rule_source(&self) -> RuleSource {
        RuleSource::from_option(self.analysis.rules_path.clone())
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs_f64(self.monitor.poll_interval_secs)
    }
}

pub fn validate_shard_factor(shards: usize) -> Result<usize, SettingsError> {
    if (SHARD_FACTOR_MIN..=SHARD_FACTOR_MAX).contains(&shards) {
        Ok(shards)
    } else {
        Err(SettingsError::InvalidShardFactor(shards))
    }
}

pub fn validate_polling_interval(seconds: f64) -> Result<f64, SettingsError> {
    if (POLLING_INTERVAL_MIN..=POLLING_INTERVAL_MAX).contains(&seconds) {
        Ok(seconds)
    } else {
        Err(SettingsError::InvalidInterval(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.store.shard_factor, 1);
        assert_eq!(settings.drain_settings().poll_interval, Duration::from_millis(100));
        assert_eq!(settings.rule_source(), RuleSource::Embedded);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = Settings::from_toml(
            "[store]\nshard_factor = 8\n\n[analysis]\nrules_path = \"/etc/rules.json\"\n",
            Path::new("config.toml"),
        )
        .unwrap();

        assert_eq!(settings.store.shard_factor, 8);
        assert!(settings.analysis.apply_sub_object_rules);
        assert_eq!(settings.rule_source(), RuleSource::File("/etc/rules.json".into()));
        assert_eq!(settings.monitor_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_bounds_are_enforced() {
        let shards = Settings::from_toml("[store]\nshard_factor = 0\n", Path::new("c"));
        assert!(matches!(shards, Err(SettingsError::InvalidShardFactor(0))));

        let interval = Settings::from_toml("[monitor]\npoll_interval_secs = 301.0\n", Path::new("c"));
        assert!(matches!(interval, Err(SettingsError::InvalidInterval(_))));

        let drain = Settings::from_toml("[drain]\npoll_interval_ms = 5\n", Path::new("c"));
        assert!(matches!(drain, Err(SettingsError::InvalidDrainPoll(5))));

        assert!(validate_polling_interval(0.1).is_ok());
        assert!(validate_shard_factor(64).is_ok());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result = Settings::from_toml("[store]\nshards = 2\n", Path::new("c"));
        assert!(matches!(result, Err(SettingsError::Parse { .. })));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = Settings::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(SettingsError::Io { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[analysis]\nparallelism = 2\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.analyzer_options().parallelism, Some(2));
    }
}
