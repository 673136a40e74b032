//! Retention job configuration.
//!
//! Controls how the sweep pages through the entity population, how hard it
//! leans on the datastore, and where the audit report lands.
//!
//! # Example
//!
//! ```toml
//! [retention]
//! enabled = true
//! interval_hours = 24
//! report_path = "/var/log/retention/report.txt"
//!
//! [retention.safety]
//! dry_run = false
//! batch_size = 5000
//! batch_delay_ms = 1000
//! max_entities_per_run = 0
//!
//! [retention.eligibility]
//! cutoff_month = 7
//! cutoff_day = 7
//! ```

use std::{path::PathBuf, time::Duration};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Retention job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    /// Whether the scheduled worker runs at all.
    /// One-shot `run` invocations ignore this flag.
    /// Default: true
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often the scheduled worker re-runs (in hours).
    /// Default: 24 (once per day)
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,

    /// Where the plain-text audit report is written after each run.
    /// Default: `retention-report.txt` in the working directory
    #[serde(default = "default_report_path")]
    pub report_path: PathBuf,

    /// Safety and pacing settings.
    #[serde(default)]
    pub safety: RetentionSafety,

    /// Eligibility rule tuning.
    #[serde(default)]
    pub eligibility: EligibilityConfig,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_hours: default_interval_hours(),
            report_path: default_report_path(),
            safety: RetentionSafety::default(),
            eligibility: EligibilityConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interval_hours() -> u64 {
    24
}

fn default_report_path() -> PathBuf {
    PathBuf::from("retention-report.txt")
}

/// Safety settings for retention runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct RetentionSafety {
    /// If true, evaluate and plan every entity but never open a transaction.
    /// Default: false
    #[serde(default)]
    pub dry_run: bool,

    /// Number of entities pulled from the cursor per window.
    /// Default: 5000
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Pause after each full window, in milliseconds.
    /// Default: 1000
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    /// Stop after this many entities have been processed.
    /// Set to 0 for unlimited.
    /// Default: 0
    #[serde(default)]
    pub max_entities_per_run: u64,
}

impl Default for RetentionSafety {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            max_entities_per_run: 0,
        }
    }
}

fn default_batch_size() -> u32 {
    5000
}

fn default_batch_delay_ms() -> u64 {
    1000
}

/// Month/day cutoff for entities whose end period falls in the current year.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct EligibilityConfig {
    /// Default: 7 (July)
    #[serde(default = "default_cutoff_month")]
    pub cutoff_month: u32,

    /// Default: 7
    #[serde(default = "default_cutoff_day")]
    pub cutoff_day: u32,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            cutoff_month: default_cutoff_month(),
            cutoff_day: default_cutoff_day(),
        }
    }
}

fn default_cutoff_month() -> u32 {
    7
}

fn default_cutoff_day() -> u32 {
    7
}

impl RetentionConfig {
    /// Get the scheduling interval as a Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 3600)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_hours == 0 {
            return Err(ConfigError::Validation(
                "retention.interval_hours must be at least 1".into(),
            ));
        }
        if self.report_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "retention.report_path cannot be empty".into(),
            ));
        }
        self.safety.validate()?;
        self.eligibility.validate()
    }
}

impl RetentionSafety {
    /// Get the inter-batch delay as a Duration.
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Entity cap for a single run, `None` when unlimited.
    pub fn entity_limit(&self) -> Option<u64> {
        (self.max_entities_per_run > 0).then_some(self.max_entities_per_run)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Validation(
                "retention.safety.batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl EligibilityConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        // 2024 is a leap year, so Feb 29 is accepted as a cutoff.
        if NaiveDate::from_ymd_opt(2024, self.cutoff_month, self.cutoff_day).is_none() {
            return Err(ConfigError::Validation(format!(
                "retention.eligibility cutoff {:02}-{:02} is not a valid month/day",
                self.cutoff_month, self.cutoff_day
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RetentionConfig::default();
        assert!(config.enabled);
        assert_eq!(config.interval_hours, 24);
        assert_eq!(config.report_path, PathBuf::from("retention-report.txt"));
        assert!(!config.safety.dry_run);
        assert_eq!(config.safety.batch_size, 5000);
        assert_eq!(config.safety.batch_delay_ms, 1000);
        assert_eq!(config.safety.entity_limit(), None);
        assert_eq!(config.eligibility.cutoff_month, 7);
        assert_eq!(config.eligibility.cutoff_day, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            enabled = false
            interval_hours = 12
            report_path = "/tmp/report.txt"

            [safety]
            dry_run = true
            batch_size = 500
            batch_delay_ms = 250
            max_entities_per_run = 10000

            [eligibility]
            cutoff_month = 8
            cutoff_day = 1
        "#;
        let config: RetentionConfig = toml::from_str(toml).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.interval(), Duration::from_secs(12 * 3600));
        assert!(config.safety.dry_run);
        assert_eq!(config.safety.batch_size, 500);
        assert_eq!(config.safety.batch_delay(), Duration::from_millis(250));
        assert_eq!(config.safety.entity_limit(), Some(10000));
        assert_eq!(config.eligibility.cutoff_month, 8);
        assert_eq!(config.eligibility.cutoff_day, 1);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = RetentionConfig::default();
        config.safety.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_invalid_cutoff_rejected() {
        let mut config = RetentionConfig::default();
        config.eligibility.cutoff_month = 2;
        config.eligibility.cutoff_day = 30;
        assert!(config.validate().is_err());

        config.eligibility.cutoff_day = 29;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<RetentionConfig, _> = toml::from_str("batch = 10");
        assert!(result.is_err());
    }
}
