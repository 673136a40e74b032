//! Configuration for the retention job.
//!
//! The job is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax. Datastore locations and
//! credentials should always come from the environment.
//!
//! # Example
//!
//! ```toml
//! [database]
//! type = "sqlite"
//! path = "${RETENTION_DB_PATH}"
//!
//! [retention]
//! report_path = "/var/log/retention/report.txt"
//!
//! [plan]
//! preset = "connection_cleanup"
//! ```

mod cascade;
mod database;
mod observability;
mod retention;

use std::path::Path;

pub use cascade::*;
pub use database::*;
pub use observability::*;
pub use retention::*;
use serde::{Deserialize, Serialize};

/// Root configuration.
///
/// Every section is optional; an empty file runs the connection cleanup
/// preset against an in-memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Datastore holding the collections the plan touches.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Batching, pacing, scheduling and reporting.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Cascade plan. Defaults to the `connection_cleanup` preset.
    #[serde(default = "default_plan")]
    pub plan: PlanConfig,

    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            retention: RetentionConfig::default(),
            plan: default_plan(),
            observability: ObservabilityConfig::default(),
        }
    }
}

fn default_plan() -> PlanConfig {
    PlanConfig {
        preset: Some(PlanPreset::ConnectionCleanup),
        ..Default::default()
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;

        let mut config: AppConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        if config.plan.preset.is_none()
            && config.plan.steps.is_empty()
            && config.plan.collection.is_none()
        {
            // An empty [plan] table behaves like an absent one.
            config.plan = default_plan();
        }

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.retention.validate()?;
        self.plan.resolve()?;
        Ok(())
    }

    /// The resolved cascade plan.
    pub fn plan_definition(&self) -> Result<PlanDefinition, ConfigError> {
        self.plan.resolve()
    }

    /// Generate the JSON schema for the configuration file.
    #[cfg(feature = "json-schema")]
    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(AppConfig)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand environment variables in the format `${VAR_NAME}`.
/// Skips commented lines (lines where content before the variable is a comment).
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');

        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };

            // Skip if this variable is inside a comment
            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);

            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_connection_preset() {
        let config = AppConfig::from_str("").unwrap();
        assert!(config.database.is_memory());
        let plan = config.plan_definition().unwrap();
        assert_eq!(plan.name, "connection_cleanup");
        assert_eq!(plan.collection, "Organization.Connections");
    }

    #[test]
    fn test_empty_plan_table_uses_connection_preset() {
        let config = AppConfig::from_str("[plan]\n").unwrap();
        assert_eq!(config.plan.preset, Some(PlanPreset::ConnectionCleanup));
    }

    #[test]
    fn test_full_config() {
        let config = AppConfig::from_str(
            r#"
            [database]
            type = "memory"

            [retention]
            report_path = "/tmp/out.txt"

            [retention.safety]
            batch_size = 100

            [plan]
            preset = "user_cleanup"

            [observability.logging]
            format = "json"
        "#,
        )
        .unwrap();
        assert_eq!(config.retention.safety.batch_size, 100);
        assert_eq!(config.plan_definition().unwrap().name, "user_cleanup");
        assert_eq!(config.observability.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_retention_section_rejected() {
        let result = AppConfig::from_str(
            r#"
            [retention.safety]
            batch_size = 0
        "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_unknown_section_rejected() {
        let result = AppConfig::from_str("[server]\nport = 8080\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_var_expansion() {
        temp_env::with_var("TEST_RETENTION_REPORT", Some("/srv/report.txt"), || {
            let result = expand_env_vars("report_path = \"${TEST_RETENTION_REPORT}\"").unwrap();
            assert_eq!(result, "report_path = \"/srv/report.txt\"");
        });
    }

    #[test]
    fn test_missing_env_var_is_error() {
        temp_env::with_var_unset("TEST_RETENTION_MISSING", || {
            let result = expand_env_vars("path = \"${TEST_RETENTION_MISSING}\"");
            assert!(matches!(result, Err(ConfigError::EnvVarNotFound(name)) if name == "TEST_RETENTION_MISSING"));
        });
    }

    #[test]
    fn test_env_var_in_comment_ignored() {
        let result = expand_env_vars("# path = \"${NONEXISTENT_VAR}\"").unwrap();
        assert_eq!(result, "# path = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_env_var_after_comment_ignored() {
        let result = expand_env_vars("key = \"value\" # ${NONEXISTENT_VAR}").unwrap();
        assert_eq!(result, "key = \"value\" # ${NONEXISTENT_VAR}");
    }

    #[test]
    fn test_plan_templates_survive_env_expansion() {
        let result = expand_env_vars("match = { \"id\" = \"{{id}}\" }").unwrap();
        assert_eq!(result, "match = { \"id\" = \"{{id}}\" }");
    }

    #[test]
    fn test_multiline_with_comments() {
        temp_env::with_var("TEST_MULTI", Some("value1"), || {
            let input = r#"key1 = "${TEST_MULTI}"
# key2 = "${NONEXISTENT}"
key3 = "literal""#;
            let result = expand_env_vars(input).unwrap();
            assert_eq!(
                result,
                r#"key1 = "value1"
# key2 = "${NONEXISTENT}"
key3 = "literal""#
            );
        });
    }
}
