//! Daemon configuration parsing.
//!
//! Configuration is TOML with serde defaults for every field, so an empty
//! file (or no file at all) yields a runnable local setup. The matcher
//! weights and auto-approve threshold live here because they are
//! uncalibrated defaults that deployments are expected to tune.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use siv_core::MatchWeights;
use thiserror::Error;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The parsed values are out of range.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// OCR collaborator settings.
    #[serde(default)]
    pub ocr: OcrConfig,

    /// Confidence matcher settings.
    #[serde(default)]
    pub matcher: MatcherConfig,
}

impl DaemonConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let matcher = &self.matcher;
        if !(0.0..=1.0).contains(&matcher.auto_approve_threshold) {
            return Err(ConfigError::Validation(format!(
                "auto_approve_threshold must be within [0.0, 1.0], got {}",
                matcher.auto_approve_threshold
            )));
        }
        for (label, weight) in [
            ("name_weight", matcher.name_weight),
            ("external_id_weight", matcher.external_id_weight),
            ("institution_weight", matcher.institution_weight),
        ] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(ConfigError::Validation(format!(
                    "{label} must be within [0.0, 1.0], got {weight}"
                )));
            }
        }
        if self.ocr.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "ocr timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP server and database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Path of the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            database_path: default_database_path(),
        }
    }
}

/// OCR collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// Per-call timeout for the external engine, in milliseconds.
    #[serde(default = "default_ocr_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_ocr_timeout_ms(),
        }
    }
}

/// Confidence matcher settings.
///
/// The defaults (0.4/0.3/0.3 and a 0.8 threshold) carry no documented
/// calibration; tune them from labeled review outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Contribution of a satisfied name match.
    #[serde(default = "default_name_weight")]
    pub name_weight: f64,

    /// Contribution of a satisfied external-id match.
    #[serde(default = "default_external_id_weight")]
    pub external_id_weight: f64,

    /// Contribution of a satisfied institution match.
    #[serde(default = "default_institution_weight")]
    pub institution_weight: f64,

    /// Confidence at or above which verification is auto-approved.
    #[serde(default = "default_auto_approve_threshold")]
    pub auto_approve_threshold: f64,
}

impl MatcherConfig {
    /// The weights as the core matcher consumes them.
    #[must_use]
    pub const fn weights(&self) -> MatchWeights {
        MatchWeights {
            name: self.name_weight,
            external_id: self.external_id_weight,
            institution: self.institution_weight,
        }
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            name_weight: default_name_weight(),
            external_id_weight: default_external_id_weight(),
            institution_weight: default_institution_weight(),
            auto_approve_threshold: default_auto_approve_threshold(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8084".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("siv.db")
}

const fn default_ocr_timeout_ms() -> u64 {
    30_000
}

const fn default_name_weight() -> f64 {
    0.4
}

const fn default_external_id_weight() -> f64 {
    0.3
}

const fn default_institution_weight() -> f64 {
    0.3
}

const fn default_auto_approve_threshold() -> f64 {
    siv_core::AUTO_APPROVE_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:8084");
        assert_eq!(config.ocr.timeout_ms, 30_000);
        assert!((config.matcher.auto_approve_threshold - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_partial_override() {
        let config = DaemonConfig::from_toml(
            r#"
            [matcher]
            auto_approve_threshold = 0.9

            [ocr]
            timeout_ms = 5000
            "#,
        )
        .unwrap();
        assert!((config.matcher.auto_approve_threshold - 0.9).abs() < 1e-9);
        assert_eq!(config.ocr.timeout_ms, 5_000);
        // Untouched sections keep their defaults.
        assert!((config.matcher.name_weight - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let result = DaemonConfig::from_toml(
            r#"
            [matcher]
            auto_approve_threshold = 1.5
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_zero_ocr_timeout_rejected() {
        let result = DaemonConfig::from_toml(
            r#"
            [ocr]
            timeout_ms = 0
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
