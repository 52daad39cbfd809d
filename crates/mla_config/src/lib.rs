//! `mla_config` - Configuration parsing and validation
//!
//! This crate provides:
//! - TOML configuration parsing
//! - Default value handling
//! - Environment variable overrides
//! - Path expansion (`~/` to home directory)
//! - Auto-discovery from standard config paths
//! - Source (monitored host) inventory definitions
//!
//! Configuration errors are rejected here at load time; the scanner never
//! sees a half-valid source profile or an empty risk rule.

use mla_parse::{RiskLevel, RiskRuleSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Source '{source_name}' is missing required field: {field}")]
    MissingField {
        source_name: String,
        field: &'static str,
    },

    #[error("Invalid risk rules: {0}")]
    RuleError(#[from] mla_parse::RuleError),
}

/// Top-level configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MlaConfig {
    /// Global settings
    pub global: GlobalConfig,

    /// Monitored source inventory, keyed by display name
    pub sources: HashMap<String, SourceConfig>,

    /// Scan tuning
    pub scan: ScanConfig,

    /// Risk rule lists (High/Medium/Low), evaluated in order
    pub rules: RiskRuleSet,
}

/// Global configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Path to the `DuckDB` database file
    pub db_path: PathBuf,

    /// Daemon scan interval in seconds
    pub scan_interval_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Enable JSON logging
    pub json_logs: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            scan_interval_secs: 300,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Default database path using XDG directories
fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mla")
        .join("mla.duckdb")
}

impl GlobalConfig {
    pub fn expand_paths(&mut self) {
        self.db_path = expand_path(&self.db_path);
    }
}

/// Expand tilde in path to home directory
#[must_use]
pub fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    path.to_path_buf()
}

/// How candidate log files are chosen from a source's log directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Every file modified after the source's checkpoint watermark,
    /// processed oldest-first.
    #[default]
    Incremental,
    /// Only the single most-recently-modified file.
    LatestOnly,
}

/// Connection profile for one monitored MySQL host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Stable numeric id; activity rows and checkpoints key on this
    pub source_id: i64,

    /// SSH hostname or IP
    pub host: String,

    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// SSH username
    pub user: String,

    /// SSH password (alternative to `key_path`)
    #[serde(default)]
    pub password: Option<String>,

    /// SSH private key path (alternative to `password`)
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Remote directory holding general query log files
    pub log_directory: String,

    /// Whether this source is scanned
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Candidate file selection policy
    #[serde(default)]
    pub selection: SelectionPolicy,
}

fn default_true() -> bool {
    true
}

fn default_ssh_port() -> u16 {
    22
}

/// Scan tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Records per storage batch
    pub batch_size: usize,

    /// Log filename suffix to match (case-insensitive)
    pub file_suffix: String,

    /// SSH connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Risk levels that are persisted; records outside the set are
    /// discarded after classification
    pub allowed_risk_levels: Vec<RiskLevel>,

    /// Carry session context across files within one scan. `false`
    /// resets per file, so a thread connecting in one file and querying in
    /// the next loses its identity.
    pub carry_session_across_files: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            file_suffix: ".log".to_string(),
            connect_timeout_secs: 10,
            allowed_risk_levels: vec![RiskLevel::High, RiskLevel::Medium, RiskLevel::Low],
            carry_session_across_files: true,
        }
    }
}

impl ScanConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl MlaConfig {
    /// Discover configuration from standard paths.
    ///
    /// Search order: `$MLA_CONFIG`, `~/.config/mla/config.toml`,
    /// `./mla.toml`. Falls back to defaults when no file exists.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if a discovered file fails to load.
    pub fn discover() -> Result<Self, ConfigError> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(path) = std::env::var("MLA_CONFIG") {
            candidates.push(PathBuf::from(path));
        }
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("mla").join("config.toml"));
        }
        candidates.push(PathBuf::from("mla.toml"));

        for path in candidates {
            if path.exists() {
                info!(path = %path.display(), "Loading config");
                return Self::load(&path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Discover config and apply environment variable overrides.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if config discovery or validation fails.
    pub fn discover_with_env() -> Result<Self, ConfigError> {
        let mut config = Self::discover()?;
        config.apply_env_overrides();
        config.expand_all_paths();
        Ok(config)
    }

    /// Load configuration from a specific TOML file.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: MlaConfig = toml::from_str(&content)?;
        config.expand_all_paths();
        config.validate()?;
        Ok(config)
    }

    /// Expand all paths in configuration (resolve `~/` to home directory)
    pub fn expand_all_paths(&mut self) {
        self.global.expand_paths();
        for source in self.sources.values_mut() {
            if let Some(ref mut key_path) = source.key_path {
                *key_path = expand_path(key_path);
            }
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MLA_DB_PATH") {
            self.global.db_path = expand_path(&PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("MLA_LOG_LEVEL") {
            self.global.log_level = val;
        }
        if let Ok(val) = std::env::var("MLA_SCAN_INTERVAL") {
            if let Ok(secs) = val.parse() {
                self.global.scan_interval_secs = secs;
            }
        }
    }

    /// Validate configuration.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when validation rules are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global.scan_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "scan_interval_secs must be > 0".to_string(),
            ));
        }

        if self.scan.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "scan.batch_size must be > 0".to_string(),
            ));
        }

        if self.scan.file_suffix.is_empty() {
            return Err(ConfigError::ValidationError(
                "scan.file_suffix must not be empty".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.global.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.global.log_level,
                valid_levels.join(", ")
            )));
        }

        for (name, source) in &self.sources {
            if source.host.is_empty() {
                return Err(ConfigError::MissingField {
                    source_name: name.clone(),
                    field: "host",
                });
            }
            if source.user.is_empty() {
                return Err(ConfigError::MissingField {
                    source_name: name.clone(),
                    field: "user",
                });
            }
            if source.log_directory.is_empty() {
                return Err(ConfigError::MissingField {
                    source_name: name.clone(),
                    field: "log_directory",
                });
            }
            if source.password.is_none() && source.key_path.is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Source '{name}' needs either a password or a key_path"
                )));
            }
        }

        self.rules.validate()?;

        Ok(())
    }

    /// Get daemon scan interval as Duration
    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.global.scan_interval_secs)
    }

    /// Sources that are enabled for scanning, sorted by name for a stable
    /// scan order.
    #[must_use]
    pub fn enabled_sources(&self) -> Vec<(&String, &SourceConfig)> {
        let mut sources: Vec<_> = self.sources.iter().filter(|(_, s)| s.enabled).collect();
        sources.sort_by_key(|(name, _)| name.as_str());
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_source() -> SourceConfig {
        SourceConfig {
            source_id: 1,
            host: "db1.internal".to_string(),
            port: 22,
            user: "audit".to_string(),
            password: Some("secret".to_string()),
            key_path: None,
            log_directory: "/var/log/mysql".to_string(),
            enabled: true,
            selection: SelectionPolicy::Incremental,
        }
    }

    #[test]
    fn test_default_config() {
        let config = MlaConfig::default();
        assert_eq!(config.global.scan_interval_secs, 300);
        assert_eq!(config.global.log_level, "info");
        assert_eq!(config.scan.batch_size, 500);
        assert_eq!(config.scan.file_suffix, ".log");
        assert!(config.scan.carry_session_across_files);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_scan_interval() {
        let mut config = MlaConfig::default();
        config.global.scan_interval_secs = 0;
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("scan_interval_secs"));
    }

    #[test]
    fn test_validation_batch_size() {
        let mut config = MlaConfig::default();
        config.scan.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_missing_credentials() {
        let mut config = MlaConfig::default();
        let mut source = sample_source();
        source.password = None;
        config.sources.insert("db1".to_string(), source);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("password or a key_path"));
    }

    #[test]
    fn test_validation_missing_host() {
        let mut config = MlaConfig::default();
        let mut source = sample_source();
        source.host = String::new();
        config.sources.insert("db1".to_string(), source);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("host"));
    }

    #[test]
    fn test_validation_empty_rule_rejected() {
        let mut config = MlaConfig::default();
        config.rules.high.push(mla_parse::RiskRule::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_text = r#"
            [global]
            db_path = "/tmp/mla.duckdb"
            scan_interval_secs = 60

            [scan]
            batch_size = 100
            allowed_risk_levels = ["High", "Medium"]

            [sources.primary]
            source_id = 1
            host = "10.0.0.5"
            user = "audit"
            password = "secret"
            log_directory = "/data/general_log"
            selection = "latest_only"

            [[rules.High]]
            type = "DDL"

            [[rules.High]]
            keyword = "payroll"
        "#;
        let config: MlaConfig = toml::from_str(toml_text).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.global.scan_interval_secs, 60);
        assert_eq!(config.scan.batch_size, 100);
        assert_eq!(
            config.scan.allowed_risk_levels,
            vec![RiskLevel::High, RiskLevel::Medium]
        );
        let source = &config.sources["primary"];
        assert_eq!(source.source_id, 1);
        assert_eq!(source.port, 22);
        assert_eq!(source.selection, SelectionPolicy::LatestOnly);
        assert!(source.enabled);
        assert_eq!(config.rules.high.len(), 2);
    }

    #[test]
    fn test_enabled_sources_sorted_and_filtered() {
        let mut config = MlaConfig::default();
        let mut disabled = sample_source();
        disabled.enabled = false;
        config.sources.insert("zeta".to_string(), sample_source());
        config.sources.insert("alpha".to_string(), sample_source());
        config.sources.insert("off".to_string(), disabled);
        let names: Vec<_> = config
            .enabled_sources()
            .into_iter()
            .map(|(n, _)| n.clone())
            .collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn test_expand_path() {
        let path = expand_path(Path::new("~/.ssh/id_rsa"));
        if dirs::home_dir().is_some() {
            assert!(!path.to_string_lossy().starts_with('~'));
        }
        assert_eq!(
            expand_path(Path::new("/absolute/path")),
            PathBuf::from("/absolute/path")
        );
    }
}
