//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RSCX_CONFIG or --config)
//! 3. Environment variables

use rscx_core::DEFAULT_MAX_MICROSTEPS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-session settings.
    pub session: SessionConfig,
    /// Routing settings.
    pub router: RouterConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RSCX_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.session.apply_env_overrides();
        self.router.apply_env_overrides();
    }

    /// Checks values that would make sessions unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time in milliseconds before a waiting session is suspended (0 = never).
    pub idle_timeout_ms: u64,
    /// Microsteps allowed within one macrostep before the run is aborted.
    pub max_microsteps: usize,
    /// Emit entered/exited/transition trace records.
    pub tracing_enabled: bool,
    /// Report a closed mailbox as an error instead of a normal end.
    pub throw_on_error: bool,
    /// Directory for suspended session snapshots. Kept in memory when unset.
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 300_000,
            max_microsteps: DEFAULT_MAX_MICROSTEPS,
            tracing_enabled: false,
            throw_on_error: false,
            snapshot_dir: None,
        }
    }
}

impl SessionConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("RSCX_IDLE_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.idle_timeout_ms = ms;
            }
        }

        if let Ok(max) = std::env::var("RSCX_MAX_MICROSTEPS") {
            if let Ok(n) = max.parse() {
                self.max_microsteps = n;
            }
        }

        if let Ok(tracing) = std::env::var("RSCX_TRACING") {
            self.tracing_enabled = tracing == "1" || tracing.to_lowercase() == "true";
        }

        if let Ok(throw) = std::env::var("RSCX_THROW_ON_ERROR") {
            self.throw_on_error = throw == "1" || throw.to_lowercase() == "true";
        }

        if let Ok(dir) = std::env::var("RSCX_SNAPSHOT_DIR") {
            self.snapshot_dir = Some(PathBuf::from(dir));
        }
    }

    /// Returns the idle timeout, or `None` when idle suspension is off.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_microsteps == 0 {
            return Err(ConfigError::ValidationError(
                "session.max_microsteps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Mailbox depth above which a warning is logged (0 = never).
    pub mailbox_warn_depth: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mailbox_warn_depth: 10_000,
        }
    }
}

impl RouterConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(depth) = std::env::var("RSCX_MAILBOX_WARN_DEPTH") {
            if let Ok(n) = depth.parse() {
                self.mailbox_warn_depth = n;
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session.max_microsteps, 1000);
        assert_eq!(
            config.session.idle_timeout(),
            Some(Duration::from_secs(300))
        );
        assert!(!config.session.throw_on_error);
        assert!(config.session.snapshot_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_idle_timeout_disables_suspend() {
        let session = SessionConfig {
            idle_timeout_ms: 0,
            ..SessionConfig::default()
        };
        assert_eq!(session.idle_timeout(), None);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rscx.yaml");

        let mut config = Config::default();
        config.session.idle_timeout_ms = 250;
        config.session.snapshot_dir = Some(dir.path().join("snapshots"));
        config.router.mailbox_warn_depth = 5;
        config.save(&path).unwrap();

        let parsed = Config::from_file(&path).unwrap();
        assert_eq!(parsed.session.idle_timeout_ms, 250);
        assert_eq!(parsed.session.snapshot_dir, config.session.snapshot_dir);
        assert_eq!(parsed.router.mailbox_warn_depth, 5);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.yaml");
        std::fs::write(&path, "session:\n  tracing_enabled: true\n").unwrap();

        let parsed = Config::from_file(&path).unwrap();
        assert!(parsed.session.tracing_enabled);
        assert_eq!(parsed.session.max_microsteps, 1000);
        assert_eq!(parsed.router.mailbox_warn_depth, 10_000);
    }

    #[test]
    fn test_missing_and_invalid_files() {
        let dir = tempdir().unwrap();
        let missing = Config::from_file(dir.path().join("nope.yaml"));
        assert!(matches!(missing, Err(ConfigError::IoError(_, _))));

        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "session: [1, 2").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::ParseError(_, _))
        ));
    }

    #[test]
    fn test_validation_rejects_zero_microsteps() {
        let mut config = Config::default();
        config.session.max_microsteps = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_microsteps"));
    }
}
