//! Controller configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default aggregation timeout: 23h50m, so a hung run ends before the next daily tick.
pub const DEFAULT_AGGREGATION_TIMEOUT_SECS: u64 = 23 * 3600 + 50 * 60;

/// Default timeout for the listener stop/resume scripts.
pub const DEFAULT_LISTENER_TIMEOUT_SECS: u64 = 60;

const ONE_DAY_SECS: u64 = 24 * 3600;

/// Configuration for one controller invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Directory that relative script names are resolved against.
    pub scripts_dir: PathBuf,

    /// State file path. Defaults to `aggregation_info` inside `scripts_dir`.
    pub state_file: Option<PathBuf>,

    /// Aggregation script name or path.
    pub aggregation_script: String,

    /// Script that stops the listener.
    pub stop_listener_script: String,

    /// Script that resumes the listener.
    pub resume_listener_script: String,

    /// Timeout for the aggregation script, in seconds.
    pub aggregation_timeout_secs: u64,

    /// Timeout for each listener script, in seconds.
    pub listener_timeout_secs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            scripts_dir: default_scripts_dir(),
            state_file: None,
            aggregation_script: "run_aggregator".to_string(),
            stop_listener_script: "stop_box_listener".to_string(),
            resume_listener_script: "resume_box_listener".to_string(),
            aggregation_timeout_secs: DEFAULT_AGGREGATION_TIMEOUT_SECS,
            listener_timeout_secs: DEFAULT_LISTENER_TIMEOUT_SECS,
        }
    }
}

/// Directory containing the running executable, or the working directory.
fn default_scripts_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl AggregatorConfig {
    /// Load from a JSON file, or defaults when no file is given.
    ///
    /// Fields missing from the file keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check timeouts and script names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregation_timeout_secs == 0 || self.listener_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than zero".to_string()));
        }
        if self.aggregation_timeout_secs >= ONE_DAY_SECS {
            return Err(ConfigError::Invalid(format!(
                "aggregation timeout of {}s must stay under one day",
                self.aggregation_timeout_secs
            )));
        }
        for (field, name) in [
            ("aggregation_script", &self.aggregation_script),
            ("stop_listener_script", &self.stop_listener_script),
            ("resume_listener_script", &self.resume_listener_script),
        ] {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }

    /// Resolve a script name against `scripts_dir`. Absolute paths are kept.
    pub fn script_path(&self, name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.scripts_dir.join(path)
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.scripts_dir.join("aggregation_info"))
    }

    pub fn aggregation_script_path(&self) -> PathBuf {
        self.script_path(&self.aggregation_script)
    }

    pub fn stop_listener_script_path(&self) -> PathBuf {
        self.script_path(&self.stop_listener_script)
    }

    pub fn resume_listener_script_path(&self) -> PathBuf {
        self.script_path(&self.resume_listener_script)
    }

    pub fn aggregation_timeout(&self) -> Duration {
        Duration::from_secs(self.aggregation_timeout_secs)
    }

    pub fn listener_timeout(&self) -> Duration {
        Duration::from_secs(self.listener_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = AggregatorConfig::default();
        assert_eq!(config.aggregation_script, "run_aggregator");
        assert_eq!(config.stop_listener_script, "stop_box_listener");
        assert_eq!(config.resume_listener_script, "resume_box_listener");
        assert_eq!(config.aggregation_timeout(), Duration::from_secs(85_800));
        assert_eq!(config.listener_timeout(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_script_paths_resolve_against_scripts_dir() {
        let config = AggregatorConfig {
            scripts_dir: PathBuf::from("/opt/agg"),
            stop_listener_script: "/usr/local/bin/stop".to_string(),
            ..Default::default()
        };
        assert_eq!(config.aggregation_script_path(), PathBuf::from("/opt/agg/run_aggregator"));
        assert_eq!(config.stop_listener_script_path(), PathBuf::from("/usr/local/bin/stop"));
        assert_eq!(config.state_path(), PathBuf::from("/opt/agg/aggregation_info"));
    }

    #[test]
    fn test_explicit_state_file() {
        let config = AggregatorConfig {
            state_file: Some(PathBuf::from("/var/lib/agg/state.json")),
            ..Default::default()
        };
        assert_eq!(config.state_path(), PathBuf::from("/var/lib/agg/state.json"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = AggregatorConfig {
            listener_timeout_secs: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_full_day_timeout() {
        let config = AggregatorConfig {
            aggregation_timeout_secs: 24 * 3600,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_script() {
        let config = AggregatorConfig {
            resume_listener_script: " ".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("resume_listener_script"));
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aggregator.json");
        std::fs::write(&path, r#"{"scripts_dir": "/srv/agg", "listener_timeout_secs": 30}"#).unwrap();

        let config = AggregatorConfig::load(Some(&path)).expect("load failed");
        assert_eq!(config.scripts_dir, PathBuf::from("/srv/agg"));
        assert_eq!(config.listener_timeout_secs, 30);
        assert_eq!(config.aggregation_script, "run_aggregator");
    }

    #[test]
    fn test_load_without_file_is_default() {
        assert_eq!(AggregatorConfig::load(None).unwrap(), AggregatorConfig::default());
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aggregator.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            AggregatorConfig::load(Some(&path)),
            Err(ConfigError::Parse { .. })
        ));
    }
}
