//! Configuration for the FluxLite core.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::conditioner::SignalConditioner;
use crate::core::pipeline::PipelineConfig;
use crate::transport::ConnectionConfig;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend connection and reconnect policy
    pub connection: ConnectionConfig,

    /// Live pipeline parameters
    pub pipeline: PipelineConfig,

    /// Offline gain analysis defaults
    pub gain: GainSettings,

    /// Path for persisted statistics
    pub data_path: PathBuf,

    /// How often the live loop persists statistics (ms)
    #[serde(with = "duration_serde")]
    pub stats_flush_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fluxlite");

        Self {
            connection: ConnectionConfig::default(),
            pipeline: PipelineConfig::default(),
            gain: GainSettings::default(),
            data_path: data_dir,
            stats_flush_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, or defaults when it does not exist.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fluxlite")
            .join("config.json")
    }

    /// Where the live loop persists its counters.
    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        SignalConditioner::new(self.pipeline.conditioner)
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        if self.pipeline.aggregator.cache_size == 0 {
            return Err(ConfigError::InvalidValue(
                "cache_size must be at least 1".to_string(),
            ));
        }
        if self.connection.port == 0 {
            return Err(ConfigError::InvalidValue("port must not be 0".to_string()));
        }
        if self.gain.epsilon_pct.is_nan() || self.gain.epsilon_pct < 0.0 {
            return Err(ConfigError::InvalidValue(
                "epsilon_pct must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Defaults for the offline gain analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GainSettings {
    /// Baseline room temperature (°F)
    pub room_temp_f: f64,
    /// Rows with |inputChangePct| below this are excluded (percent)
    pub epsilon_pct: f64,
    /// Default coefficient sweep, `start:stop:step` or a comma list
    pub sweep: String,
    /// Worker threads; 0 picks the available parallelism
    pub workers: usize,
    /// Per-request timeout of the HTTP backend (ms)
    #[serde(with = "duration_serde")]
    pub backend_timeout: Duration,
}

impl Default for GainSettings {
    fn default() -> Self {
        Self {
            room_temp_f: 76.0,
            epsilon_pct: 0.2,
            sweep: "0.001:0.010:0.001".to_string(),
            workers: 0,
            backend_timeout: Duration::from_secs(300),
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::InvalidValue(e) => write!(f, "Invalid value: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration as integer milliseconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.connection.address(), "localhost:3000");
        assert_eq!(config.pipeline.aggregator.cache_size, 512);
        assert_eq!(config.pipeline.conditioner.alpha, 0.2);
        assert_eq!(config.pipeline.conditioner.fz_threshold_n, 22.0);
        assert_eq!(config.connection.backoff.max_ms, 5_000);
        assert_eq!(config.gain.room_temp_f, 76.0);
        assert_eq!(config.gain.sweep, "0.001:0.010:0.001");
        assert_eq!(config.gain.backend_timeout, Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let json = r#"{"connection": {"host": "10.0.0.2", "port": 4000,
            "backoff": {"initial_ms": 100, "max_ms": 1000, "multiplier": 2.0, "jitter": 0.0}},
            "stats_flush_interval": 1500}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.connection.address(), "10.0.0.2:4000");
        assert_eq!(config.stats_flush_interval, Duration::from_millis(1500));
        assert_eq!(config.pipeline.aggregator.cache_size, 512);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.pipeline.conditioner.alpha = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));

        let mut config = Config::default();
        config.pipeline.aggregator.cache_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("fluxlite-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        let mut config = Config::default();
        config.connection.port = 3100;
        config.pipeline.forward_only_while_recording = true;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.connection.port, 3100);
        assert!(loaded.pipeline.forward_only_while_recording);
        let _ = std::fs::remove_dir_all(dir);
    }
}
