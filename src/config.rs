//! Configuration.
//!
//! Every section has defaults, so a config file only names what it changes.
//! Loading order: JSON file, then `GRIDRUSH_*` environment overrides, then
//! [`NetcodeConfig::validate`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::ClientConfig;
use crate::game::simulation::GridConfig;
use crate::network::delta::DeltaConfig;
use crate::network::server::ServerConfig;
use crate::telemetry::MetricsThresholds;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid JSON for the schema
    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    /// Environment override could not be parsed
    #[error("Invalid value {value:?} for {key}")]
    InvalidEnv {
        /// Variable name
        key: String,
        /// Raw value
        value: String,
    },

    /// Values are inconsistent
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetcodeConfig {
    /// Server loop
    pub server: ServerConfig,
    /// Delta compression
    pub delta: DeltaConfig,
    /// Client components
    pub client: ClientConfig,
    /// Reference simulation
    pub simulation: GridConfig,
    /// Client render rate (Hz)
    pub render_rate: u32,
    /// Telemetry limits
    pub thresholds: MetricsThresholds,
}

impl Default for NetcodeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            delta: DeltaConfig::default(),
            client: ClientConfig::default(),
            simulation: GridConfig::default(),
            render_rate: 60,
            thresholds: MetricsThresholds::default(),
        }
    }
}

impl NetcodeConfig {
    /// Parse from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Apply `GRIDRUSH_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply overrides from `(key, value)` pairs. Unknown keys are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "GRIDRUSH_TICK_RATE" => self.server.tick_rate = parse(key, value)?,
                "GRIDRUSH_FULL_SNAPSHOT_INTERVAL" => self.server.full_snapshot_interval = parse(key, value)?,
                "GRIDRUSH_INTERPOLATION_DELAY_MS" => self.client.state.interpolation_delay_ms = parse(key, value)?,
                "GRIDRUSH_CORRECTION_THRESHOLD" => self.client.rollback.threshold = parse(key, value)?,
                "GRIDRUSH_RENDER_RATE" => self.render_rate = parse(key, value)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.server;
        if s.min_tick_rate == 0 || s.min_tick_rate > s.max_tick_rate {
            return Err(ConfigError::Invalid(format!(
                "tick rate bounds {}..{} are not ordered",
                s.min_tick_rate, s.max_tick_rate
            )));
        }
        if !(s.min_tick_rate..=s.max_tick_rate).contains(&s.tick_rate) {
            return Err(ConfigError::Invalid(format!(
                "tick rate {} outside {}..{}",
                s.tick_rate, s.min_tick_rate, s.max_tick_rate
            )));
        }
        if s.full_snapshot_interval == 0 {
            return Err(ConfigError::Invalid("full snapshot interval must be positive".into()));
        }
        if self.render_rate == 0 {
            return Err(ConfigError::Invalid("render rate must be positive".into()));
        }

        let state = &self.client.state;
        if state.snapshot_retention_ms == 0 || state.prediction_retention_ms == 0 {
            return Err(ConfigError::Invalid("retention windows must be positive".into()));
        }

        let rb = &self.client.rollback;
        if !(rb.threshold > 0.0 && rb.threshold <= rb.replay_threshold) {
            return Err(ConfigError::Invalid(format!(
                "correction threshold {} must be positive and at most the replay threshold {}",
                rb.threshold, rb.replay_threshold
            )));
        }
        if rb.frame_ms == 0 || rb.frame_ms > rb.max_smoothing_ms {
            return Err(ConfigError::Invalid("smoothing bounds are not ordered".into()));
        }

        if self.simulation.cols == 0 || self.simulation.rows == 0 {
            return Err(ConfigError::Invalid("board must have at least one cell".into()));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        NetcodeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = NetcodeConfig::from_json_str(
            r#"{ "server": { "tick_rate": 25 }, "client": { "rollback": { "threshold": 1.5 } } }"#,
        )
        .unwrap();
        assert_eq!(config.server.tick_rate, 25);
        assert_eq!(config.server.full_snapshot_interval, 20);
        assert_eq!(config.client.rollback.threshold, 1.5);
        assert_eq!(config.client.rollback.max_smoothing_ms, 50);
        assert_eq!(config.render_rate, 60);
    }

    #[test]
    fn test_bad_json_rejected() {
        assert!(matches!(
            NetcodeConfig::from_json_str("{ \"server\": 3 }"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = NetcodeConfig::default();
        config
            .apply_overrides([
                ("GRIDRUSH_TICK_RATE", "30"),
                ("GRIDRUSH_INTERPOLATION_DELAY_MS", " 80 "),
                ("GRIDRUSH_CORRECTION_THRESHOLD", "2.5"),
                ("HOME", "/root"),
            ])
            .unwrap();
        assert_eq!(config.server.tick_rate, 30);
        assert_eq!(config.client.state.interpolation_delay_ms, 80);
        assert_eq!(config.client.rollback.threshold, 2.5);

        let err = config.apply_overrides([("GRIDRUSH_TICK_RATE", "fast")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_validate_catches_inconsistency() {
        let mut config = NetcodeConfig::default();
        config.server.tick_rate = 60;
        assert!(config.validate().is_err());

        let mut config = NetcodeConfig::default();
        config.client.rollback.threshold = 9.0;
        assert!(config.validate().is_err());

        let mut config = NetcodeConfig::default();
        config.server.full_snapshot_interval = 0;
        assert!(config.validate().is_err());
    }
}
