//! Core Configuration
//!
//! Tunables for the session core plus the catalog seed, loadable from TOML
//! or JSON.
//!
//! ```toml
//! [meter]
//! interval_ms = 3000
//!
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 1000
//! factor = 2.0
//! max_delay_ms = 30000
//! jitter = 0.2
//!
//! [transport]
//! handshake_ms = 2000
//! open_timeout_ms = 15000
//! cores = ["xray", "v2fly"]
//!
//! [[servers]]
//! id = "1"
//! name = "US East"
//! location = "New York"
//! country = "United States"
//! country_code = "us"
//! tier = "free"
//! status = "online"
//! ping = 120
//! load = 65
//! core_type = "xray"
//! ```
//!
//! Every field is optional; missing values fall back to the defaults shown.

use crate::server::{CoreType, ServerDescriptor};
use crate::simulated::{DEFAULT_HANDSHAKE, SimulatedTransport};
use crate::supervisor::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Serde adapter storing a `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Traffic meter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            interval: crate::meter::DEFAULT_INTERVAL,
        }
    }
}

/// Transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Simulated handshake duration
    #[serde(rename = "handshake_ms", with = "duration_ms")]
    pub handshake: Duration,
    /// Upper bound on a single `open`
    #[serde(rename = "open_timeout_ms", with = "duration_ms")]
    pub open_timeout: Duration,
    /// Protocol families the backend accepts
    pub cores: Vec<CoreType>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake: DEFAULT_HANDSHAKE,
            open_timeout: Duration::from_secs(15),
            cores: CoreType::all().to_vec(),
        }
    }
}

impl TransportConfig {
    /// Build the simulated backend described by this config
    pub fn simulated(&self) -> SimulatedTransport {
        SimulatedTransport::new()
            .with_handshake(self.handshake)
            .with_cores(&self.cores)
    }
}

/// Runtime knobs handed to the session manager
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub meter_interval: Duration,
    pub open_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        CoreConfig::default().session_options()
    }
}

/// Complete core configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub meter: MeterConfig,
    pub retry: RetryPolicy,
    pub transport: TransportConfig,
    pub servers: Vec<ServerDescriptor>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            meter: MeterConfig::default(),
            retry: RetryPolicy::default(),
            transport: TransportConfig::default(),
            servers: ServerDescriptor::default_catalog(),
        }
    }
}

impl CoreConfig {
    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content)?,
            Some("json") => Self::from_json(&content)?,
            _ => return Err(ConfigError::UnsupportedFormat),
        };

        info!(
            "Loaded config from {} ({} servers)",
            path.display(),
            config.servers.len()
        );
        Ok(config)
    }

    /// Parse and validate TOML
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate JSON
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Write to `path`, format picked by extension
    pub fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => self.to_toml()?,
            Some("json") => self.to_json()?,
            _ => return Err(ConfigError::UnsupportedFormat),
        };
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.meter.interval.is_zero() {
            return Err(ConfigError::Invalid("meter interval must be positive".into()));
        }

        let retry = &self.retry;
        if retry.base_delay.is_zero() {
            return Err(ConfigError::Invalid("retry base delay must be positive".into()));
        }
        if !(retry.factor >= 1.0) {
            return Err(ConfigError::Invalid("retry factor must be at least 1.0".into()));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(ConfigError::Invalid("retry jitter must be within 0.0-1.0".into()));
        }
        if retry.max_delay < retry.base_delay {
            return Err(ConfigError::Invalid(
                "retry max delay is below the base delay".into(),
            ));
        }

        if self.transport.open_timeout.is_zero() {
            return Err(ConfigError::Invalid("open timeout must be positive".into()));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server id: {}",
                    server.id
                )));
            }
        }

        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            meter_interval: self.meter.interval,
            open_timeout: self.transport.open_timeout,
            retry: self.retry.clone(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format (expected .toml or .json)")]
    UnsupportedFormat,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.servers.len(), 6);
        assert_eq!(config.meter.interval, Duration::from_secs(3));
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = CoreConfig::default();
        let parsed = CoreConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = CoreConfig::default();
        let parsed = CoreConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = CoreConfig::from_toml(
            r#"
            [meter]
            interval_ms = 500

            [[servers]]
            id = "a"
            name = "Lab"
            "#,
        )
        .unwrap();

        assert_eq!(config.meter.interval, Duration::from_millis(500));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.servers.len(), 1);
        assert!(config.servers[0].is_online());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = CoreConfig::default();
        config.meter.interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = CoreConfig::default();
        config.retry.factor = 0.5;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.retry.jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.retry.max_delay = Duration::from_millis(10);
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.servers.push(ServerDescriptor::new("1", "Dup"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        let err = CoreConfig::from_file(Path::new("/nonexistent/config.yaml"));
        // Missing file is reported before the extension is looked at
        assert!(matches!(err, Err(ConfigError::Io(_))));

        let err = CoreConfig::default().write_to(Path::new("config.ini"));
        assert_eq!(err, Err(ConfigError::UnsupportedFormat));
    }

    #[test]
    fn test_session_options() {
        let options = CoreConfig::default().session_options();
        assert_eq!(options.meter_interval, Duration::from_secs(3));
        assert_eq!(options.open_timeout, Duration::from_secs(15));
    }
}
