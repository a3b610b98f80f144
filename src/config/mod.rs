//! Configuration management for QUIC connections
//!
//! Settings are layered: built-in defaults, then an optional file, then
//! `QUICORE_*` environment variables (for example
//! `QUICORE_CONNECTION__IDLE_TIMEOUT_MS=5000`).

use crate::quic::error::{QuicError, Result};
use crate::quic::flow_control::FlowControlConfig;
use crate::quic::packet::QUIC_VERSION_1;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::Level;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "QUICORE";

/// Main QUIC configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuicConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Connection-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Close after this long without receiving anything, in milliseconds
    pub idle_timeout_ms: u64,
    /// Fail the handshake if it has not completed after this long
    pub handshake_timeout_ms: u64,
    /// Age at which an unacknowledged packet is resent
    pub resend_threshold_ms: u64,
    /// Period of the resend timer
    pub timer_interval_ms: u64,
    /// Ack delay is encoded as microseconds shifted right by this
    pub ack_delay_exponent: u8,
    /// Length of locally issued connection ids
    pub local_cid_len: usize,
    /// Initial flow control window size
    pub initial_max_data: u64,
    /// Initial stream flow control window size
    pub initial_max_stream_data: u64,
    /// QUIC version to speak
    pub version: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,      // 30 seconds
            handshake_timeout_ms: 10_000, // 10 seconds
            resend_threshold_ms: 500,
            timer_interval_ms: 10,
            ack_delay_exponent: 3,
            local_cid_len: 8,
            initial_max_data: 1024 * 1024,       // 1MB
            initial_max_stream_data: 256 * 1024, // 256KB
            version: QUIC_VERSION_1,
        }
    }
}

impl ConnectionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn resend_threshold(&self) -> Duration {
        Duration::from_millis(self.resend_threshold_ms)
    }

    pub fn timer_interval(&self) -> Duration {
        Duration::from_millis(self.timer_interval_ms)
    }

    pub fn flow_control(&self) -> FlowControlConfig {
        FlowControlConfig {
            initial_max_data: self.initial_max_data,
            initial_max_stream_data: self.initial_max_stream_data,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn or error
    pub level: String,
    /// Colored output
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Get tracing level
    pub fn tracing_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

impl QuicConfig {
    /// Load configuration from file, with environment overrides on top
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Self::default())?)
            .add_source(::config::File::from(path))
            .add_source(Self::env_source())
            .build()?
            .try_deserialize::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `QUICORE_*` environment variables
    pub fn load_from_env() -> Result<Self> {
        let config = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Self::default())?)
            .add_source(Self::env_source())
            .build()?
            .try_deserialize::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    fn env_source() -> ::config::Environment {
        ::config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let connection = &self.connection;
        if connection.idle_timeout_ms == 0 {
            return Err(QuicError::Config("idle_timeout_ms must be greater than 0".to_string()));
        }

        if connection.handshake_timeout_ms == 0 {
            return Err(QuicError::Config("handshake_timeout_ms must be greater than 0".to_string()));
        }

        if connection.resend_threshold_ms == 0 || connection.timer_interval_ms == 0 {
            return Err(QuicError::Config("resend timer settings must be greater than 0".to_string()));
        }

        if !(4..=16).contains(&connection.local_cid_len) {
            return Err(QuicError::Config(format!(
                "local_cid_len {} outside 4..=16",
                connection.local_cid_len
            )));
        }

        if connection.ack_delay_exponent > 20 {
            return Err(QuicError::Config("ack_delay_exponent must be at most 20".to_string()));
        }

        if connection.version != QUIC_VERSION_1 {
            return Err(QuicError::Config(format!("unsupported version 0x{:08x}", connection.version)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = QuicConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection.resend_threshold(), Duration::from_millis(500));
        assert_eq!(config.logging.tracing_level(), Level::INFO);
    }

    #[test]
    fn test_config_validation() {
        let mut config = QuicConfig::default();
        config.connection.idle_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = QuicConfig::default();
        config.connection.local_cid_len = 20;
        assert!(config.validate().is_err());

        let mut config = QuicConfig::default();
        config.connection.ack_delay_exponent = 21;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = std::env::temp_dir().join(format!("quicore-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[connection]\nidle_timeout_ms = 5000\nlocal_cid_len = 12\n\n[logging]\nlevel = \"debug\"").unwrap();
        drop(file);

        let config = QuicConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.connection.idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.connection.local_cid_len, 12);
        // untouched keys keep their defaults
        assert_eq!(config.connection.timer_interval_ms, 10);
        assert_eq!(config.logging.tracing_level(), Level::DEBUG);
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = QuicConfig::default();
        config.connection.ack_delay_exponent = 5;
        let json = serde_json::to_string(&config).unwrap();
        let back: QuicConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.connection.ack_delay_exponent, 5);

        // missing sections fall back to defaults
        let partial: QuicConfig = serde_json::from_str(r#"{"logging":{"level":"warn"}}"#).unwrap();
        assert_eq!(partial.connection.idle_timeout_ms, 30_000);
        assert_eq!(partial.logging.tracing_level(), Level::WARN);
        assert!(partial.logging.ansi);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let path = std::env::temp_dir().join(format!("quicore-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[connection]\nlocal_cid_len = 2\n").unwrap();
        let result = QuicConfig::load_from_file(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(QuicError::Config(_))));
    }
}
