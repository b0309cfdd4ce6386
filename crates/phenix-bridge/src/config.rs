use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use phenix_crypto::rotator::RotationConfig;
use phenix_protocol::codec::{FRAME_OVERHEAD, MAX_PAYLOAD_LEN};

use crate::session::SessionConfig;

/// Smallest payload limit that still fits a handshake frame.
pub const MIN_PAYLOAD_LEN: usize = 2048;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Bridge configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Serial-over-TCP bridges to connect to at startup.
    #[serde(default)]
    pub connect: Vec<String>,

    /// Address to accept device links on (none = don't listen).
    #[serde(default)]
    pub listen: Option<String>,

    /// Milliseconds to wait for an outbound device link.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Milliseconds between session timer ticks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default)]
    pub session: SessionSettings,
}

/// `[session]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_max_crypto_failures")]
    pub max_crypto_failures: u32,

    #[serde(default = "default_max_framing_errors")]
    pub max_framing_errors: u32,

    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,

    /// Reassembly buffer size; at least one maximum frame.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    #[serde(default = "default_rotation_interval_secs")]
    pub rotation_interval_secs: u64,

    #[serde(default = "default_key_history")]
    pub key_history: usize,

    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_max_crypto_failures() -> u32 {
    3
}

fn default_max_framing_errors() -> u32 {
    16
}

fn default_max_payload_len() -> usize {
    MAX_PAYLOAD_LEN
}

fn default_buffer_capacity() -> usize {
    MAX_PAYLOAD_LEN + FRAME_OVERHEAD
}

fn default_rotation_interval_secs() -> u64 {
    3600
}

fn default_key_history() -> usize {
    10
}

fn default_grace_period_secs() -> u64 {
    600
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connect: Vec::new(),
            listen: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            session: SessionSettings::default(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_crypto_failures: default_max_crypto_failures(),
            max_framing_errors: default_max_framing_errors(),
            max_payload_len: default_max_payload_len(),
            buffer_capacity: default_buffer_capacity(),
            rotation_interval_secs: default_rotation_interval_secs(),
            key_history: default_key_history(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

impl BridgeConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.session;
        if s.max_payload_len < MIN_PAYLOAD_LEN || s.max_payload_len > MAX_PAYLOAD_LEN {
            return Err(ConfigError::Invalid {
                field: "session.max_payload_len",
                reason: format!("must be within {MIN_PAYLOAD_LEN}..={MAX_PAYLOAD_LEN}"),
            });
        }
        if s.buffer_capacity < s.max_payload_len + FRAME_OVERHEAD {
            return Err(ConfigError::Invalid {
                field: "session.buffer_capacity",
                reason: format!("must hold one maximum frame ({} bytes)", s.max_payload_len + FRAME_OVERHEAD),
            });
        }
        if s.max_crypto_failures == 0 || s.max_framing_errors == 0 {
            return Err(ConfigError::Invalid {
                field: "session.max_*",
                reason: "failure budgets must be at least 1".into(),
            });
        }
        if s.rotation_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "session.rotation_interval_secs",
                reason: "must be positive".into(),
            });
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "tick_interval_ms",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        let s = &self.session;
        SessionConfig {
            handshake_timeout: Duration::from_millis(s.handshake_timeout_ms),
            max_crypto_failures: s.max_crypto_failures,
            max_framing_errors: s.max_framing_errors,
            max_payload_len: s.max_payload_len,
            buffer_capacity: s.buffer_capacity,
            rotation: RotationConfig {
                interval: Duration::from_secs(s.rotation_interval_secs),
                history_size: s.key_history,
                grace_period: Duration::from_secs(s.grace_period_secs),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = BridgeConfig::default();
        assert!(config.connect.is_empty());
        assert!(config.listen.is_none());
        assert_eq!(config.connect_timeout_ms, 5000);
        config.validate().unwrap();

        let session = config.session_config();
        assert_eq!(session.handshake_timeout, Duration::from_secs(5));
        assert_eq!(session.max_crypto_failures, 3);
        assert_eq!(session.rotation.interval, Duration::from_secs(3600));
        assert_eq!(session.rotation.history_size, 10);
        assert_eq!(session.rotation.grace_period, Duration::from_secs(600));
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            connect = ["127.0.0.1:7000", "10.0.0.2:7000"]
            listen = "0.0.0.0:7100"

            [session]
            max_crypto_failures = 5
            rotation_interval_secs = 60
        "#;
        let config = BridgeConfig::from_toml(toml).unwrap();
        assert_eq!(config.connect.len(), 2);
        assert_eq!(config.listen.as_deref(), Some("0.0.0.0:7100"));
        assert_eq!(config.session.max_crypto_failures, 5);
        assert_eq!(config.session.max_framing_errors, 16);
        assert_eq!(config.session_config().rotation.interval, Duration::from_secs(60));
    }

    #[test]
    fn rejects_buffer_smaller_than_frame() {
        let toml = r#"
            [session]
            max_payload_len = 4096
            buffer_capacity = 4000
        "#;
        assert!(matches!(
            BridgeConfig::from_toml(toml),
            Err(ConfigError::Invalid { field: "session.buffer_capacity", .. })
        ));
    }

    #[test]
    fn rejects_tiny_payload_limit() {
        let toml = "[session]\nmax_payload_len = 64\nbuffer_capacity = 70\n";
        assert!(matches!(
            BridgeConfig::from_toml(toml),
            Err(ConfigError::Invalid { field: "session.max_payload_len", .. })
        ));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        assert!(matches!(
            BridgeConfig::from_toml("connect = 7"),
            Err(ConfigError::Parse(_))
        ));
    }
}
