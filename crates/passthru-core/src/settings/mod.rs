//! Process settings.
//!
//! Everything here is fixed once the process starts. The live default
//! target, which can change at runtime, is held by [`crate::ConfigStore`].

mod loader;

pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings, parse_bool,
    parse_u16_range, parse_u32_range, parse_u64_range,
};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::is_valid_ipv4;
use crate::errors::SettingsError;
use crate::flow::Watermarks;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PassthroughSettings {
    pub server: ServerSettings,
    pub target: TargetSettings,
    pub connection: ConnectionSettings,
    pub flow: FlowSettings,
    pub metrics: MetricsSettings,
}

/// Listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// HTTP and WebSocket port.
    pub port: u16,
    /// Largest accepted WebSocket message in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// Default target new sessions connect to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetSettings {
    pub ip: String,
    pub port: u16,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 3001,
        }
    }
}

/// Target connect and retry behaviour.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Fixed pause between connect attempts.
    pub reconnect_interval_ms: u64,
    /// Total attempts per connect. Zero means a single attempt.
    pub max_retries: u32,
    /// Upper bound on a single attempt.
    pub connect_timeout_ms: u64,
    /// Connect new sessions to the default target on accept.
    pub auto_connect: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 3000,
            max_retries: 10,
            connect_timeout_ms: 5000,
            auto_connect: true,
        }
    }
}

impl ConnectionSettings {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowSettings {
    /// Pending bytes at which a direction pauses its producer.
    pub high_watermark: usize,
    /// Pending bytes at which a paused direction resumes.
    pub low_watermark: usize,
    /// Bound on queued messages per direction.
    pub queue_capacity: usize,
    /// Target socket read size.
    pub read_buffer_size: usize,
    /// How long a paused target direction may stay paused, with client
    /// input waiting, before the target is dropped.
    pub stall_timeout_ms: u64,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            high_watermark: 1024 * 1024,
            low_watermark: 256 * 1024,
            queue_capacity: 1024,
            read_buffer_size: 16 * 1024,
            stall_timeout_ms: 30_000,
        }
    }
}

impl FlowSettings {
    pub fn watermarks(&self) -> Watermarks {
        Watermarks::new(self.high_watermark, self.low_watermark)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSettings {
    pub interval_secs: u64,
    pub max_samples: usize,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_samples: 10_000,
        }
    }
}

impl MetricsSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl PassthroughSettings {
    /// Reject combinations the relay cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !is_valid_ipv4(&self.target.ip) {
            return Err(SettingsError::InvalidValue(format!(
                "target.ip is not a dotted-quad IPv4 address: {}",
                self.target.ip
            )));
        }
        if self.target.port == 0 {
            return Err(SettingsError::InvalidValue(
                "target.port must be between 1 and 65535".into(),
            ));
        }
        if self.flow.low_watermark > self.flow.high_watermark {
            return Err(SettingsError::InvalidValue(format!(
                "flow.lowWatermark ({}) exceeds flow.highWatermark ({})",
                self.flow.low_watermark, self.flow.high_watermark
            )));
        }
        for (name, value) in [
            ("flow.highWatermark", self.flow.high_watermark),
            ("flow.queueCapacity", self.flow.queue_capacity),
            ("flow.readBufferSize", self.flow.read_buffer_size),
            ("server.maxMessageSize", self.server.max_message_size),
            ("metrics.maxSamples", self.metrics.max_samples),
        ] {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        for (name, value) in [
            ("flow.stallTimeoutMs", self.flow.stall_timeout_ms),
            ("metrics.intervalSecs", self.metrics.interval_secs),
        ] {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = PassthroughSettings::default();
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.server.port, 4000);
        assert_eq!(s.target.ip, "127.0.0.1");
        assert_eq!(s.target.port, 3001);
        assert_eq!(s.connection.reconnect_interval(), Duration::from_secs(3));
        assert_eq!(s.connection.max_retries, 10);
        assert_eq!(s.connection.connect_timeout(), Duration::from_secs(5));
        assert!(s.connection.auto_connect);
        assert_eq!(s.flow.watermarks(), Watermarks::new(1 << 20, 256 << 10));
        assert_eq!(s.flow.stall_timeout(), Duration::from_secs(30));
        assert_eq!(s.metrics.interval(), Duration::from_secs(60));
    }

    #[test]
    fn defaults_validate() {
        PassthroughSettings::default().validate().unwrap();
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(PassthroughSettings::default()).unwrap();
        assert_eq!(json["connection"]["reconnectIntervalMs"], 3000);
        assert_eq!(json["flow"]["highWatermark"], 1024 * 1024);
    }

    #[test]
    fn validate_rejects_bad_target_ip() {
        let mut s = PassthroughSettings::default();
        s.target.ip = "localhost".into();
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_zero_target_port() {
        let mut s = PassthroughSettings::default();
        s.target.port = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_watermarks() {
        let mut s = PassthroughSettings::default();
        s.flow.low_watermark = s.flow.high_watermark + 1;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("lowWatermark"));
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut s = PassthroughSettings::default();
        s.flow.queue_capacity = 0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("queueCapacity"));
    }

    #[test]
    fn validate_rejects_zero_stall_timeout() {
        let mut s = PassthroughSettings::default();
        s.flow.stall_timeout_ms = 0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("stallTimeoutMs"));
    }
}
