//! Live default-target configuration.
//!
//! [`ConfigStore`] publishes immutable [`PassthroughConfig`] snapshots over a
//! `watch` channel. Readers take an `Arc` and never see a half-applied
//! update; sessions following the default target subscribe and reconnect
//! when a new snapshot lands.

use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;

use crate::errors::ConfigError;
use crate::settings::{ConnectionSettings, PassthroughSettings};

/// Dotted-quad IPv4 check used by every path that accepts a target address.
pub fn is_valid_ipv4(ip: &str) -> bool {
    ip.parse::<Ipv4Addr>().is_ok()
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetConfig {
    pub ip: String,
    pub port: u16,
}

impl TargetConfig {
    pub fn new(ip: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        let ip = ip.into();
        if !is_valid_ipv4(&ip) {
            return Err(ConfigError::InvalidIp(ip));
        }
        if port == 0 {
            return Err(ConfigError::InvalidPort(port.to_string()));
        }
        Ok(Self { ip, port })
    }

    /// Build from loosely typed JSON fields. `port` may be a number or a
    /// numeric string.
    pub fn from_json(ip: Option<&Value>, port: Option<&Value>) -> Result<Self, ConfigError> {
        let ip = match ip {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            None | Some(Value::Null) => return Err(ConfigError::MissingField),
            Some(Value::String(_)) => return Err(ConfigError::MissingField),
            Some(other) => return Err(ConfigError::InvalidIp(other.to_string())),
        };
        let port = match port {
            None | Some(Value::Null) => return Err(ConfigError::MissingField),
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| ConfigError::InvalidPort(n.to_string()))?,
            Some(Value::String(s)) => s
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(s.clone()))?,
            Some(other) => return Err(ConfigError::InvalidPort(other.to_string())),
        };
        Self::new(ip, port)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// One immutable configuration snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassthroughConfig {
    pub target: TargetConfig,
    pub connection: ConnectionSettings,
}

impl PassthroughConfig {
    pub fn from_settings(settings: &PassthroughSettings) -> Self {
        Self {
            target: TargetConfig {
                ip: settings.target.ip.clone(),
                port: settings.target.port,
            },
            connection: settings.connection.clone(),
        }
    }
}

/// Holder of the current [`PassthroughConfig`].
#[derive(Debug)]
pub struct ConfigStore {
    defaults: Arc<PassthroughConfig>,
    tx: watch::Sender<Arc<PassthroughConfig>>,
}

impl ConfigStore {
    pub fn new(defaults: PassthroughConfig) -> Self {
        let defaults = Arc::new(defaults);
        let (tx, _rx) = watch::channel(defaults.clone());
        Self { defaults, tx }
    }

    pub fn current(&self) -> Arc<PassthroughConfig> {
        self.tx.borrow().clone()
    }

    pub fn defaults(&self) -> Arc<PassthroughConfig> {
        self.defaults.clone()
    }

    /// Receiver that wakes on every update or reset.
    pub fn subscribe(&self) -> watch::Receiver<Arc<PassthroughConfig>> {
        self.tx.subscribe()
    }

    /// Replace the default target and notify subscribers.
    pub fn update_target(&self, target: TargetConfig) -> Arc<PassthroughConfig> {
        let mut updated = self.current();
        self.tx.send_modify(|cur| {
            let next = Arc::new(PassthroughConfig {
                target: target.clone(),
                connection: cur.connection.clone(),
            });
            updated = next.clone();
            *cur = next;
        });
        info!(target_ip = %target.ip, target_port = target.port, "default target updated");
        updated
    }

    /// Restore the startup configuration and notify subscribers.
    pub fn reset(&self) -> Arc<PassthroughConfig> {
        let _ = self.tx.send_replace(self.defaults.clone());
        info!("configuration reset to defaults");
        self.defaults.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ConfigStore {
        ConfigStore::new(PassthroughConfig::from_settings(&PassthroughSettings::default()))
    }

    #[test]
    fn ipv4_validation() {
        assert!(is_valid_ipv4("127.0.0.1"));
        assert!(is_valid_ipv4("255.255.255.255"));
        assert!(!is_valid_ipv4("256.0.0.1"));
        assert!(!is_valid_ipv4("1.2.3"));
        assert!(!is_valid_ipv4("localhost"));
        assert!(!is_valid_ipv4("::1"));
    }

    #[test]
    fn target_from_json_accepts_numeric_string_port() {
        let t = TargetConfig::from_json(Some(&json!("10.0.0.1")), Some(&json!("8080"))).unwrap();
        assert_eq!(
            t,
            TargetConfig {
                ip: "10.0.0.1".into(),
                port: 8080,
            }
        );
    }

    #[test]
    fn target_from_json_rejections() {
        assert_eq!(TargetConfig::from_json(None, Some(&json!(1))), Err(ConfigError::MissingField));
        assert_eq!(
            TargetConfig::from_json(Some(&json!("1.1.1.1")), None),
            Err(ConfigError::MissingField)
        );
        assert!(matches!(
            TargetConfig::from_json(Some(&json!("1.1.1")), Some(&json!(1))),
            Err(ConfigError::InvalidIp(_))
        ));
        for port in [json!(0), json!(65536), json!("abc"), json!(true), json!(-5)] {
            let result = TargetConfig::from_json(Some(&json!("1.1.1.1")), Some(&port));
            assert!(matches!(result, Err(ConfigError::InvalidPort(_))), "port {port}");
        }
    }

    #[test]
    fn update_replaces_snapshot_and_notifies() {
        let store = store();
        let mut rx = store.subscribe();
        let before = store.current();

        let after = store.update_target(TargetConfig::new("10.1.2.3", 9000).unwrap());
        assert_eq!(after.target.addr(), "10.1.2.3:9000");
        assert_eq!(after.connection, before.connection);
        assert_eq!(before.target.port, 3001, "old snapshot untouched");
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().target.port, 9000);
    }

    #[test]
    fn reset_restores_defaults() {
        let store = store();
        let _ = store.update_target(TargetConfig::new("10.1.2.3", 9000).unwrap());
        let reset = store.reset();
        assert_eq!(
            reset.target,
            TargetConfig {
                ip: "127.0.0.1".into(),
                port: 3001,
            }
        );
        assert_eq!(*store.current(), *store.defaults());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let v = serde_json::to_value(&*store().current()).unwrap();
        assert_eq!(v["target"]["ip"], "127.0.0.1");
        assert_eq!(v["connection"]["maxRetries"], 10);
    }
}
