//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`PassthroughSettings::default()`]
//! 2. If a settings file was given, deep-merge its values over defaults
//! 3. Apply environment variable overrides
//! 4. Validate
//!
//! Command-line flags are applied by the binary on top of the result.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use super::PassthroughSettings;
use crate::errors::SettingsError;

/// Load settings from an optional JSON file plus the process environment.
///
/// A path that was given but cannot be read is an error; with no path the
/// file layer is skipped.
pub fn load_settings(path: Option<&Path>) -> Result<PassthroughSettings, SettingsError> {
    let defaults = serde_json::to_value(PassthroughSettings::default())?;

    let merged = match path {
        Some(path) => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        None => defaults,
    };

    let mut settings: PassthroughSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut PassthroughSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from any key lookup.
///
/// Integers must parse and fall within range, booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`. Invalid values are
/// logged and ignored.
pub fn apply_overrides_from<F>(settings: &mut PassthroughSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.u16("PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("HOST") {
        settings.server.host = v;
    }

    // ── Default target ──────────────────────────────────────────────
    if let Some(v) = env.string("TARGET_IP") {
        settings.target.ip = v;
    }
    if let Some(v) = env.u16("TARGET_PORT", 1, 65535) {
        settings.target.port = v;
    }

    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = env.u64("PASSTHRU_RECONNECT_INTERVAL_MS", 0, 3_600_000) {
        settings.connection.reconnect_interval_ms = v;
    }
    if let Some(v) = env.u32("PASSTHRU_MAX_RETRIES", 0, 10_000) {
        settings.connection.max_retries = v;
    }
    if let Some(v) = env.u64("PASSTHRU_CONNECT_TIMEOUT_MS", 1, 600_000) {
        settings.connection.connect_timeout_ms = v;
    }
    if let Some(v) = env.bool("PASSTHRU_AUTO_CONNECT") {
        settings.connection.auto_connect = v;
    }

    // ── Metrics ─────────────────────────────────────────────────────
    if let Some(v) = env.u64("PASSTHRU_METRICS_INTERVAL_SECS", 1, 86_400) {
        settings.metrics.interval_secs = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Readers ─────────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(
        &self,
        name: &str,
        kind: &str,
        parse: impl FnOnce(&str) -> Option<T>,
    ) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u32(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        self.parsed(name, "u32", |v| parse_u32_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
