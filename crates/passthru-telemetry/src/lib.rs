mod metrics;

pub use metrics::{HistogramSummary, MetricsAggregator, MetricsSnapshot, MetricsTotals};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging subscriber.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "passthru_target" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// The filter directive used when RUST_LOG is unset.
    pub fn filter_directive(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Install the global subscriber. Call once at startup; later calls are
/// ignored.
pub fn init_telemetry(config: &TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    if tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .is_err()
    {
        tracing::debug!("global subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_is_info() {
        assert_eq!(TelemetryConfig::default().filter_directive(), "info");
    }

    #[test]
    fn module_levels_are_appended() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("passthru_target".into(), Level::DEBUG)],
            json: true,
        };
        assert_eq!(config.filter_directive(), "warn,passthru_target=debug");
    }

    #[test]
    fn init_twice_does_not_panic() {
        init_telemetry(&TelemetryConfig::default());
        init_telemetry(&TelemetryConfig {
            json: true,
            ..Default::default()
        });
    }
}
