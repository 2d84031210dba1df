//! # passthru
//!
//! WebSocket to TCP passthrough relay. Loads settings, starts the
//! HTTP/WebSocket server and runs until Ctrl-C or SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use passthru_core::settings::load_settings;
use passthru_core::PassthroughSettings;
use passthru_server::RelayServer;
use passthru_telemetry::{init_telemetry, TelemetryConfig};
use tracing::Level;

/// WebSocket to TCP passthrough relay.
#[derive(Parser, Debug)]
#[command(name = "passthru", about = "WebSocket to TCP passthrough relay")]
struct Cli {
    /// JSON settings file, merged over the built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Default target IPv4 address.
    #[arg(long)]
    target_ip: Option<String>,

    /// Default target port.
    #[arg(long)]
    target_port: Option<u16>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: Level,
}

impl Cli {
    /// Flags win over file and environment.
    fn apply(&self, settings: &mut PassthroughSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(ip) = &self.target_ip {
            settings.target.ip.clone_from(ip);
        }
        if let Some(port) = self.target_port {
            settings.target.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_telemetry(&TelemetryConfig {
        log_level: args.log_level,
        json: args.log_json,
        ..TelemetryConfig::default()
    });

    let mut settings = load_settings(args.config.as_deref()).context("Failed to load settings")?;
    args.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    tracing::info!(
        target_ip = %settings.target.ip,
        target_port = settings.target.port,
        auto_connect = settings.connection.auto_connect,
        "default target"
    );

    let server = RelayServer::new(settings);
    let (addr, server_handle) = server.listen().await.context("Failed to bind server")?;
    let reporter = server.spawn_metrics_reporter();
    tracing::info!("passthru listening on http://{addr} (ws://{addr}/data, ws://{addr}/event)");

    wait_for_signal().await?;

    tracing::info!("Shutting down...");
    let report = server.shutdown(vec![server_handle, reporter], None).await;
    tracing::info!(
        clients_closed = report.clients_closed,
        targets_destroyed = report.targets_destroyed,
        drained = report.drained,
        "Shutdown complete"
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["passthru"]);
        assert_eq!(cli.log_level, Level::INFO);
        assert!(!cli.log_json);
        let mut settings = PassthroughSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings, PassthroughSettings::default());
    }

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::parse_from([
            "passthru",
            "--host",
            "127.0.0.1",
            "--port",
            "8080",
            "--target-ip",
            "10.0.0.2",
            "--target-port",
            "9100",
            "--log-level",
            "debug",
            "--log-json",
        ]);
        let mut settings = PassthroughSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.target.ip, "10.0.0.2");
        assert_eq!(settings.target.port, 9100);
        assert_eq!(cli.log_level, Level::DEBUG);
        assert!(cli.log_json);
    }

    #[test]
    fn cli_config_path() {
        let cli = Cli::parse_from(["passthru", "--config", "/etc/passthru.json"]);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/etc/passthru.json")));
    }
}
