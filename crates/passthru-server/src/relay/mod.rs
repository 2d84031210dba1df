//! WebSocket session handlers.

mod client;
mod observer;
mod session;

pub use client::ClientChannel;
pub use observer::run_observer_session;
pub use session::run_relay_session;

use std::sync::Arc;

use passthru_core::{ConfigStore, PassthroughSettings};
use passthru_telemetry::MetricsAggregator;
use passthru_target::ConnectOptions;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::registry::SessionRegistry;

/// Everything a session needs from the process. Cheap to clone.
#[derive(Clone)]
pub struct RelayContext {
    pub settings: Arc<PassthroughSettings>,
    pub config: Arc<ConfigStore>,
    pub registry: Arc<SessionRegistry>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<MetricsAggregator>,
    pub shutdown: CancellationToken,
}

impl RelayContext {
    /// Connect options from the live connection settings and the fixed flow
    /// settings.
    pub fn connect_options(&self) -> ConnectOptions {
        let config = self.config.current();
        ConnectOptions::from_settings(&config.connection, &self.settings.flow)
    }
}
