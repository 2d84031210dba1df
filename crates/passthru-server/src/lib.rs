//! HTTP and WebSocket front end of the passthrough relay.

pub mod bus;
pub mod health;
pub mod http;
pub mod registry;
pub mod relay;
pub mod server;
pub mod shutdown;

pub use bus::EventBus;
pub use registry::{
    CleanupReport, RegistryKey, RegistryStats, SessionInfo, SessionRegistry, TargetInfo,
};
pub use relay::{ClientChannel, RelayContext};
pub use server::{AppState, RelayServer};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
