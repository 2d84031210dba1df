//! Shared types for the passthrough relay: ids, the inbound envelope,
//! bus events, flow-control primitives, live configuration and the
//! layered settings loader.

pub mod config;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod flow;
pub mod ids;
pub mod settings;

pub use config::{ConfigStore, PassthroughConfig, TargetConfig};
pub use envelope::{ClientMessage, Reply, TargetRequest};
pub use errors::{ConfigError, ProtocolError, SettingsError};
pub use events::{Direction, EventKind, RelayEvent};
pub use flow::{BufferAccount, FlowGate, FlowState, Watermarks, WriteOutcome};
pub use ids::{SessionId, TargetId};
pub use settings::PassthroughSettings;
