//! Outbound TCP connection lifecycle for the relay.
//!
//! A [`TargetConnectionManager`] owns the connect/retry state machine for one
//! `(host, port)`. A successful connect yields a [`TargetConnection`]: a
//! cloneable [`TargetHandle`] for writes plus a receiver of
//! [`TargetSignal`]s carrying inbound data and the terminal close/error.

mod connection;
mod error;
mod manager;

pub use connection::{TargetConnection, TargetHandle, TargetSignal};
pub use error::TargetError;
pub use manager::{ConnectOptions, ConnectState, TargetConnectionManager};
