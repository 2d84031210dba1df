use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use passthru_core::settings::{ConnectionSettings, FlowSettings};
use passthru_core::Watermarks;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{spawn_connection, StreamOptions, TargetConnection, TargetHandle};
use crate::error::TargetError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectState {
    Idle,
    Connecting { attempt: u32 },
    Connected,
}

#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// Fixed pause between attempts.
    pub reconnect_interval: Duration,
    /// Total attempts. Zero is treated as one.
    pub max_retries: u32,
    /// Upper bound on a single attempt.
    pub connect_timeout: Duration,
    pub read_buffer_size: usize,
    /// Inbound chunks buffered before the reader stops reading the socket.
    pub signal_capacity: usize,
    pub watermarks: Watermarks,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from_settings(&ConnectionSettings::default(), &FlowSettings::default())
    }
}

impl ConnectOptions {
    pub fn from_settings(connection: &ConnectionSettings, flow: &FlowSettings) -> Self {
        Self {
            reconnect_interval: connection.reconnect_interval(),
            max_retries: connection.max_retries,
            connect_timeout: connection.connect_timeout(),
            read_buffer_size: flow.read_buffer_size,
            signal_capacity: flow.queue_capacity,
            watermarks: flow.watermarks(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

struct ManagerState {
    phase: ConnectState,
    retries: u32,
    cancel: CancellationToken,
    generation: u64,
    live: Option<TargetHandle>,
}

struct ManagerInner {
    host: String,
    port: u16,
    state: Mutex<ManagerState>,
}

/// Connect/retry state machine for one target address.
#[derive(Clone)]
pub struct TargetConnectionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for TargetConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetConnectionManager")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("state", &self.state())
            .finish()
    }
}

impl TargetConnectionManager {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                host: host.into(),
                port,
                state: Mutex::new(ManagerState {
                    phase: ConnectState::Idle,
                    retries: 0,
                    cancel: CancellationToken::new(),
                    generation: 0,
                    live: None,
                }),
            }),
        }
    }

    /// Host this manager dials, as given to [`Self::new`].
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Port this manager dials.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Current phase: idle, connecting (with attempt number) or connected.
    pub fn state(&self) -> ConnectState {
        self.inner.state.lock().phase
    }

    /// Connect, retrying at a fixed interval until `max_attempts` attempts
    /// have failed.
    ///
    /// A connection left over from an earlier call is closed first. Returns
    /// [`TargetError::Cancelled`] if [`Self::disconnect`] runs meanwhile.
    pub async fn connect(&self, opts: &ConnectOptions) -> Result<TargetConnection, TargetError> {
        let host = self.inner.host.as_str();
        let port = self.inner.port;

        let (cancel, generation) = {
            let mut st = self.inner.state.lock();
            if let ConnectState::Connecting { .. } = st.phase {
                warn!(host, port, "connect requested while an attempt is in progress");
                return Err(TargetError::AlreadyConnecting);
            }
            if let Some(old) = st.live.take() {
                old.close();
            }
            st.generation += 1;
            st.retries = 0;
            st.phase = ConnectState::Connecting { attempt: 1 };
            st.cancel = CancellationToken::new();
            (st.cancel.clone(), st.generation)
        };

        let max_attempts = opts.max_attempts();
        loop {
            let attempt = self.with_current(generation, |st| {
                st.phase = ConnectState::Connecting { attempt: st.retries + 1 };
                st.retries + 1
            });
            let Some(attempt) = attempt else {
                return Err(TargetError::Cancelled);
            };
            debug!(host, port, attempt, max_attempts, "connecting to target");

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TargetError::Cancelled),
                r = tokio::time::timeout(
                    opts.connect_timeout,
                    TcpStream::connect((host, port)),
                ) => r,
            };

            let failure = match outcome {
                Ok(Ok(stream)) => return self.established(stream, generation, opts),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("connect timed out after {}ms", opts.connect_timeout.as_millis()),
            };

            let retries = self.with_current(generation, |st| {
                st.retries += 1;
                st.retries
            });
            let Some(retries) = retries else {
                return Err(TargetError::Cancelled);
            };

            if retries < max_attempts {
                warn!(
                    host,
                    port,
                    attempt = retries,
                    max_attempts,
                    error = %failure,
                    "target connect failed, retrying"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(TargetError::Cancelled),
                    () = tokio::time::sleep(opts.reconnect_interval) => {}
                }
            } else {
                error!(
                    host,
                    port,
                    attempts = retries,
                    error = %failure,
                    "target connect failed, giving up"
                );
                let _ = self.with_current(generation, |st| {
                    st.phase = ConnectState::Idle;
                    st.retries = 0;
                });
                return Err(TargetError::ConnectFailed {
                    host: host.to_string(),
                    port,
                    attempts: retries,
                    message: failure,
                });
            }
        }
    }

    /// Cancel any pending attempt or retry sleep and half-close a live
    /// connection. Safe to call in any state.
    pub fn disconnect(&self) {
        let live = {
            let mut st = self.inner.state.lock();
            st.cancel.cancel();
            st.generation += 1;
            st.retries = 0;
            st.phase = ConnectState::Idle;
            st.live.take()
        };
        if let Some(handle) = live {
            info!(
                host = %self.inner.host,
                port = self.inner.port,
                target_id = %handle.id(),
                "target disconnected"
            );
            handle.close();
        }
    }

    fn established(
        &self,
        stream: TcpStream,
        generation: u64,
        opts: &ConnectOptions,
    ) -> Result<TargetConnection, TargetError> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(
                host = %self.inner.host,
                port = self.inner.port,
                error = %e,
                "failed to set TCP_NODELAY"
            );
        }

        let inner = self.inner.clone();
        let conn = spawn_connection(
            stream,
            &self.inner.host,
            self.inner.port,
            &StreamOptions {
                read_buffer_size: opts.read_buffer_size,
                signal_capacity: opts.signal_capacity,
                watermarks: opts.watermarks,
            },
            move || {
                let mut st = inner.state.lock();
                if st.generation == generation {
                    st.phase = ConnectState::Idle;
                    st.live = None;
                }
            },
        );

        let mut st = self.inner.state.lock();
        if st.generation != generation {
            // Disconnected between the connect completing and now.
            conn.handle.destroy();
            return Err(TargetError::Cancelled);
        }
        st.phase = ConnectState::Connected;
        st.retries = 0;
        st.live = Some(conn.handle.clone());
        info!(
            host = %self.inner.host,
            port = self.inner.port,
            target_id = %conn.handle.id(),
            "connected to target"
        );
        Ok(conn)
    }

    /// Run `f` against the state if `generation` is still current.
    fn with_current<T>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut ManagerState) -> T,
    ) -> Option<T> {
        let mut st = self.inner.state.lock();
        (st.generation == generation).then(|| f(&mut st))
    }
}
