//! Relay session: one client WebSocket bridged to at most one target.
//!
//! The session is a single task that owns all of its state. Client frames,
//! target signals, connect outcomes, default-target changes and bus events
//! are multiplexed in one `select!`; each wakeup becomes a [`Step`] that is
//! applied with exclusive access. Connect attempts run on their own task
//! and report back tagged with a generation number, so a result that was
//! superseded by a later re-point is discarded.
//!
//! The client keeps being read while the target direction is paused. Data
//! frames are held back, up to `flow.highWatermark` bytes, until the
//! target drains; a close or error from the client is acted on at once.
//! Frames held longer than `flow.stallTimeoutMs` drop the target.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitStream;
use futures::StreamExt;
use passthru_core::{
    ClientMessage, Direction, EventKind, FlowGate, PassthroughConfig, RelayEvent, Reply, SessionId,
    TargetRequest,
};
use passthru_target::{
    TargetConnection, TargetConnectionManager, TargetError, TargetHandle, TargetSignal,
};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant as Deadline;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{ClientChannel, RelayContext};
use crate::registry::RegistryKey;

pub const NOT_ESTABLISHED: &str = "Target connection not established.";
pub const SUBSCRIBED: &str = "Subscribed to server events.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnectOrigin {
    /// Following the configured default target.
    Default,
    /// Asked for by the client with a config envelope.
    Request,
}

struct ConnectOutcome {
    generation: u64,
    request: TargetRequest,
    origin: ConnectOrigin,
    result: Result<TargetConnection, TargetError>,
}

struct LiveTarget {
    handle: TargetHandle,
    signals: mpsc::Receiver<TargetSignal>,
}

/// Client data frames waiting for the target direction to drain.
#[derive(Default)]
struct HeldFrames {
    frames: VecDeque<(Bytes, Instant)>,
    bytes: usize,
    /// Set by the first frame held; cleared on flush.
    deadline: Option<Deadline>,
}

impl HeldFrames {
    fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn push(&mut self, data: Bytes, received: Instant, stall: Duration) {
        if self.deadline.is_none() {
            self.deadline = Some(Deadline::now() + stall);
        }
        self.bytes += data.len();
        self.frames.push_back((data, received));
    }

    fn take(&mut self) -> VecDeque<(Bytes, Instant)> {
        self.bytes = 0;
        self.deadline = None;
        std::mem::take(&mut self.frames)
    }
}

enum Step {
    Shutdown,
    Client(Option<Result<Message, axum::Error>>),
    Target(Option<TargetSignal>),
    Drained,
    Stalled,
    Connected(ConnectOutcome),
    ConfigChanged(bool),
    Event(Option<Arc<RelayEvent>>),
}

struct RelaySession {
    id: SessionId,
    ctx: RelayContext,
    client: ClientChannel,
    manager: Option<TargetConnectionManager>,
    target: Option<LiveTarget>,
    held: HeldFrames,
    hold_limit: usize,
    requested: Option<TargetRequest>,
    generation: u64,
    follow_default: bool,
    config_rx: watch::Receiver<Arc<PassthroughConfig>>,
    events: Option<mpsc::Receiver<Arc<RelayEvent>>>,
    connect_tx: mpsc::Sender<ConnectOutcome>,
    connect_rx: mpsc::Receiver<ConnectOutcome>,
}

/// Drive a `/data` WebSocket until the client leaves or the server stops.
pub async fn run_relay_session(ws: WebSocket, ctx: RelayContext) {
    let id = SessionId::new();
    let span = info_span!("relay_session", session_id = %id);
    relay(ws, ctx, id).instrument(span).await;
}

async fn relay(ws: WebSocket, ctx: RelayContext, id: SessionId) {
    let (sink, mut stream) = ws.split();
    let (client, _writer) =
        ClientChannel::spawn(id.clone(), sink, ctx.settings.flow.watermarks());
    ctx.registry.register_client(&id, Arc::new(client.clone()), "/data");
    ctx.metrics.connection_opened();
    info!("relay client connected");
    let _ = ctx.bus.publish(RelayEvent::for_session(
        EventKind::ClientConnect,
        &id,
        "Client connected",
    ));

    let mut config_rx = ctx.config.subscribe();
    let initial = config_rx.borrow_and_update().clone();
    let (connect_tx, connect_rx) = mpsc::channel(4);
    let hold_limit = ctx.settings.flow.high_watermark;

    let mut session = RelaySession {
        id,
        ctx,
        client,
        manager: None,
        target: None,
        held: HeldFrames::default(),
        hold_limit,
        requested: None,
        generation: 0,
        follow_default: initial.connection.auto_connect,
        config_rx,
        events: None,
        connect_tx,
        connect_rx,
    };
    if session.follow_default {
        session.start_connect(
            TargetRequest {
                host: initial.target.ip.clone(),
                port: initial.target.port,
            },
            ConnectOrigin::Default,
        );
    }

    session.run(&mut stream).await;
    session.teardown();
}

impl RelaySession {
    async fn run(&mut self, stream: &mut SplitStream<WebSocket>) {
        loop {
            let target_gate = self.target.as_ref().map(|t| t.handle.gate().clone());
            let client_gate = self.client.gate().clone();
            let hold_deadline = self.held.deadline;
            let reading = self.held.bytes < self.hold_limit;

            let step = tokio::select! {
                () = self.ctx.shutdown.cancelled() => Step::Shutdown,
                Some(outcome) = self.connect_rx.recv() => Step::Connected(outcome),
                sig = next_signal(self.target.as_mut(), &client_gate) => Step::Target(sig),
                msg = stream.next(), if reading => Step::Client(msg),
                drained = wait_drained(target_gate.as_ref(), hold_deadline),
                    if !self.held.is_empty() =>
                {
                    if drained {
                        Step::Drained
                    } else {
                        Step::Stalled
                    }
                }
                changed = self.config_rx.changed(), if self.follow_default => {
                    Step::ConfigChanged(changed.is_ok())
                }
                ev = next_event(self.events.as_mut()) => Step::Event(ev),
            };

            if !self.apply(step) {
                break;
            }
        }
    }

    /// Returns `false` when the session should end.
    fn apply(&mut self, step: Step) -> bool {
        match step {
            Step::Shutdown => {
                info!("server shutting down, closing session");
                false
            }
            Step::Client(None) | Step::Client(Some(Ok(Message::Close(_)))) => {
                info!("relay client disconnected");
                false
            }
            Step::Client(Some(Err(e))) => {
                warn!(error = %e, "client websocket error");
                let _ = self.ctx.bus.publish(RelayEvent::for_session(
                    EventKind::ClientError,
                    &self.id,
                    format!("WebSocket error: {e}"),
                ));
                false
            }
            Step::Client(Some(Ok(msg))) => {
                match msg {
                    Message::Text(text) => {
                        self.on_frame(Bytes::copy_from_slice(text.as_str().as_bytes()));
                    }
                    Message::Binary(data) => self.on_frame(data),
                    Message::Ping(_) | Message::Pong(_) | Message::Close(_) => {}
                }
                true
            }
            Step::Target(signal) => {
                self.on_target_signal(signal);
                true
            }
            Step::Drained => {
                self.flush_held();
                true
            }
            Step::Stalled => {
                let stall = self.ctx.settings.flow.stall_timeout();
                warn!(stall_ms = stall.as_millis() as u64, "target write stalled, dropping target");
                self.target_ended(
                    EventKind::TargetError,
                    format!(
                        "Target connection error: write stalled for {}ms",
                        stall.as_millis()
                    ),
                );
                self.flush_held();
                true
            }
            Step::Connected(outcome) => {
                self.on_connect_outcome(outcome);
                true
            }
            Step::ConfigChanged(true) => {
                self.follow_config();
                true
            }
            Step::ConfigChanged(false) => {
                self.follow_default = false;
                true
            }
            Step::Event(Some(event)) => {
                let _ = self.client.send_event(&event);
                true
            }
            Step::Event(None) => {
                self.events = None;
                true
            }
        }
    }

    fn on_frame(&mut self, frame: Bytes) {
        let received = Instant::now();
        match ClientMessage::decode(frame) {
            Ok(ClientMessage::Control(request)) => {
                info!(target_addr = %request, "client requested target");
                self.follow_default = false;
                // Data sent before the re-point belongs to the old target.
                self.flush_held();
                self.start_connect(request, ConnectOrigin::Request);
            }
            Ok(ClientMessage::Data(data) | ClientMessage::Raw(data)) => {
                let paused = self.target.as_ref().is_some_and(|t| t.handle.gate().is_paused());
                if paused || !self.held.is_empty() {
                    debug!(bytes = data.len(), "target paused, holding client frame");
                    self.held.push(data, received, self.ctx.settings.flow.stall_timeout());
                } else {
                    self.forward_to_target(data, received);
                }
            }
            Ok(ClientMessage::Subscribe) => {
                if self.events.is_none() {
                    self.events = self.ctx.bus.subscribe(&self.id);
                }
                let _ = self.client.send_reply(&Reply::success(SUBSCRIBED));
            }
            Err(e) => {
                debug!(error = %e, "rejecting malformed envelope");
                let _ = self.client.send_reply(&Reply::from(&e));
            }
        }
    }

    fn forward_to_target(&mut self, data: Bytes, received: Instant) {
        let Some(target) = &self.target else {
            let _ = self.client.send_reply(&Reply::error(NOT_ESTABLISHED));
            return;
        };
        let n = data.len();
        match target.handle.write(data) {
            Ok(_) => {
                self.ctx.metrics.record_message(n, received.elapsed());
                let _ = self
                    .ctx
                    .bus
                    .publish(RelayEvent::data_received(&self.id, n, Direction::ClientToTarget));
            }
            Err(e) => {
                debug!(
                    target_id = %target.handle.id(),
                    error = %e,
                    "dropping write to closed target"
                );
            }
        }
    }

    /// Forward every held frame, in order, whatever the gate says.
    fn flush_held(&mut self) {
        for (data, received) in self.held.take() {
            self.forward_to_target(data, received);
        }
    }

    fn on_target_signal(&mut self, signal: Option<TargetSignal>) {
        match signal {
            Some(TargetSignal::Data(chunk)) => {
                let started = Instant::now();
                let n = chunk.len();
                if self.client.send_binary(chunk).is_some() {
                    self.ctx.metrics.record_message(n, started.elapsed());
                    let _ = self
                        .ctx
                        .bus
                        .publish(RelayEvent::data_received(&self.id, n, Direction::TargetToClient));
                }
            }
            Some(TargetSignal::Closed) => {
                self.target_ended(
                    EventKind::TargetDisconnect,
                    "Target connection closed.".to_string(),
                );
            }
            Some(TargetSignal::Error(message)) => {
                self.target_ended(
                    EventKind::TargetError,
                    format!("Target connection error: {message}"),
                );
            }
            // Reader task gone without a terminal signal.
            None => {
                self.target_ended(
                    EventKind::TargetDisconnect,
                    "Target connection closed.".to_string(),
                );
            }
        }
    }

    fn target_ended(&mut self, kind: EventKind, message: String) {
        let mut event = RelayEvent::for_session(kind, &self.id, message);
        if let Some(target) = &self.target {
            info!(target_id = %target.handle.id(), event = %kind, "target connection ended");
            event = event.with_data(json!({
                "targetId": target.handle.id(),
                "host": target.handle.host(),
                "port": target.handle.port(),
            }));
        }
        self.release_target();
        self.manager = None;
        let _ = self.client.send_event(&event);
        let _ = self.ctx.bus.publish(event);
    }

    /// Drop the current target, if any, and start connecting to `request`.
    fn start_connect(&mut self, request: TargetRequest, origin: ConnectOrigin) {
        self.release_target();
        if let Some(old) = self.manager.take() {
            old.disconnect();
        }
        self.generation += 1;
        let generation = self.generation;

        let manager = TargetConnectionManager::new(request.host.clone(), request.port);
        self.manager = Some(manager.clone());
        self.requested = Some(request.clone());

        let opts = self.ctx.connect_options();
        let tx = self.connect_tx.clone();
        info!(target_addr = %request, ?origin, generation, "connecting to target");
        let _ = tokio::spawn(
            async move {
                let result = manager.connect(&opts).await;
                let outcome = ConnectOutcome {
                    generation,
                    request,
                    origin,
                    result,
                };
                if let Err(mpsc::error::SendError(orphan)) = tx.send(outcome).await {
                    // The session is gone; nothing will own this connection.
                    if let Ok(conn) = orphan.result {
                        conn.handle.destroy();
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn on_connect_outcome(&mut self, outcome: ConnectOutcome) {
        let ConnectOutcome {
            generation,
            request,
            origin,
            result,
        } = outcome;

        if generation != self.generation {
            if let Ok(conn) = result {
                debug!(generation, current = self.generation, "discarding superseded connection");
                conn.handle.destroy();
            }
            return;
        }

        match result {
            Ok(conn) => {
                let (handle, signals) = conn.into_parts();
                let target_id = handle.id().clone();
                self.ctx.registry.register_target(
                    &self.id,
                    &target_id,
                    Arc::new(handle.clone()),
                    &request.host,
                    request.port,
                );
                self.ctx.registry.pair(&self.id, &target_id);
                self.target = Some(LiveTarget { handle, signals });

                let message = format!("Connected to {request}");
                let event =
                    RelayEvent::for_session(EventKind::TargetConnect, &self.id, message.clone())
                        .with_data(json!({
                            "targetId": target_id,
                            "host": request.host,
                            "port": request.port,
                        }));
                match origin {
                    ConnectOrigin::Request => {
                        let _ = self.client.send_reply(&Reply::success(message));
                    }
                    ConnectOrigin::Default => {
                        let _ = self.client.send_event(&event);
                    }
                }
                let _ = self.ctx.bus.publish(event);
            }
            Err(TargetError::Cancelled) => {
                debug!(target_addr = %request, "connect cancelled");
            }
            Err(e) => {
                warn!(target_addr = %request, error = %e, "target connect failed");
                self.manager = None;
                let event = RelayEvent::for_session(
                    EventKind::TargetConnectFailed,
                    &self.id,
                    format!("Target connection failed: {e}"),
                )
                .with_data(json!({ "host": request.host, "port": request.port }));
                let _ = self.client.send_event(&event);
                let _ = self.ctx.bus.publish(event);
            }
        }
    }

    fn follow_config(&mut self) {
        let config = self.config_rx.borrow_and_update().clone();
        let request = TargetRequest {
            host: config.target.ip.clone(),
            port: config.target.port,
        };
        let active = self.target.is_some() || self.manager.is_some();
        if active && self.requested.as_ref() == Some(&request) {
            return;
        }
        info!(target_addr = %request, "default target changed");
        self.start_connect(request, ConnectOrigin::Default);
    }

    fn release_target(&mut self) {
        if let Some(target) = self.target.take() {
            let _ = self
                .ctx
                .registry
                .cleanup(&RegistryKey::Target(target.handle.id().clone()));
        }
    }

    fn teardown(mut self) {
        let report = self.ctx.registry.cleanup(&RegistryKey::Session(self.id.clone()));
        if let Some(manager) = self.manager.take() {
            manager.disconnect();
        }
        let _ = self.ctx.bus.unsubscribe(&self.id);
        self.ctx.metrics.connection_closed();
        info!(
            targets_removed = report.targets_removed,
            pairs_removed = report.pairs_removed,
            "relay session closed"
        );
        let _ = self.ctx.bus.publish(RelayEvent::for_session(
            EventKind::ClientDisconnect,
            &self.id,
            "Client disconnected",
        ));
    }
}

async fn next_signal(
    target: Option<&mut LiveTarget>,
    client_gate: &FlowGate,
) -> Option<TargetSignal> {
    let Some(target) = target else {
        return std::future::pending().await;
    };
    client_gate.wait_flowing().await;
    target.signals.recv().await
}

/// `true` once the target direction flows again (or the target is gone),
/// `false` if `deadline` passes first. Pending while nothing is held.
async fn wait_drained(target_gate: Option<&FlowGate>, deadline: Option<Deadline>) -> bool {
    let Some(deadline) = deadline else {
        return std::future::pending().await;
    };
    match target_gate {
        Some(gate) => tokio::time::timeout_at(deadline, gate.wait_flowing()).await.is_ok(),
        None => true,
    }
}

async fn next_event(
    events: Option<&mut mpsc::Receiver<Arc<RelayEvent>>>,
) -> Option<Arc<RelayEvent>> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
