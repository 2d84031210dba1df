//! Outbound half of a client WebSocket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::SinkExt;
use passthru_core::{
    BufferAccount, FlowGate, RelayEvent, Reply, SessionId, Watermarks, WriteOutcome,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

enum Outbound {
    Text(String),
    Binary(Bytes),
    Close,
}

impl Outbound {
    fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
            Self::Close => 0,
        }
    }
}

/// Send side of a client connection. Clones share the same socket.
///
/// Frames go through a FIFO queue to a dedicated writer task; the byte
/// account's gate pauses while the client is slow to read.
#[derive(Clone)]
pub struct ClientChannel {
    tx: mpsc::UnboundedSender<Outbound>,
    account: Arc<BufferAccount>,
    open: Arc<AtomicBool>,
}

impl ClientChannel {
    /// Start the writer task for `sink`.
    pub fn spawn(
        session_id: SessionId,
        sink: SplitSink<WebSocket, Message>,
        watermarks: Watermarks,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let account = BufferAccount::new("target_to_client", watermarks);
        let open = Arc::new(AtomicBool::new(true));
        let writer = tokio::spawn(write_loop(session_id, sink, rx, account.clone(), open.clone()));
        (Self { tx, account, open }, writer)
    }

    pub fn gate(&self) -> &FlowGate {
        self.account.gate()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Queue a binary frame. `None` once the channel is closed.
    pub fn send_binary(&self, data: Bytes) -> Option<WriteOutcome> {
        self.enqueue(Outbound::Binary(data))
    }

    pub fn send_text(&self, text: String) -> Option<WriteOutcome> {
        self.enqueue(Outbound::Text(text))
    }

    pub fn send_json(&self, value: &serde_json::Value) -> Option<WriteOutcome> {
        serde_json::to_string(value).ok().and_then(|s| self.send_text(s))
    }

    pub fn send_reply(&self, reply: &Reply) -> Option<WriteOutcome> {
        self.send_text(reply.to_json())
    }

    pub fn send_event(&self, event: &RelayEvent) -> Option<WriteOutcome> {
        self.send_json(&event.to_wire())
    }

    /// Flush what is queued, then send a close frame.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    fn enqueue(&self, msg: Outbound) -> Option<WriteOutcome> {
        if !self.is_open() {
            return None;
        }
        let n = msg.len();
        let outcome = self.account.on_enqueue(n);
        if self.tx.send(msg).is_err() {
            self.account.on_drain(n);
            return None;
        }
        Some(outcome)
    }
}

async fn write_loop(
    session_id: SessionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    account: Arc<BufferAccount>,
    open: Arc<AtomicBool>,
) {
    while let Some(msg) = rx.recv().await {
        let n = msg.len();
        let frame = match msg {
            Outbound::Text(s) => Message::Text(s.into()),
            Outbound::Binary(b) => Message::Binary(b),
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                break;
            }
        };
        let result = sink.send(frame).await;
        account.on_drain(n);
        if let Err(e) = result {
            debug!(session_id = %session_id, error = %e, "client write failed");
            break;
        }
    }
    open.store(false, Ordering::Release);
    // Release any producer parked on the gate.
    let _ = account.gate().resume();
    debug!(session_id = %session_id, "client writer stopped");
}
