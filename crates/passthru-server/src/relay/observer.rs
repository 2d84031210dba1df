//! `/event` sessions: read-only subscribers to the event bus.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use passthru_core::{EventKind, SessionId};
use serde_json::json;
use tracing::{debug, info, info_span, Instrument};

use super::{ClientChannel, RelayContext};
use crate::registry::RegistryKey;

pub const WELCOME: &str = "Connected to WebSocket Passthrough Event Service";

/// Greeting sent to every observer on connect.
pub fn welcome_message() -> serde_json::Value {
    let subscribed: Vec<&str> = EventKind::ALL.iter().map(EventKind::as_str).collect();
    json!({
        "type": "info",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "data": {
            "message": WELCOME,
            "subscribedEvents": subscribed,
        },
    })
}

/// Forward every bus event to an `/event` client until it disconnects.
pub async fn run_observer_session(ws: WebSocket, ctx: RelayContext) {
    let id = SessionId::new();
    let span = info_span!("observer_session", session_id = %id);
    observe(ws, ctx, id).instrument(span).await;
}

async fn observe(ws: WebSocket, ctx: RelayContext, id: SessionId) {
    let (sink, mut stream) = ws.split();
    let (client, _writer) = ClientChannel::spawn(id.clone(), sink, ctx.settings.flow.watermarks());
    ctx.registry.register_client(&id, Arc::new(client.clone()), "/event");

    let Some(mut events) = ctx.bus.subscribe(&id) else {
        debug!("observer already subscribed");
        let _ = ctx.registry.cleanup(&RegistryKey::Session(id));
        return;
    };
    let _ = client.send_json(&welcome_message());
    info!(subscribers = ctx.bus.subscriber_count(), "event observer connected");

    loop {
        tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            frame = stream.next() => match frame {
                None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
                // Observers only listen.
                Some(Ok(_)) => {}
            },
            event = events.recv() => match event {
                Some(event) => {
                    let _ = client.send_event(&event);
                }
                None => break,
            },
        }
    }

    let _ = ctx.bus.unsubscribe(&id);
    let _ = ctx.registry.cleanup(&RegistryKey::Session(id));
    info!("event observer disconnected");
}
