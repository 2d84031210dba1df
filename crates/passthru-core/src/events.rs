use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ids::SessionId;

/// Lifecycle and error events published on the event bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ClientConnect,
    ClientDisconnect,
    ClientError,
    TargetConnect,
    TargetConnectFailed,
    TargetDisconnect,
    TargetError,
    DataReceived,
    ConfigUpdated,
    ConfigReset,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        Self::ClientConnect,
        Self::ClientDisconnect,
        Self::ClientError,
        Self::TargetConnect,
        Self::TargetConnectFailed,
        Self::TargetDisconnect,
        Self::TargetError,
        Self::DataReceived,
        Self::ConfigUpdated,
        Self::ConfigReset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientConnect => "client_connect",
            Self::ClientDisconnect => "client_disconnect",
            Self::ClientError => "client_error",
            Self::TargetConnect => "target_connect",
            Self::TargetConnectFailed => "target_connect_failed",
            Self::TargetDisconnect => "target_disconnect",
            Self::TargetError => "target_error",
            Self::DataReceived => "data_received",
            Self::ConfigUpdated => "config_updated",
            Self::ConfigReset => "config_reset",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way a relayed chunk travelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

/// An immutable bus event. Shared between subscribers as `Arc<RelayEvent>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayEvent {
    pub kind: EventKind,
    pub session_id: Option<SessionId>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub data: Option<Value>,
}

impl RelayEvent {
    pub fn new(kind: EventKind, session_id: Option<SessionId>, message: impl Into<String>) -> Self {
        Self {
            kind,
            session_id,
            message: message.into(),
            timestamp: Utc::now(),
            data: None,
        }
    }

    pub fn for_session(
        kind: EventKind,
        session_id: &SessionId,
        message: impl Into<String>,
    ) -> Self {
        Self::new(kind, Some(session_id.clone()), message)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn data_received(session_id: &SessionId, size: usize, direction: Direction) -> Self {
        Self::for_session(EventKind::DataReceived, session_id, format!("{size} bytes"))
            .with_data(json!({ "size": size, "direction": direction }))
    }

    /// Wire form sent to clients: `{type, timestamp, data}`.
    ///
    /// `data` always carries `sessionId` and `message`; extra fields from
    /// `self.data` are merged in when it is an object.
    pub fn to_wire(&self) -> Value {
        let mut data = serde_json::Map::new();
        if let Some(sid) = &self.session_id {
            let _ = data.insert("sessionId".into(), Value::String(sid.to_string()));
        }
        let _ = data.insert("message".into(), Value::String(self.message.clone()));
        match &self.data {
            Some(Value::Object(extra)) => {
                for (k, v) in extra {
                    let _ = data.insert(k.clone(), v.clone());
                }
            }
            Some(other) => {
                let _ = data.insert("detail".into(), other.clone());
            }
            None => {}
        }
        json!({
            "type": self.kind.as_str(),
            "timestamp": self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            "data": Value::Object(data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_match_serde() {
        for kind in EventKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json.as_str(), Some(kind.as_str()));
        }
    }

    #[test]
    fn wire_form_has_type_timestamp_data() {
        let sid = SessionId::from_raw("sess_1");
        let evt = RelayEvent::for_session(EventKind::TargetError, &sid, "boom");
        let wire = evt.to_wire();
        assert_eq!(wire["type"], "target_error");
        assert!(wire["timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(wire["data"]["sessionId"], "sess_1");
        assert_eq!(wire["data"]["message"], "boom");
    }

    #[test]
    fn wire_form_merges_object_data() {
        let sid = SessionId::from_raw("sess_2");
        let wire = RelayEvent::data_received(&sid, 5, Direction::TargetToClient).to_wire();
        assert_eq!(wire["type"], "data_received");
        assert_eq!(wire["data"]["size"], 5);
        assert_eq!(wire["data"]["direction"], "target_to_client");
    }

    #[test]
    fn wire_form_without_session() {
        let evt = RelayEvent::new(EventKind::ConfigReset, None, "reset")
            .with_data(json!(["not", "an", "object"]));
        let wire = evt.to_wire();
        assert!(wire["data"].get("sessionId").is_none());
        assert_eq!(wire["data"]["detail"][0], "not");
    }
}
