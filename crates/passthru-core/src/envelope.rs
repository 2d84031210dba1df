//! Inbound client envelope.
//!
//! Clients send JSON objects of the form `{path, data}`. The path picks
//! the variant; anything that is not a recognisable envelope is relayed
//! untouched as [`ClientMessage::Raw`]. Only an envelope with a known path
//! and an unusable `data` field is an error.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ProtocolError;

/// Request to point the session at a new target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetRequest {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for TargetRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    Control(TargetRequest),
    Data(Bytes),
    Subscribe,
    Raw(Bytes),
}

impl ClientMessage {
    /// Decode one client frame. Text and binary frames are treated alike.
    pub fn decode(frame: Bytes) -> Result<Self, ProtocolError> {
        let Ok(Value::Object(mut map)) = serde_json::from_slice::<Value>(&frame) else {
            return Ok(Self::Raw(frame));
        };
        let Some(path) = map.get("path").and_then(Value::as_str) else {
            return Ok(Self::Raw(frame));
        };
        match path.trim_start_matches('/') {
            "config" => decode_target(map.remove("data")).map(Self::Control),
            "data" => decode_payload(map.remove("data")).map(Self::Data),
            "event" => Ok(Self::Subscribe),
            _ => Ok(Self::Raw(frame)),
        }
    }
}

fn decode_target(data: Option<Value>) -> Result<TargetRequest, ProtocolError> {
    let Some(Value::Object(obj)) = data else {
        return Err(ProtocolError::InvalidTarget("missing data object".into()));
    };
    let host = match obj.get("targetIp") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        _ => return Err(ProtocolError::InvalidTarget("targetIp must be a non-empty string".into())),
    };
    let port = obj
        .get("targetPort")
        .and_then(Value::as_u64)
        .filter(|p| (1..=65535).contains(p))
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| {
            ProtocolError::InvalidTarget("targetPort must be an integer between 1 and 65535".into())
        })?;
    Ok(TargetRequest { host, port })
}

fn decode_payload(data: Option<Value>) -> Result<Bytes, ProtocolError> {
    match data {
        Some(Value::String(s)) => Ok(Bytes::from(s)),
        Some(Value::Array(items)) => byte_array(&items),
        Some(Value::Object(obj)) => node_buffer(&obj),
        Some(other) => Err(ProtocolError::InvalidData(format!(
            "unsupported payload type: {}",
            type_name(&other)
        ))),
        None => Err(ProtocolError::InvalidData("missing data".into())),
    }
}

/// `{"type": "Buffer", "data": [..]}`, the JSON form of a Node buffer.
fn node_buffer(obj: &Map<String, Value>) -> Result<Bytes, ProtocolError> {
    match (obj.get("type").and_then(Value::as_str), obj.get("data")) {
        (Some("Buffer"), Some(Value::Array(items))) => byte_array(items),
        _ => Err(ProtocolError::InvalidData("object payload must be a serialized Buffer".into())),
    }
}

fn byte_array(items: &[Value]) -> Result<Bytes, ProtocolError> {
    items
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| {
                    ProtocolError::InvalidData(format!("element {i} is not a byte value"))
                })
        })
        .collect::<Result<Vec<u8>, _>>()
        .map(Bytes::from)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

/// Direct answer to the client that sent an envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub status: ReplyStatus,
    pub message: String,
}

impl Reply {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<&ProtocolError> for Reply {
    fn from(err: &ProtocolError) -> Self {
        Self::error(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(v: Value) -> Result<ClientMessage, ProtocolError> {
        ClientMessage::decode(Bytes::from(v.to_string()))
    }

    #[test]
    fn config_with_and_without_slash() {
        for path in ["config", "/config"] {
            let data = json!({"targetIp": "127.0.0.1", "targetPort": 3001});
            let msg = decode(json!({"path": path, "data": data})).unwrap();
            assert_eq!(
                msg,
                ClientMessage::Control(TargetRequest {
                    host: "127.0.0.1".into(),
                    port: 3001,
                })
            );
        }
    }

    #[test]
    fn config_rejects_bad_port() {
        for port in [json!(0), json!(70000), json!("3001"), json!(-1), json!(30.5)] {
            let data = json!({"targetIp": "h", "targetPort": port});
            let err = decode(json!({"path": "config", "data": data})).unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidTarget(_)), "port {port}");
        }
    }

    #[test]
    fn config_rejects_empty_host() {
        let data = json!({"targetIp": "  ", "targetPort": 1});
        let err = decode(json!({"path": "config", "data": data})).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidTarget(_)));
    }

    #[test]
    fn config_without_data_is_error() {
        assert!(decode(json!({"path": "/config"})).is_err());
    }

    #[test]
    fn data_as_byte_array() {
        let msg = decode(json!({"path": "data", "data": [104, 101, 108, 108, 111]})).unwrap();
        assert_eq!(msg, ClientMessage::Data(Bytes::from_static(b"hello")));
    }

    #[test]
    fn data_as_string() {
        let msg = decode(json!({"path": "/data", "data": "hi there"})).unwrap();
        assert_eq!(msg, ClientMessage::Data(Bytes::from_static(b"hi there")));
    }

    #[test]
    fn data_as_node_buffer() {
        let buffer = json!({"type": "Buffer", "data": [1, 2, 255]});
        let msg = decode(json!({"path": "data", "data": buffer})).unwrap();
        assert_eq!(msg, ClientMessage::Data(Bytes::from_static(&[1, 2, 255])));
    }

    #[test]
    fn data_rejects_out_of_range_byte() {
        let err = decode(json!({"path": "data", "data": [1, 256]})).unwrap_err();
        assert_eq!(err, ProtocolError::InvalidData("element 1 is not a byte value".into()));
    }

    #[test]
    fn data_rejects_number_payload() {
        let err = decode(json!({"path": "data", "data": 5})).unwrap_err();
        assert!(err.to_string().contains("number"));
    }

    #[test]
    fn event_subscribes() {
        assert_eq!(decode(json!({"path": "event"})).unwrap(), ClientMessage::Subscribe);
        assert_eq!(decode(json!({"path": "/event", "data": 1})).unwrap(), ClientMessage::Subscribe);
    }

    #[test]
    fn non_envelopes_are_raw() {
        for raw in [
            &b"plain text"[..],
            &b"[1,2,3]"[..],
            &b"{\"no\":\"path\"}"[..],
            &b"{\"path\":7}"[..],
            &b"{\"path\":\"other\"}"[..],
            &b"\xff\x00"[..],
        ] {
            let frame = Bytes::copy_from_slice(raw);
            assert_eq!(ClientMessage::decode(frame.clone()).unwrap(), ClientMessage::Raw(frame));
        }
    }

    #[test]
    fn reply_serializes_lowercase_status() {
        let v: Value = serde_json::from_str(&Reply::error("nope").to_json()).unwrap();
        assert_eq!(v, json!({"status": "error", "message": "nope"}));
        let v: Value = serde_json::from_str(&Reply::success("ok").to_json()).unwrap();
        assert_eq!(v["status"], "success");
    }
}
