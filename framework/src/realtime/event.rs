//! Events pushed to dashboard streams

use crate::realtime::channel::ChannelName;
use bytes::Bytes;
use serde_json::{json, Map, Value};

/// Event type of the greeting sent on every new subscription
pub const CONNECTION_READY: &str = "connection_ready";

const DEFAULT_KIND: &str = "message";

/// One event on the wire
///
/// Framed as `event: <kind>\ndata: <json>\n\n`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    pub kind: String,
    pub data: Value,
}

impl ServerEvent {
    /// Build an event; an object `data` gets the kind stamped in as `type`
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        let kind = kind.into();
        let data = match data {
            Value::Object(mut map) => {
                map.insert("type".to_string(), Value::String(kind.clone()));
                Value::Object(map)
            }
            Value::Null => {
                let mut map = Map::new();
                map.insert("type".to_string(), Value::String(kind.clone()));
                Value::Object(map)
            }
            other => json!({ "type": kind.clone(), "data": other }),
        };
        Self { kind, data }
    }

    pub fn connection_ready(channel: &ChannelName) -> Self {
        Self {
            kind: CONNECTION_READY.to_string(),
            data: json!({ "channel": channel.as_str() }),
        }
    }

    /// Decode a payload received from the pub/sub transport
    ///
    /// The event type comes from the payload's `type` field, falling back to
    /// `message`.
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        let data: Value = serde_json::from_str(payload)?;
        let kind = data
            .get("type")
            .and_then(Value::as_str)
            .filter(|kind| !kind.is_empty())
            .unwrap_or(DEFAULT_KIND)
            .to_string();
        Ok(Self { kind, data })
    }

    /// Payload published on the pub/sub transport
    pub fn to_payload(&self) -> String {
        self.data.to_string()
    }

    /// Encode as one event-stream frame
    pub fn encode(&self) -> Bytes {
        let kind: String = self
            .kind
            .chars()
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        Bytes::from(format!("event: {}\ndata: {}\n\n", kind, self.data))
    }
}

/// Comment frame that keeps idle streams open through proxies
pub fn keep_alive_frame() -> Bytes {
    Bytes::from_static(b": keep-alive\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn connection_ready_frame() {
        let event = ServerEvent::connection_ready(&ChannelName::workspace(3));
        assert_eq!(
            event.encode(),
            Bytes::from("event: connection_ready\ndata: {\"channel\":\"workspace:3\"}\n\n")
        );
    }

    #[test]
    fn payload_type_becomes_the_event_name() {
        let event = ServerEvent::from_payload(r#"{"type":"follow_up.paused","id":7}"#).unwrap();
        assert_eq!(event.kind, "follow_up.paused");
        assert_eq!(event.data["id"], 7);

        let untyped = ServerEvent::from_payload(r#"{"id":7}"#).unwrap();
        assert_eq!(untyped.kind, "message");

        assert!(ServerEvent::from_payload("not json").is_err());
    }

    #[test]
    fn new_stamps_the_type_field() {
        let event = ServerEvent::new("x", json!({"a": 1}));
        assert_eq!(event.data, json!({"a": 1, "type": "x"}));

        let decoded = ServerEvent::from_payload(&event.to_payload()).unwrap();
        assert_eq!(decoded, event);

        let scalar = ServerEvent::new("count", json!(3));
        assert_eq!(scalar.data, json!({"type": "count", "data": 3}));
    }

    #[test]
    fn event_names_cannot_break_framing() {
        let event = ServerEvent {
            kind: "evil\ndata: x".to_string(),
            data: json!({}),
        };
        assert_eq!(event.encode(), Bytes::from("event: evil data: x\ndata: {}\n\n"));
    }
}
