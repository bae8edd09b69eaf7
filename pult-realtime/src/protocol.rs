//! Wire protocol: frame shape, reserved event names, binding keys, and JSON
//! encode/decode.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::Error;

// ---------------------------------------------------------------------------
// Reserved event names
// ---------------------------------------------------------------------------

pub mod event {
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const HEARTBEAT_REPLY: &str = "heartbeat_reply";
    pub const BROADCAST: &str = "broadcast";
    pub const PRESENCE: &str = "presence";
}

/// Topic used for connection-level frames that belong to no channel.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// Table name that matches every table in a change binding.
pub const ANY_TABLE: &str = "*";

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A single message in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default = "empty_payload")]
    pub payload: Value,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

impl Frame {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: None,
        }
    }
}

pub fn encode_frame(frame: &Frame) -> Result<String, Error> {
    Ok(serde_json::to_string(frame)?)
}

pub fn decode_frame(text: &str) -> Result<Frame, Error> {
    Ok(serde_json::from_str(text)?)
}

// ---------------------------------------------------------------------------
// Frame builders
// ---------------------------------------------------------------------------

pub fn join_frame(topic: &str, config: Value) -> Frame {
    Frame::new(topic, event::JOIN, json!({ "config": config }))
}

pub fn leave_frame(topic: &str) -> Frame {
    Frame::new(topic, event::LEAVE, empty_payload())
}

pub fn heartbeat_frame(reference: u64) -> Frame {
    Frame {
        reference: Some(reference.to_string()),
        ..Frame::new(HEARTBEAT_TOPIC, event::HEARTBEAT, empty_payload())
    }
}

pub fn broadcast_frame(topic: &str, name: &str, payload: Value) -> Frame {
    Frame::new(
        topic,
        event::BROADCAST,
        json!({ "event": name, "payload": payload }),
    )
}

pub fn track_frame(topic: &str, meta: Value) -> Frame {
    Frame::new(
        topic,
        event::PRESENCE,
        json!({ "event": "track", "payload": meta }),
    )
}

// ---------------------------------------------------------------------------
// Binding keys
// ---------------------------------------------------------------------------

/// Row-change event category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeEvent {
    Insert,
    Update,
    Delete,
    /// Matches every change category.
    All,
}

impl ChangeEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeEvent::Insert => "INSERT",
            ChangeEvent::Update => "UPDATE",
            ChangeEvent::Delete => "DELETE",
            ChangeEvent::All => "*",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(ChangeEvent::Insert),
            "UPDATE" => Some(ChangeEvent::Update),
            "DELETE" => Some(ChangeEvent::Delete),
            "*" => Some(ChangeEvent::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresencePhase {
    Sync,
    Join,
    Leave,
}

impl PresencePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            PresencePhase::Sync => "sync",
            PresencePhase::Join => "join",
            PresencePhase::Leave => "leave",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(PresencePhase::Sync),
            "join" => Some(PresencePhase::Join),
            "leave" => Some(PresencePhase::Leave),
            _ => None,
        }
    }
}

/// Key under which callbacks are bound on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindingKey {
    Change { event: ChangeEvent, table: String },
    Broadcast(String),
    Presence(PresencePhase),
}

impl BindingKey {
    /// Every key an inbound event named `name` on `table` should reach.
    ///
    /// Change keys are only produced for row-change event names; the table
    /// wildcard and the event wildcard are both included, so a single event
    /// may match several keys.
    pub fn candidates(name: &str, table: &str) -> Vec<BindingKey> {
        let mut keys = Vec::with_capacity(6);
        if let Some(change) = ChangeEvent::from_wire(name) {
            for event in [change, ChangeEvent::All] {
                for t in [table, ANY_TABLE] {
                    let key = BindingKey::Change {
                        event,
                        table: t.to_string(),
                    };
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.push(BindingKey::Broadcast(name.to_string()));
        if let Some(phase) = PresencePhase::from_wire(name) {
            keys.push(BindingKey::Presence(phase));
        }
        keys
    }

    /// Keys an inbound frame named `name` with `payload` should reach.
    ///
    /// A `broadcast` or `presence` envelope carrying a string `event` only
    /// reaches keys of its own category: `broadcast:<event>` or
    /// `presence:<phase>`. Anything else goes through [`candidates`] with the
    /// payload's `table` (empty when absent).
    ///
    /// [`candidates`]: BindingKey::candidates
    pub fn for_frame(name: &str, payload: &Value) -> Vec<BindingKey> {
        match (name, payload.get("event").and_then(Value::as_str)) {
            (event::BROADCAST, Some(inner)) => vec![BindingKey::Broadcast(inner.to_string())],
            (event::PRESENCE, Some(inner)) => PresencePhase::from_wire(inner)
                .map(BindingKey::Presence)
                .into_iter()
                .collect(),
            _ => {
                let table = payload.get("table").and_then(Value::as_str).unwrap_or("");
                BindingKey::candidates(name, table)
            }
        }
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingKey::Change { event, table } => write!(f, "{}:{table}", event.as_str()),
            BindingKey::Broadcast(name) => write!(f, "broadcast:{name}"),
            BindingKey::Presence(phase) => write!(f, "presence:{}", phase.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_change_frame() {
        let frame = decode_frame(
            r#"{"topic":"T","event":"INSERT","payload":{"table":"orders","id":7}}"#,
        )
        .unwrap();
        assert_eq!(frame.topic, "T");
        assert_eq!(frame.event, "INSERT");
        assert_eq!(frame.payload["table"], "orders");
        assert!(frame.reference.is_none());
    }

    #[test]
    fn decode_frame_without_payload() {
        let frame = decode_frame(r#"{"topic":"T","event":"leave"}"#).unwrap();
        assert_eq!(frame.payload, json!({}));
    }

    #[test]
    fn decode_rejects_missing_topic() {
        assert!(decode_frame(r#"{"event":"INSERT","payload":{}}"#).is_err());
        assert!(decode_frame("not json").is_err());
    }

    #[test]
    fn heartbeat_carries_ref() {
        let frame = heartbeat_frame(3);
        let text = encode_frame(&frame).unwrap();
        assert!(text.contains(r#""ref":"3""#));
        assert!(text.contains(r#""topic":"phoenix""#));
        assert!(text.contains(r#""event":"heartbeat""#));
    }

    #[test]
    fn plain_frames_omit_ref() {
        let text = encode_frame(&leave_frame("room")).unwrap();
        assert!(!text.contains("ref"));
    }

    #[test]
    fn join_frame_wraps_config() {
        let frame = join_frame("room", json!({"broadcast": {"self": false}}));
        assert_eq!(frame.event, event::JOIN);
        assert_eq!(frame.payload["config"]["broadcast"]["self"], false);
    }

    #[test]
    fn broadcast_and_track_envelopes() {
        let b = broadcast_frame("room", "typing", json!({"user": "a"}));
        assert_eq!(b.event, event::BROADCAST);
        assert_eq!(b.payload, json!({"event": "typing", "payload": {"user": "a"}}));

        let t = track_frame("room", json!({"status": "online"}));
        assert_eq!(t.event, event::PRESENCE);
        assert_eq!(t.payload["event"], "track");
        assert_eq!(t.payload["payload"]["status"], "online");
    }

    #[test]
    fn envelopes_stay_in_their_category() {
        assert_eq!(
            BindingKey::for_frame("broadcast", &json!({"event": "leave"})),
            vec![BindingKey::Broadcast("leave".to_string())]
        );
        assert_eq!(
            BindingKey::for_frame("presence", &json!({"event": "join"})),
            vec![BindingKey::Presence(PresencePhase::Join)]
        );
        assert!(BindingKey::for_frame("presence", &json!({"event": "track"})).is_empty());
    }

    #[test]
    fn plain_frames_use_candidates() {
        assert_eq!(
            BindingKey::for_frame("INSERT", &json!({"table": "orders", "event": "x"})),
            BindingKey::candidates("INSERT", "orders")
        );
        assert_eq!(
            BindingKey::for_frame("broadcast", &json!({})),
            vec![BindingKey::Broadcast("broadcast".to_string())]
        );
    }

    #[test]
    fn binding_key_display() {
        let key = BindingKey::Change {
            event: ChangeEvent::Insert,
            table: "orders".to_string(),
        };
        assert_eq!(key.to_string(), "INSERT:orders");
        assert_eq!(BindingKey::Broadcast("typing".into()).to_string(), "broadcast:typing");
        assert_eq!(
            BindingKey::Presence(PresencePhase::Sync).to_string(),
            "presence:sync"
        );
    }

    #[test]
    fn candidates_for_change_event() {
        let keys = BindingKey::candidates("INSERT", "orders");
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "INSERT:orders",
                "INSERT:*",
                "*:orders",
                "*:*",
                "broadcast:INSERT"
            ]
        );
    }

    #[test]
    fn candidates_without_table_only_reach_wildcards() {
        let keys = BindingKey::candidates("DELETE", "");
        assert!(keys.contains(&BindingKey::Change {
            event: ChangeEvent::Delete,
            table: ANY_TABLE.to_string(),
        }));
        assert!(!keys.contains(&BindingKey::Change {
            event: ChangeEvent::Delete,
            table: "orders".to_string(),
        }));
    }

    #[test]
    fn candidates_for_presence_phase() {
        let keys = BindingKey::candidates("join", "");
        assert_eq!(
            keys,
            vec![
                BindingKey::Broadcast("join".to_string()),
                BindingKey::Presence(PresencePhase::Join),
            ]
        );
    }

    #[test]
    fn candidates_dedup_wildcard_event() {
        let keys = BindingKey::candidates("*", "*");
        assert_eq!(
            keys.iter()
                .filter(|k| matches!(k, BindingKey::Change { .. }))
                .count(),
            1
        );
    }
}
