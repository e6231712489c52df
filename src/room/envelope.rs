//! Room wire envelope (JSON text frames over a websocket).
//!
//! ```json
//! {"type":"client_publish","topic":"news","rid":"r-1","data":{"text":"hi"}}
//! ```
//!
//! The room routes on the addressing fields only; `data` is never inspected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HubError, HubResult};

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ServerBroadcast,
    ServerPublish,
    ServerDirect,
    ServerPresence,
    ServerError,
    ClientBroadcast,
    ClientPublish,
    ClientDirect,
    ClientSubscribe,
    ClientUnsubscribe,
    ClientCommand,
}

impl MessageType {
    /// Whether a client may send this type.
    pub fn is_client(self) -> bool {
        matches!(
            self,
            Self::ClientBroadcast
                | Self::ClientPublish
                | Self::ClientDirect
                | Self::ClientSubscribe
                | Self::ClientUnsubscribe
                | Self::ClientCommand
        )
    }
}

/// Presence sub-types.
pub const PRESENCE_JOIN: &str = "join";
pub const PRESENCE_LEAVE: &str = "leave";

/// One room message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    /// Sender connection id; stamped by the room for client frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_cid: Option<String>,
    /// Request correlation id, echoed on error replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Free-form addressing of a logical service behind the room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            sub_type: None,
            from_cid: None,
            to_cid: None,
            rid: None,
            topic: None,
            target: None,
            data: Value::Null,
        }
    }

    pub fn broadcast(data: Value) -> Self {
        Self::new(MessageType::ServerBroadcast).with_data(data)
    }

    pub fn publish(topic: &str, data: Value) -> Self {
        let mut envelope = Self::new(MessageType::ServerPublish).with_data(data);
        envelope.topic = Some(topic.to_string());
        envelope
    }

    pub fn direct(to_cid: &str, data: Value) -> Self {
        let mut envelope = Self::new(MessageType::ServerDirect).with_data(data);
        envelope.to_cid = Some(to_cid.to_string());
        envelope
    }

    pub fn presence(sub_type: &str, conn_id: &str) -> Self {
        let mut envelope = Self::new(MessageType::ServerPresence);
        envelope.sub_type = Some(sub_type.to_string());
        envelope.from_cid = Some(conn_id.to_string());
        envelope
    }

    /// Error reply echoing the failed request's `rid`.
    pub fn error(rid: Option<String>, message: impl Into<String>) -> Self {
        let mut envelope = Self::new(MessageType::ServerError);
        envelope.rid = rid;
        envelope.data = Value::String(message.into());
        envelope
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Re-tag a client frame as the server frame it fans out as.
    pub fn relabel(mut self, kind: MessageType) -> Self {
        self.kind = kind;
        self
    }

    /// Parse a text frame.
    pub fn parse(text: &str) -> HubResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| HubError::validation(format!("malformed envelope: {}", e)))
    }

    /// Encode as a text frame.
    pub fn to_text(&self) -> HubResult<String> {
        serde_json::to_string(self)
            .map_err(|e| HubError::validation(format!("unencodable envelope: {}", e)))
    }
}
