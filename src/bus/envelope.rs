//! Wire envelopes carried on the bus.
//!
//! Every envelope is one flat JSON object: a versioned header (schema,
//! task_id, channel, seq, ts) plus the payload fields selected by `kind`.
//! Unknown fields survive a deserialize/serialize round trip via the
//! flattened `extra` map on each payload, so forwarding workers never strip
//! what a newer writer added.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current envelope schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Hard cap on a serialized envelope.
pub const MAX_ENVELOPE_BYTES: usize = 64 * 1024;

/// Origin/destination channel tag. Adapters filter by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Telegram,
    Web,
    Cli,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Telegram => write!(f, "telegram"),
            ChannelKind::Web => write!(f, "web"),
            ChannelKind::Cli => write!(f, "cli"),
        }
    }
}

/// Published when a user sends a message through a channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message_id: String,
    pub user_id: String,
    pub chat_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub reasoning_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Final (or final-sync) reply for a task. Adapters filter by channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingReply {
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub done: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One delta chunk of a streamed reply. Ordered by the envelope `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamToken {
    pub chat_id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub done: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Orchestrator asks the skill dispatcher to run a named skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Skill dispatcher answers a `ToolRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub name: String,
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A confirmation prompt to be rendered with confirm/reject controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub endpoint_id: String,
    pub correlation_id: String,
    pub chat_id: String,
    pub message: String,
    pub deadline_ts: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Resolution of a confirmation prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationResult {
    pub endpoint_id: String,
    pub correlation_id: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Free-form user feedback routed to a tenant queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackMessage {
    pub endpoint_id: String,
    pub chat_id: String,
    pub text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Typed payload, tagged by `kind` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    IncomingMessage(IncomingMessage),
    OutgoingReply(OutgoingReply),
    StreamToken(StreamToken),
    ToolRequest(ToolRequest),
    ToolResult(ToolResult),
    ConfirmationRequest(ConfirmationRequest),
    ConfirmationResult(ConfirmationResult),
    FeedbackMessage(FeedbackMessage),
}

impl Payload {
    /// Short name used in logs and audit entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::IncomingMessage(_) => "incoming_message",
            Payload::OutgoingReply(_) => "outgoing_reply",
            Payload::StreamToken(_) => "stream_token",
            Payload::ToolRequest(_) => "tool_request",
            Payload::ToolResult(_) => "tool_result",
            Payload::ConfirmationRequest(_) => "confirmation_request",
            Payload::ConfirmationResult(_) => "confirmation_result",
            Payload::FeedbackMessage(_) => "feedback_message",
        }
    }
}

/// A message on the bus: versioned header plus typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_schema")]
    pub schema: u32,
    /// Empty for broadcasts not tied to a task.
    #[serde(default)]
    pub task_id: String,
    pub channel: ChannelKind,
    /// Monotonic within a task; 0 for unordered envelopes.
    #[serde(default)]
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Payload,
}

fn default_schema() -> u32 {
    SCHEMA_VERSION
}

impl Envelope {
    /// Build an envelope with a fresh timestamp and no task binding.
    pub fn broadcast(channel: ChannelKind, payload: Payload) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            task_id: String::new(),
            channel,
            seq: 0,
            ts: Utc::now(),
            payload,
        }
    }

    /// Build an envelope bound to a task with an explicit sequence number.
    pub fn for_task(
        task_id: impl Into<String>,
        channel: ChannelKind,
        seq: u64,
        payload: Payload,
    ) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            task_id: task_id.into(),
            channel,
            seq,
            ts: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_token_round_trips() {
        let env = Envelope::for_task(
            "t-1",
            ChannelKind::Telegram,
            3,
            Payload::StreamToken(StreamToken {
                chat_id: "42".into(),
                token: "he".into(),
                done: false,
                extra: Map::new(),
            }),
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, "t-1");
        assert_eq!(back.seq, 3);
        match back.payload {
            Payload::StreamToken(t) => {
                assert_eq!(t.token, "he");
                assert!(!t.done);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn unknown_fields_survive_forwarding() {
        let env = Envelope::broadcast(
            ChannelKind::Telegram,
            Payload::OutgoingReply(OutgoingReply {
                chat_id: "1".into(),
                message_id: None,
                text: "hi".into(),
                done: true,
                extra: Map::new(),
            }),
        );
        let mut value = serde_json::to_value(&env).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert("x_trace".into(), Value::String("abc".into()));

        // First hop: deserialize, forward, deserialize again.
        let hop: Envelope = serde_json::from_value(value).unwrap();
        let forwarded = serde_json::to_value(&hop).unwrap();
        let second: Envelope = serde_json::from_value(forwarded).unwrap();
        match second.payload {
            Payload::OutgoingReply(r) => {
                assert_eq!(r.extra.get("x_trace"), Some(&Value::String("abc".into())));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn wire_format_is_flat() {
        let env = Envelope::for_task(
            "t-9",
            ChannelKind::Telegram,
            1,
            Payload::ToolRequest(ToolRequest {
                name: "filesystem".into(),
                arguments: serde_json::json!({"action": "read", "path": "a.txt"}),
                extra: Map::new(),
            }),
        );
        let value = serde_json::to_value(&env).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.get("kind").unwrap(), "tool_request");
        assert_eq!(obj.get("name").unwrap(), "filesystem");
        assert_eq!(obj.get("task_id").unwrap(), "t-9");
    }
}
