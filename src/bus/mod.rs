//! Event bus: typed envelope transport plus the KV fabric behind it.
//!
//! The bus is a thin seam over a shared pub/sub + key/value store. The
//! in-process implementation in [`memory`] backs a single-host deployment;
//! a networked store would implement the same two traits.

mod envelope;
pub mod memory;

pub use envelope::{
    ChannelKind, ConfirmationRequest, ConfirmationResult, Envelope, FeedbackMessage,
    IncomingMessage, OutgoingReply, Payload, StreamToken, ToolRequest, ToolResult,
    MAX_ENVELOPE_BYTES, SCHEMA_VERSION,
};
pub use memory::MemoryBus;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::BusError;

/// Incoming messages from channel adapters.
pub const TOPIC_INCOMING: &str = "assistant:incoming";
/// Final replies to channel adapters.
pub const TOPIC_OUTGOING_REPLY: &str = "assistant:outgoing_reply";
/// Streamed reply deltas.
pub const TOPIC_STREAM_TOKEN: &str = "assistant:stream_token";
/// Skill invocations requested by the orchestrator.
pub const TOPIC_TOOL_REQUEST: &str = "assistant:tool_request";
/// Skill results from the dispatcher.
pub const TOPIC_TOOL_RESULT: &str = "assistant:tool_result";
/// Confirmation prompts for channel adapters to render.
pub const TOPIC_CONFIRMATION_REQUEST: &str = "assistant:confirmation_request";
/// Confirmation resolutions.
pub const TOPIC_CONFIRMATION_RESULT: &str = "assistant:confirmation_result";
/// Restart requests from the administrative surface.
pub const TOPIC_RESTART_REQUESTED: &str = "assistant:action:restart_requested";

/// Per-tenant event topic feeding the MCP SSE stream.
pub fn mcp_events_topic(endpoint_id: &str) -> String {
    format!("assistant:mcp:events:{endpoint_id}")
}

/// One item received from a subscription.
#[derive(Debug)]
pub enum BusItem {
    /// A delivered envelope.
    Event(Envelope),
    /// The subscriber fell behind and `skipped` envelopes were dropped.
    /// Consumers bound to a task must treat this as data loss.
    Gap { skipped: u64 },
}

/// A restartable subscription to one topic. Delivery is at most once;
/// consumers are expected to be idempotent on retries.
pub struct BusSubscription {
    rx: broadcast::Receiver<Envelope>,
}

impl BusSubscription {
    pub(crate) fn new(rx: broadcast::Receiver<Envelope>) -> Self {
        Self { rx }
    }

    /// Receive the next item, or `None` once the topic is closed.
    pub async fn recv(&mut self) -> Option<BusItem> {
        match self.rx.recv().await {
            Ok(env) => Some(BusItem::Event(env)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Some(BusItem::Gap { skipped }),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Receive with a deadline. `Ok(None)` means the topic closed,
    /// `Err(())` means the deadline elapsed.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<BusItem>, ()> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(item) => Ok(item),
            Err(_) => Err(()),
        }
    }
}

/// Pub/sub face of the fabric.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Broadcast to all current subscribers; no replay for late joiners.
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), BusError>;

    /// Subscribe to a topic. Envelopes published before this call are not
    /// delivered.
    async fn subscribe(&self, topic: &str) -> BusSubscription;
}

/// Key/value face of the fabric. Keys are namespaced strings
/// (`task:<id>`, `mcp:endpoint:<id>`, `config:<dotted.key>`, ...).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BusError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), BusError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BusError>;

    /// Set only if the key does not exist. Returns whether the write won.
    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, BusError>;

    /// Atomic compare-and-swap. `expected = None` means "key must be
    /// absent". Returns whether the swap was applied.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, BusError>;

    async fn del(&self, key: &str) -> Result<bool, BusError>;

    /// List keys under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BusError>;

    /// Append to a list-valued key.
    async fn push(&self, key: &str, value: &str) -> Result<(), BusError>;

    /// Atomically take and clear a list-valued key.
    async fn drain(&self, key: &str) -> Result<Vec<String>, BusError>;
}
