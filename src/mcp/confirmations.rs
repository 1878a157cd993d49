//! Confirmation records: correlated prompt/result pairs with a deadline.
//!
//! A record is resolved exactly once, by whichever of the callback handler,
//! the reply router, or the deadline sweeper wins the compare-and-set on
//! `outcome = pending`. Resolution publishes a `ConfirmationResult`
//! envelope, an SSE event on the tenant topic, and a queued reply for late
//! `/replies` readers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use uuid::Uuid;

use crate::bus::{
    mcp_events_topic, Bus, ChannelKind, ConfirmationRequest, ConfirmationResult, Envelope,
    KvStore, Payload, TOPIC_CONFIRMATION_REQUEST, TOPIC_CONFIRMATION_RESULT,
};
use crate::error::BusError;

/// Default deadline for a confirmation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Resolved records stay readable for an hour after the deadline.
const RECORD_TTL_PAST_DEADLINE: Duration = Duration::from_secs(3600);

/// Sweeper cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

fn record_key(id: &str) -> String {
    format!("confirmation:{id}")
}

fn intent_key(chat_id: &str) -> String {
    format!("confirm_intent:{chat_id}")
}

fn feedback_key(endpoint_id: &str) -> String {
    format!("mcp:feedback:{endpoint_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    Pending,
    Confirmed,
    Rejected,
    Replied,
    Timeout,
}

impl ConfirmationOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfirmationOutcome::Pending => "pending",
            ConfirmationOutcome::Confirmed => "confirmed",
            ConfirmationOutcome::Rejected => "rejected",
            ConfirmationOutcome::Replied => "replied",
            ConfirmationOutcome::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    pub id: String,
    pub endpoint_id: String,
    pub chat_id: String,
    pub prompt: String,
    pub deadline_ts: DateTime<Utc>,
    pub outcome: ConfirmationOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

pub struct ConfirmationStore {
    kv: Arc<dyn KvStore>,
    bus: Arc<dyn Bus>,
}

impl ConfirmationStore {
    pub fn new(kv: Arc<dyn KvStore>, bus: Arc<dyn Bus>) -> Self {
        Self { kv, bus }
    }

    /// Create a pending record and publish the prompt for channel adapters
    /// to render with confirm/reject controls.
    pub async fn create(
        &self,
        endpoint_id: &str,
        chat_id: &str,
        message: &str,
        timeout: Duration,
    ) -> Result<ConfirmationRecord, BusError> {
        let now = Utc::now();
        let record = ConfirmationRecord {
            id: Uuid::new_v4().simple().to_string(),
            endpoint_id: endpoint_id.to_string(),
            chat_id: chat_id.to_string(),
            prompt: message.to_string(),
            deadline_ts: now
                + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero()),
            outcome: ConfirmationOutcome::Pending,
            reply: None,
            created_at: now,
            resolved_at: None,
        };
        let raw = serde_json::to_string(&record)?;
        let ttl = timeout + RECORD_TTL_PAST_DEADLINE;
        self.kv.set_with_ttl(&record_key(&record.id), &raw, ttl).await?;
        // Grace-window intent: the next plain-text reply from this chat is
        // routed to the record.
        self.kv
            .set_with_ttl(&intent_key(chat_id), &record.id, timeout)
            .await?;
        self.bus
            .publish(
                TOPIC_CONFIRMATION_REQUEST,
                Envelope::broadcast(
                    ChannelKind::Telegram,
                    Payload::ConfirmationRequest(ConfirmationRequest {
                        endpoint_id: record.endpoint_id.clone(),
                        correlation_id: record.id.clone(),
                        chat_id: record.chat_id.clone(),
                        message: record.prompt.clone(),
                        deadline_ts: record.deadline_ts,
                        extra: Map::new(),
                    }),
                ),
            )
            .await?;
        Ok(record)
    }

    /// Create for a chat, inferring the tenant from the reverse index. An
    /// absent tenant yields an empty endpoint id (no SSE listeners).
    pub async fn create_for_chat(
        &self,
        chat_id: &str,
        message: &str,
        timeout: Duration,
    ) -> Result<ConfirmationRecord, BusError> {
        let endpoint_id = self
            .kv
            .get(&format!("mcp:endpoint_by_chat:{chat_id}"))
            .await?
            .unwrap_or_default();
        self.create(&endpoint_id, chat_id, message, timeout).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ConfirmationRecord>, BusError> {
        match self.kv.get(&record_key(id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    /// Resolve a pending record. Returns the resolved record, or `None`
    /// when the record is absent or already resolved (late clicks are
    /// ignored).
    pub async fn resolve(
        &self,
        id: &str,
        outcome: ConfirmationOutcome,
        reply: Option<String>,
    ) -> Result<Option<ConfirmationRecord>, BusError> {
        if outcome == ConfirmationOutcome::Pending {
            return Ok(None);
        }
        let key = record_key(id);
        for _ in 0..8 {
            let raw = match self.kv.get(&key).await? {
                Some(raw) => raw,
                None => return Ok(None),
            };
            let mut record: ConfirmationRecord = match serde_json::from_str(&raw) {
                Ok(r) => r,
                Err(_) => return Ok(None),
            };
            if record.outcome != ConfirmationOutcome::Pending {
                return Ok(None);
            }
            record.outcome = outcome;
            record.reply = reply.clone();
            record.resolved_at = Some(Utc::now());
            let next = serde_json::to_string(&record)?;
            if self.kv.compare_and_swap(&key, Some(&raw), &next).await? {
                let _ = self.kv.del(&intent_key(&record.chat_id)).await;
                self.announce(&record).await?;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Route a plain-text reply from a chat to its pending record, if the
    /// grace window is open.
    pub async fn resolve_pending_for_chat(
        &self,
        chat_id: &str,
        text: &str,
    ) -> Result<Option<ConfirmationRecord>, BusError> {
        let id = match self.kv.get(&intent_key(chat_id)).await? {
            Some(id) => id,
            None => return Ok(None),
        };
        let normalized = text.trim().to_ascii_lowercase();
        let outcome = match normalized.as_str() {
            "confirm" | "ok" | "yes" => ConfirmationOutcome::Confirmed,
            "reject" | "no" | "cancel" => ConfirmationOutcome::Rejected,
            _ => ConfirmationOutcome::Replied,
        };
        let reply = if outcome == ConfirmationOutcome::Replied {
            Some(text.trim().to_string())
        } else {
            None
        };
        self.resolve(&id, outcome, reply).await
    }

    /// Queue free-form feedback for a tenant and notify SSE listeners.
    pub async fn push_feedback(&self, endpoint_id: &str, chat_id: &str, text: &str) -> Result<(), BusError> {
        let entry = serde_json::json!({ "type": "feedback", "text": text });
        self.kv
            .push(&feedback_key(endpoint_id), &entry.to_string())
            .await?;
        self.bus
            .publish(
                &mcp_events_topic(endpoint_id),
                Envelope::broadcast(
                    ChannelKind::Telegram,
                    Payload::FeedbackMessage(crate::bus::FeedbackMessage {
                        endpoint_id: endpoint_id.to_string(),
                        chat_id: chat_id.to_string(),
                        text: text.to_string(),
                        extra: Map::new(),
                    }),
                ),
            )
            .await
    }

    /// Drain the tenant reply queue (feedback plus queued resolutions).
    pub async fn drain_replies(&self, endpoint_id: &str) -> Result<Vec<serde_json::Value>, BusError> {
        Ok(self
            .kv
            .drain(&feedback_key(endpoint_id))
            .await?
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect())
    }

    async fn announce(&self, record: &ConfirmationRecord) -> Result<(), BusError> {
        let result = ConfirmationResult {
            endpoint_id: record.endpoint_id.clone(),
            correlation_id: record.id.clone(),
            outcome: record.outcome.as_str().to_string(),
            reply: record.reply.clone(),
            extra: Map::new(),
        };
        self.bus
            .publish(
                TOPIC_CONFIRMATION_RESULT,
                Envelope::broadcast(
                    ChannelKind::Telegram,
                    Payload::ConfirmationResult(result.clone()),
                ),
            )
            .await?;
        if !record.endpoint_id.is_empty() {
            self.bus
                .publish(
                    &mcp_events_topic(&record.endpoint_id),
                    Envelope::broadcast(
                        ChannelKind::Telegram,
                        Payload::ConfirmationResult(result.clone()),
                    ),
                )
                .await?;
            // Bridge for late /events subscribers.
            let queued = serde_json::json!({
                "type": "confirmation",
                "correlation_id": record.id,
                "outcome": record.outcome.as_str(),
                "reply": record.reply,
            });
            self.kv
                .push(&feedback_key(&record.endpoint_id), &queued.to_string())
                .await?;
        }
        Ok(())
    }

    /// One sweep over pending records; expired ones time out.
    pub async fn sweep(&self) -> Result<usize, BusError> {
        let now = Utc::now();
        let mut swept = 0;
        for key in self.kv.list("confirmation:").await? {
            let Some(raw) = self.kv.get(&key).await? else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<ConfirmationRecord>(&raw) else {
                continue;
            };
            if record.outcome == ConfirmationOutcome::Pending && record.deadline_ts <= now {
                if self
                    .resolve(&record.id, ConfirmationOutcome::Timeout, None)
                    .await?
                    .is_some()
                {
                    swept += 1;
                }
            }
        }
        Ok(swept)
    }
}

/// Single global sweeper loop, 1 s cadence.
pub async fn run_sweeper(store: Arc<ConfirmationStore>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        match store.sweep().await {
            Ok(0) => {}
            Ok(n) => tracing::debug!(count = n, "confirmations timed out"),
            Err(e) => tracing::warn!(error = %e, "confirmation sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusItem, MemoryBus};

    fn store() -> (Arc<MemoryBus>, ConfirmationStore) {
        let bus = Arc::new(MemoryBus::new());
        let store = ConfirmationStore::new(bus.clone(), bus.clone());
        (bus, store)
    }

    #[tokio::test]
    async fn resolution_is_exactly_once() {
        let (_bus, store) = store();
        let record = store
            .create("ep1", "chat-1", "deploy?", DEFAULT_TIMEOUT)
            .await
            .unwrap();
        let first = store
            .resolve(&record.id, ConfirmationOutcome::Confirmed, None)
            .await
            .unwrap();
        assert!(first.is_some());
        // A later click must be ignored.
        let second = store
            .resolve(&record.id, ConfirmationOutcome::Rejected, None)
            .await
            .unwrap();
        assert!(second.is_none());
        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.outcome, ConfirmationOutcome::Confirmed);
    }

    #[tokio::test]
    async fn plain_text_reply_routed_within_grace_window() {
        let (_bus, store) = store();
        let record = store
            .create("ep1", "chat-1", "name?", DEFAULT_TIMEOUT)
            .await
            .unwrap();
        let resolved = store
            .resolve_pending_for_chat("chat-1", "blue-green please")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.id, record.id);
        assert_eq!(resolved.outcome, ConfirmationOutcome::Replied);
        assert_eq!(resolved.reply.as_deref(), Some("blue-green please"));
        // The window closes with the resolution.
        assert!(store
            .resolve_pending_for_chat("chat-1", "more text")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn sweeper_times_out_expired_records() {
        let (bus, store) = store();
        let mut sub = bus.subscribe(TOPIC_CONFIRMATION_RESULT).await;
        let record = store
            .create("ep1", "chat-1", "deploy?", Duration::ZERO)
            .await
            .unwrap();
        let swept = store.sweep().await.unwrap();
        assert_eq!(swept, 1);
        let loaded = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.outcome, ConfirmationOutcome::Timeout);
        match sub.recv().await {
            Some(BusItem::Event(env)) => match env.payload {
                Payload::ConfirmationResult(r) => assert_eq!(r.outcome, "timeout"),
                other => panic!("unexpected payload: {:?}", other),
            },
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[tokio::test]
    async fn replies_queue_bridges_late_subscribers() {
        let (_bus, store) = store();
        let record = store
            .create("ep1", "chat-1", "deploy?", DEFAULT_TIMEOUT)
            .await
            .unwrap();
        store
            .resolve(&record.id, ConfirmationOutcome::Confirmed, None)
            .await
            .unwrap();
        store.push_feedback("ep1", "chat-1", "note").await.unwrap();
        let drained = store.drain_replies("ep1").await.unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0]["type"], "confirmation");
        assert_eq!(drained[1]["type"], "feedback");
        assert!(store.drain_replies("ep1").await.unwrap().is_empty());
    }
}
