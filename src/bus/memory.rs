//! In-process bus: tokio broadcast channels per topic plus a KV map with
//! per-key expiry. Publishing to a topic nobody subscribes to is not an
//! error; the KV store remains the durable side.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use crate::bus::{Bus, BusSubscription, Envelope, KvStore, MAX_ENVELOPE_BYTES};
use crate::error::BusError;

const DEFAULT_TOPIC_CAPACITY: usize = 1024;

#[derive(Clone)]
struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| t > Instant::now()).unwrap_or(true)
    }
}

#[derive(Clone)]
enum Slot {
    Value(KvEntry),
    List(Vec<String>),
}

/// Shared in-process fabric: pub/sub and KV in one place.
pub struct MemoryBus {
    topics: RwLock<HashMap<String, broadcast::Sender<Envelope>>>,
    kv: RwLock<HashMap<String, Slot>>,
    capacity: usize,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Per-topic broadcast capacity; subscribers that lag past it observe
    /// a gap.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            kv: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    async fn sender(&self, topic: &str) -> broadcast::Sender<Envelope> {
        if let Some(tx) = self.topics.read().await.get(topic) {
            return tx.clone();
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), BusError> {
        let size = serde_json::to_vec(&envelope)?.len();
        if size > MAX_ENVELOPE_BYTES {
            return Err(BusError::EnvelopeTooLarge {
                topic: topic.to_string(),
                size,
                limit: MAX_ENVELOPE_BYTES,
            });
        }
        let tx = self.sender(topic).await;
        // No subscribers is fine; broadcast has no replay for late joiners.
        let _ = tx.send(envelope);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> BusSubscription {
        BusSubscription::new(self.sender(topic).await.subscribe())
    }
}

#[async_trait]
impl KvStore for MemoryBus {
    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        let kv = self.kv.read().await;
        match kv.get(key) {
            Some(Slot::Value(entry)) if entry.live() => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BusError> {
        self.kv.write().await.insert(
            key.to_string(),
            Slot::Value(KvEntry {
                value: value.to_string(),
                expires_at: None,
            }),
        );
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), BusError> {
        self.kv.write().await.insert(
            key.to_string(),
            Slot::Value(KvEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            }),
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> Result<bool, BusError> {
        let mut kv = self.kv.write().await;
        match kv.get(key) {
            Some(Slot::Value(entry)) if entry.live() => Ok(false),
            Some(Slot::List(_)) => Ok(false),
            _ => {
                kv.insert(
                    key.to_string(),
                    Slot::Value(KvEntry {
                        value: value.to_string(),
                        expires_at: None,
                    }),
                );
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, BusError> {
        let mut kv = self.kv.write().await;
        let current = match kv.get(key) {
            Some(Slot::Value(entry)) if entry.live() => Some(entry.value.clone()),
            _ => None,
        };
        if current.as_deref() != expected {
            return Ok(false);
        }
        // Preserve a live entry's expiry; a fresh key has none.
        let expires_at = match kv.get(key) {
            Some(Slot::Value(entry)) if entry.live() => entry.expires_at,
            _ => None,
        };
        kv.insert(
            key.to_string(),
            Slot::Value(KvEntry {
                value: value.to_string(),
                expires_at,
            }),
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool, BusError> {
        Ok(self.kv.write().await.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BusError> {
        let kv = self.kv.read().await;
        let mut keys: Vec<String> = kv
            .iter()
            .filter(|(k, slot)| {
                k.starts_with(prefix)
                    && match slot {
                        Slot::Value(entry) => entry.live(),
                        Slot::List(items) => !items.is_empty(),
                    }
            })
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn push(&self, key: &str, value: &str) -> Result<(), BusError> {
        let mut kv = self.kv.write().await;
        match kv.get_mut(key) {
            Some(Slot::List(items)) => items.push(value.to_string()),
            _ => {
                kv.insert(key.to_string(), Slot::List(vec![value.to_string()]));
            }
        }
        Ok(())
    }

    async fn drain(&self, key: &str) -> Result<Vec<String>, BusError> {
        let mut kv = self.kv.write().await;
        match kv.remove(key) {
            Some(Slot::List(items)) => Ok(items),
            Some(other) => {
                // Not a list; put it back untouched.
                kv.insert(key.to_string(), other);
                Ok(Vec::new())
            }
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChannelKind, Payload, StreamToken};
    use serde_json::Map;

    fn token_env(seq: u64) -> Envelope {
        Envelope::for_task(
            "t-1",
            ChannelKind::Telegram,
            seq,
            Payload::StreamToken(StreamToken {
                chat_id: "1".into(),
                token: "x".into(),
                done: false,
                extra: Map::new(),
            }),
        )
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("assistant:stream_token").await;
        bus.publish("assistant:stream_token", token_env(1))
            .await
            .unwrap();
        match sub.recv().await {
            Some(crate::bus::BusItem::Event(env)) => assert_eq!(env.seq, 1),
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = MemoryBus::new();
        bus.publish("assistant:stream_token", token_env(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lagged_subscriber_sees_gap() {
        let bus = MemoryBus::with_capacity(2);
        let mut sub = bus.subscribe("assistant:stream_token").await;
        for seq in 1..=5 {
            bus.publish("assistant:stream_token", token_env(seq))
                .await
                .unwrap();
        }
        match sub.recv().await {
            Some(crate::bus::BusItem::Gap { skipped }) => assert!(skipped > 0),
            other => panic!("expected gap, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn kv_set_nx_and_cas() {
        let bus = MemoryBus::new();
        assert!(bus.set_nx("task:1", "a").await.unwrap());
        assert!(!bus.set_nx("task:1", "b").await.unwrap());
        assert!(bus.compare_and_swap("task:1", Some("a"), "c").await.unwrap());
        assert!(!bus.compare_and_swap("task:1", Some("a"), "d").await.unwrap());
        assert_eq!(bus.get("task:1").await.unwrap().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn kv_ttl_expires() {
        let bus = MemoryBus::new();
        bus.set_with_ttl("rl:1", "x", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(bus.get("rl:1").await.unwrap().is_none());
        // Expired key counts as absent for set_nx.
        assert!(bus.set_nx("rl:1", "y").await.unwrap());
    }

    #[tokio::test]
    async fn list_push_and_drain() {
        let bus = MemoryBus::new();
        bus.push("mcp:feedback:e1", "a").await.unwrap();
        bus.push("mcp:feedback:e1", "b").await.unwrap();
        assert_eq!(bus.drain("mcp:feedback:e1").await.unwrap(), vec!["a", "b"]);
        assert!(bus.drain("mcp:feedback:e1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_envelope_rejected() {
        let bus = MemoryBus::new();
        let mut env = token_env(1);
        if let Payload::StreamToken(ref mut t) = env.payload {
            t.token = "x".repeat(MAX_ENVELOPE_BYTES + 1);
        }
        let err = bus.publish("assistant:stream_token", env).await.unwrap_err();
        assert!(matches!(err, BusError::EnvelopeTooLarge { .. }));
    }
}
