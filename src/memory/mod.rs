//! Per-user memory blocks: short-term message window, rolling summary, and
//! free-form user data. All three live in the KV fabric under
//! `user:<id>:*` keys and are concatenated summary-first into the prompt.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::KvStore;
use crate::error::BusError;

/// Short-term entries persist for a week of inactivity.
const SHORT_TERM_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryMessage {
    pub role: String,
    pub content: String,
}

/// Facade over the per-user memory keys.
pub struct UserMemory {
    kv: Arc<dyn KvStore>,
    window: usize,
}

impl UserMemory {
    pub fn new(kv: Arc<dyn KvStore>, window: usize) -> Self {
        Self {
            kv,
            window: window.max(1),
        }
    }

    fn short_term_key(user_id: &str) -> String {
        format!("user:{user_id}:short_term")
    }

    fn summary_key(user_id: &str) -> String {
        format!("user:{user_id}:summary")
    }

    fn data_key(user_id: &str) -> String {
        format!("user:{user_id}:data")
    }

    /// Append one message, truncating to the last N entries.
    pub async fn append(&self, user_id: &str, role: &str, content: &str) -> Result<(), BusError> {
        let key = Self::short_term_key(user_id);
        let mut messages = self.short_term(user_id).await?;
        messages.push(MemoryMessage {
            role: role.to_string(),
            content: content.to_string(),
        });
        let excess = messages.len().saturating_sub(self.window);
        if excess > 0 {
            messages.drain(0..excess);
        }
        let raw = serde_json::to_string(&messages)?;
        self.kv.set_with_ttl(&key, &raw, SHORT_TERM_TTL).await
    }

    pub async fn short_term(&self, user_id: &str) -> Result<Vec<MemoryMessage>, BusError> {
        match self.kv.get(&Self::short_term_key(user_id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    pub async fn set_summary(&self, user_id: &str, summary: &str) -> Result<(), BusError> {
        self.kv.set(&Self::summary_key(user_id), summary).await
    }

    pub async fn set_user_data(&self, user_id: &str, data: &str) -> Result<(), BusError> {
        self.kv.set(&Self::data_key(user_id), data).await
    }

    /// Context blocks for the prompt, summary first, then user data.
    pub async fn context_blocks(&self, user_id: &str) -> Result<Vec<String>, BusError> {
        let mut blocks = Vec::new();
        if let Some(summary) = self.kv.get(&Self::summary_key(user_id)).await? {
            if !summary.trim().is_empty() {
                blocks.push(format!("Conversation summary:\n{summary}"));
            }
        }
        if let Some(data) = self.kv.get(&Self::data_key(user_id)).await? {
            if !data.trim().is_empty() {
                blocks.push(format!("Known about the user:\n{data}"));
            }
        }
        Ok(blocks)
    }

    pub async fn clear(&self, user_id: &str) -> Result<(), BusError> {
        self.kv.del(&Self::short_term_key(user_id)).await?;
        Ok(())
    }
}
