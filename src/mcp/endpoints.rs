//! Tenant endpoint registry.
//!
//! Each endpoint maps an opaque id to a delivery chat plus a bearer secret.
//! Secrets are stored as sha256 hashes; the plain value is returned exactly
//! once at creation. Verification compares digests in constant time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::bus::KvStore;
use crate::error::BusError;

fn endpoint_key(id: &str) -> String {
    format!("mcp:endpoint:{id}")
}

fn by_chat_key(chat_id: &str) -> String {
    format!("mcp:endpoint_by_chat:{chat_id}")
}

/// Stored endpoint record (never contains the plain secret).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpEndpoint {
    pub id: String,
    pub name: String,
    pub chat_id: String,
    pub secret_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
}

fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Constant-time equality over the hex digests: every byte is visited
/// regardless of where the first mismatch sits.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub struct EndpointRegistry {
    kv: Arc<dyn KvStore>,
}

impl EndpointRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Create an endpoint; returns the record and the one-time plain
    /// secret.
    pub async fn create(
        &self,
        name: &str,
        chat_id: &str,
    ) -> Result<(McpEndpoint, String), BusError> {
        let id = Uuid::new_v4().simple().to_string()[..16].to_string();
        let secret = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let endpoint = McpEndpoint {
            id: id.clone(),
            name: name.to_string(),
            chat_id: chat_id.to_string(),
            secret_hash: hash_secret(&secret),
            created_at: Utc::now(),
            revoked: false,
        };
        let raw = serde_json::to_string(&endpoint)?;
        self.kv.set(&endpoint_key(&id), &raw).await?;
        // Oldest endpoint wins the reverse mapping; do not overwrite.
        let _ = self.kv.set_nx(&by_chat_key(chat_id), &id).await?;
        Ok((endpoint, secret))
    }

    pub async fn get(&self, id: &str) -> Result<Option<McpEndpoint>, BusError> {
        match self.kv.get(&endpoint_key(id)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    /// Active endpoint for a bearer check; `None` covers unknown and
    /// revoked alike.
    pub async fn verify(&self, id: &str, secret: &str) -> Result<Option<McpEndpoint>, BusError> {
        let endpoint = match self.get(id).await? {
            Some(e) if !e.revoked => e,
            _ => return Ok(None),
        };
        if constant_time_eq(&hash_secret(secret), &endpoint.secret_hash) {
            Ok(Some(endpoint))
        } else {
            Ok(None)
        }
    }

    /// Tenant inferred from a chat id (oldest endpoint for that chat).
    pub async fn endpoint_for_chat(&self, chat_id: &str) -> Result<Option<String>, BusError> {
        self.kv.get(&by_chat_key(chat_id)).await
    }

    pub async fn list(&self) -> Result<Vec<McpEndpoint>, BusError> {
        let mut out = Vec::new();
        for key in self.kv.list("mcp:endpoint:").await? {
            if let Some(raw) = self.kv.get(&key).await? {
                if let Ok(endpoint) = serde_json::from_str::<McpEndpoint>(&raw) {
                    out.push(endpoint);
                }
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    pub async fn revoke(&self, id: &str) -> Result<bool, BusError> {
        let endpoint = match self.get(id).await? {
            Some(e) => e,
            None => return Ok(false),
        };
        let mut revoked = endpoint.clone();
        revoked.revoked = true;
        let raw = serde_json::to_string(&revoked)?;
        self.kv.set(&endpoint_key(id), &raw).await?;
        if self.endpoint_for_chat(&endpoint.chat_id).await? == Some(id.to_string()) {
            self.kv.del(&by_chat_key(&endpoint.chat_id)).await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    fn registry() -> EndpointRegistry {
        EndpointRegistry::new(Arc::new(MemoryBus::new()))
    }

    #[tokio::test]
    async fn create_and_verify() {
        let reg = registry();
        let (endpoint, secret) = reg.create("agent", "chat-1").await.unwrap();
        assert!(reg.verify(&endpoint.id, &secret).await.unwrap().is_some());
        assert!(reg.verify(&endpoint.id, "wrong").await.unwrap().is_none());
        assert!(reg.verify("missing", &secret).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn revoked_endpoint_fails_verification() {
        let reg = registry();
        let (endpoint, secret) = reg.create("agent", "chat-1").await.unwrap();
        assert!(reg.revoke(&endpoint.id).await.unwrap());
        assert!(reg.verify(&endpoint.id, &secret).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chat_mapping_keeps_oldest() {
        let reg = registry();
        let (first, _) = reg.create("a", "chat-1").await.unwrap();
        let (_second, _) = reg.create("b", "chat-1").await.unwrap();
        assert_eq!(
            reg.endpoint_for_chat("chat-1").await.unwrap(),
            Some(first.id)
        );
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }
}
