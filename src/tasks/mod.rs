//! Task records and the store that owns their lifecycle.
//!
//! One task per incoming message. All mutation goes through compare-and-set
//! on the serialized record, so the claim protocol holds even with several
//! core processes sharing the KV fabric: exactly one worker owns the
//! transitions of a live task.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::{ChannelKind, KvStore};
use crate::error::TaskError;

/// Record schema version; a mismatch reads as unreadable and the task is
/// re-created on the next incoming message.
pub const TASK_SCHEMA_VERSION: u32 = 1;

/// TTL applied to terminal task records.
pub const TERMINAL_TTL: Duration = Duration::from_secs(2 * 60 * 60);

const TASK_PREFIX: &str = "task:";

fn task_key(id: &str) -> String {
    format!("{TASK_PREFIX}{id}")
}

fn user_index_key(user_id: &str) -> String {
    format!("user_tasks:{user_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    AwaitingTool,
    AwaitingConfirmation,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::AwaitingTool => "awaiting_tool",
            TaskStatus::AwaitingConfirmation => "awaiting_confirmation",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One entry of the short-term conversation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowEntry {
    pub role: String,
    pub text: String,
}

/// Durable record of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub schema: u32,
    pub id: String,
    pub user_id: String,
    pub channel: ChannelKind,
    pub chat_id: String,
    pub origin_message_id: String,
    pub status: TaskStatus,
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub window: Vec<WindowEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        user_id: impl Into<String>,
        channel: ChannelKind,
        chat_id: impl Into<String>,
        origin_message_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema: TASK_SCHEMA_VERSION,
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            channel,
            chat_id: chat_id.into(),
            origin_message_id: origin_message_id.into(),
            status: TaskStatus::Pending,
            iterations: 0,
            claimed_by: None,
            claim_expires_at: None,
            window: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Task store over the KV fabric.
pub struct TaskStore {
    kv: Arc<dyn KvStore>,
    window_limit: usize,
}

impl TaskStore {
    pub fn new(kv: Arc<dyn KvStore>, window_limit: usize) -> Self {
        Self {
            kv,
            window_limit: window_limit.max(1),
        }
    }

    /// Create a new record. Rejects id collision.
    pub async fn create(&self, task: &TaskRecord) -> Result<(), TaskError> {
        let raw = serde_json::to_string(task).map_err(crate::error::BusError::from)?;
        if !self.kv.set_nx(&task_key(&task.id), &raw).await? {
            return Err(TaskError::Collision {
                id: task.id.clone(),
            });
        }
        // Secondary index for the task-listing surface.
        self.kv.push(&user_index_key(&task.user_id), &task.id).await?;
        Ok(())
    }

    /// Read a record. A schema mismatch or unparsable record reads as
    /// absent.
    pub async fn get(&self, id: &str) -> Result<Option<TaskRecord>, TaskError> {
        let raw = match self.kv.get(&task_key(id)).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match serde_json::from_str::<TaskRecord>(&raw) {
            Ok(rec) if rec.schema == TASK_SCHEMA_VERSION => Ok(Some(rec)),
            Ok(rec) => {
                tracing::warn!(task_id = id, schema = rec.schema, "task schema mismatch");
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(task_id = id, error = %e, "unreadable task record");
                Ok(None)
            }
        }
    }

    /// Atomically claim ownership. Fails if another live claim exists.
    pub async fn claim(&self, id: &str, worker_id: &str, ttl: Duration) -> Result<bool, TaskError> {
        self.mutate_if(id, |rec| {
            let now = Utc::now();
            let held = rec
                .claim_expires_at
                .map(|t| t > now && rec.claimed_by.as_deref() != Some(worker_id))
                .unwrap_or(false);
            if held {
                return false;
            }
            rec.claimed_by = Some(worker_id.to_string());
            rec.claim_expires_at =
                Some(now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()));
            true
        })
        .await
    }

    /// Extend the claim of the current owner.
    pub async fn refresh_claim(
        &self,
        id: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool, TaskError> {
        self.mutate_if(id, |rec| {
            if rec.claimed_by.as_deref() != Some(worker_id) {
                return false;
            }
            rec.claim_expires_at = Some(
                Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
            );
            true
        })
        .await
    }

    /// Conditional status transition. Returns false when the current
    /// status differs from `from`.
    pub async fn transition(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        patch: impl Fn(&mut TaskRecord) + Send + Sync,
    ) -> Result<bool, TaskError> {
        let moved = self
            .mutate_if(id, |rec| {
                if rec.status != from {
                    return false;
                }
                rec.status = to;
                patch(rec);
                true
            })
            .await?;
        if moved && to.is_terminal() {
            self.apply_terminal_ttl(id).await?;
        }
        Ok(moved)
    }

    /// Append one window entry, truncating to the configured limit.
    pub async fn append_message(&self, id: &str, role: &str, text: &str) -> Result<(), TaskError> {
        let appended = self
            .mutate_if(id, |rec| {
                rec.window.push(WindowEntry {
                    role: role.to_string(),
                    text: text.to_string(),
                });
                let excess = rec.window.len().saturating_sub(self.window_limit);
                if excess > 0 {
                    rec.window.drain(0..excess);
                }
                true
            })
            .await?;
        if !appended {
            return Err(TaskError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<bool, TaskError> {
        if let Some(rec) = self.get(id).await? {
            let key = user_index_key(&rec.user_id);
            let ids = self.kv.drain(&key).await?;
            for other in ids.iter().filter(|x| x.as_str() != id) {
                self.kv.push(&key, other).await?;
            }
        }
        Ok(self.kv.del(&task_key(id)).await?)
    }

    /// Ids of tasks created by a user, oldest first.
    pub async fn by_user(&self, user_id: &str) -> Result<Vec<String>, TaskError> {
        let key = user_index_key(user_id);
        let ids = self.kv.drain(&key).await?;
        // Drain-and-restore keeps the read atomic without a separate op.
        for id in &ids {
            self.kv.push(&key, id).await?;
        }
        Ok(ids)
    }

    async fn apply_terminal_ttl(&self, id: &str) -> Result<(), TaskError> {
        let key = task_key(id);
        if let Some(raw) = self.kv.get(&key).await? {
            self.kv.set_with_ttl(&key, &raw, TERMINAL_TTL).await?;
        }
        Ok(())
    }

    /// CAS loop: read, let `f` decide and mutate, write back only if the
    /// record did not change underneath. `Ok(false)` means `f` declined.
    async fn mutate_if(
        &self,
        id: &str,
        f: impl Fn(&mut TaskRecord) -> bool + Send,
    ) -> Result<bool, TaskError> {
        let key = task_key(id);
        for _ in 0..16 {
            let raw = match self.kv.get(&key).await? {
                Some(raw) => raw,
                None => return Ok(false),
            };
            let mut rec: TaskRecord = match serde_json::from_str(&raw) {
                Ok(rec) => rec,
                Err(_) => return Ok(false),
            };
            if !f(&mut rec) {
                return Ok(false);
            }
            rec.updated_at = Utc::now();
            let next = serde_json::to_string(&rec).map_err(crate::error::BusError::from)?;
            if self
                .kv
                .compare_and_swap(&key, Some(raw.as_str()), &next)
                .await?
            {
                return Ok(true);
            }
            // Lost the race; retry against the fresh record.
        }
        Err(TaskError::Conflict {
            id: id.to_string(),
            expected: "stable record".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    fn store() -> TaskStore {
        TaskStore::new(Arc::new(MemoryBus::new()), 20)
    }

    fn record() -> TaskRecord {
        TaskRecord::new("u1", ChannelKind::Telegram, "c1", "m1")
    }

    #[tokio::test]
    async fn create_rejects_collision() {
        let store = store();
        let rec = record();
        store.create(&rec).await.unwrap();
        assert!(matches!(
            store.create(&rec).await,
            Err(TaskError::Collision { .. })
        ));
    }

    #[tokio::test]
    async fn only_one_worker_wins_the_claim() {
        let store = store();
        let rec = record();
        store.create(&rec).await.unwrap();
        let ttl = Duration::from_secs(60);
        assert!(store.claim(&rec.id, "w1", ttl).await.unwrap());
        assert!(!store.claim(&rec.id, "w2", ttl).await.unwrap());
        // The owner can re-claim (refresh path).
        assert!(store.claim(&rec.id, "w1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_claim_is_reclaimable() {
        let store = store();
        let rec = record();
        store.create(&rec).await.unwrap();
        assert!(store.claim(&rec.id, "w1", Duration::ZERO).await.unwrap());
        assert!(store.claim(&rec.id, "w2", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn transition_checks_current_status() {
        let store = store();
        let rec = record();
        store.create(&rec).await.unwrap();
        assert!(store
            .transition(&rec.id, TaskStatus::Pending, TaskStatus::Running, |_| {})
            .await
            .unwrap());
        // Already running; a second pending->running must fail.
        assert!(!store
            .transition(&rec.id, TaskStatus::Pending, TaskStatus::Running, |_| {})
            .await
            .unwrap());
        let loaded = store.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn window_is_truncated() {
        let kv = Arc::new(MemoryBus::new());
        let store = TaskStore::new(kv, 3);
        let rec = record();
        store.create(&rec).await.unwrap();
        for i in 0..5 {
            store
                .append_message(&rec.id, "user", &format!("m{i}"))
                .await
                .unwrap();
        }
        let loaded = store.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.window.len(), 3);
        assert_eq!(loaded.window[0].text, "m2");
    }

    #[tokio::test]
    async fn by_user_lists_created_tasks() {
        let store = store();
        let a = record();
        let b = record();
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();
        let ids = store.by_user("u1").await.unwrap();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);
        // Read twice; the index survives the drain-and-restore.
        assert_eq!(store.by_user("u1").await.unwrap().len(), 2);
    }
}
