//! Per-user token bucket over the KV fabric.
//!
//! The bucket state is a small JSON record under `rl:<user_id>`; refill and
//! spend happen in one compare-and-swap so concurrent gates agree.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::bus::KvStore;
use crate::error::BusError;

fn bucket_key(user_id: &str) -> String {
    format!("rl:{user_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct BucketState {
    tokens: f64,
    last_refill_ms: i64,
}

/// Refill a bucket up to `capacity` at `refill_per_sec`, then try to spend
/// one token. Returns the new state and whether the spend was admitted.
fn refill_and_spend(
    state: BucketState,
    capacity: f64,
    refill_per_sec: f64,
    now_ms: i64,
) -> (BucketState, bool) {
    let elapsed = (now_ms - state.last_refill_ms).max(0) as f64 / 1000.0;
    let tokens = (state.tokens + elapsed * refill_per_sec).min(capacity);
    if tokens >= 1.0 {
        (
            BucketState {
                tokens: tokens - 1.0,
                last_refill_ms: now_ms,
            },
            true,
        )
    } else {
        (
            BucketState {
                tokens,
                last_refill_ms: now_ms,
            },
            false,
        )
    }
}

/// Token-bucket rate limiter shared by channel adapters and the MCP
/// gateway.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            kv,
            capacity: capacity.max(1.0),
            refill_per_sec: refill_per_sec.max(0.0),
        }
    }

    /// Try to admit one event for `user_id`.
    pub async fn acquire(&self, user_id: &str) -> Result<bool, BusError> {
        let key = bucket_key(user_id);
        let now_ms = Utc::now().timestamp_millis();
        for _ in 0..8 {
            let raw = self.kv.get(&key).await?;
            let state = raw
                .as_deref()
                .and_then(|r| serde_json::from_str::<BucketState>(r).ok())
                .unwrap_or(BucketState {
                    tokens: self.capacity,
                    last_refill_ms: now_ms,
                });
            let (next, admitted) =
                refill_and_spend(state, self.capacity, self.refill_per_sec, now_ms);
            let next_raw = serde_json::to_string(&next)?;
            if self
                .kv
                .compare_and_swap(&key, raw.as_deref(), &next_raw)
                .await?
            {
                return Ok(admitted);
            }
        }
        // Contention beyond the retry limit; fail closed.
        Ok(false)
    }
}
