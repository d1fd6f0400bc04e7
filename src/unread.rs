// src/unread.rs

use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::debug;

use crate::backbone::KeyValueStore;
use crate::error::ChatResult;
use crate::models::UnreadSummary;

fn counter_key(user_id: &str, conversation_id: &str) -> String {
    format!("unread:{user_id}:{conversation_id}")
}

fn index_key(user_id: &str) -> String {
    format!("unread_index:{user_id}")
}

/// Per-user, per-conversation unread counts in the shared store.
pub struct UnreadCounter {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl UnreadCounter {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Atomically adds one unread message and refreshes the counter's TTL.
    pub async fn increment(&self, user_id: &str, conversation_id: &str) -> ChatResult<i64> {
        let key = counter_key(user_id, conversation_id);
        let count = self.kv.incr(&key).await?;
        self.kv.expire(&key, self.ttl).await?;
        self.kv.sadd(&index_key(user_id), conversation_id).await?;
        Ok(count)
    }

    /// Clears the counter. Resetting an absent counter is a no-op.
    pub async fn reset(&self, user_id: &str, conversation_id: &str) -> ChatResult<()> {
        self.kv.del(&counter_key(user_id, conversation_id)).await?;
        self.kv.srem(&index_key(user_id), conversation_id).await
    }

    pub async fn get(&self, user_id: &str, conversation_id: &str) -> ChatResult<i64> {
        let raw = self.kv.get(&counter_key(user_id, conversation_id)).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Every non-zero counter of the user. Index entries whose counter
    /// expired are dropped.
    pub async fn get_all(&self, user_id: &str) -> ChatResult<UnreadSummary> {
        let index = index_key(user_id);
        let mut counts = BTreeMap::new();
        for conversation_id in self.kv.smembers(&index).await? {
            let count = self.get(user_id, &conversation_id).await?;
            if count > 0 {
                counts.insert(conversation_id, count);
            } else {
                debug!(user_id, conversation_id, "pruning empty unread entry");
                self.kv.srem(&index, &conversation_id).await?;
            }
        }
        Ok(UnreadSummary::from_counts(counts))
    }
}
