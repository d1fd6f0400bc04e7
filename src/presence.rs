// src/presence.rs

use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tracing::debug;

use crate::backbone::KeyValueStore;
use crate::error::ChatResult;
use crate::models::UserId;

const ONLINE_USERS_KEY: &str = "online:users";

fn online_key(user_id: &str) -> String {
    format!("online:{user_id}")
}

/// Which users are online, across all processes sharing the backbone.
///
/// Each online user has a TTL key `online:{user}` whose value is the id of the
/// process holding the connection, plus membership in the `online:users` set.
/// The TTL key is the source of truth; the set is only an index and is pruned
/// lazily by [`PresenceStore::list_online`].
pub struct PresenceStore {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
    instance_id: String,
}

impl PresenceStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration, instance_id: &str) -> Self {
        Self {
            kv,
            ttl,
            instance_id: instance_id.to_string(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Marks the user online for the configured TTL.
    pub async fn mark_online(&self, user_id: &str) -> ChatResult<()> {
        self.mark_online_for(user_id, self.ttl).await
    }

    /// Marks the user online, or refreshes the TTL if they already are.
    pub async fn mark_online_for(&self, user_id: &str, ttl: Duration) -> ChatResult<()> {
        self.kv
            .set_ex(&online_key(user_id), &self.instance_id, ttl)
            .await?;
        self.kv.sadd(ONLINE_USERS_KEY, user_id).await
    }

    /// Marks the user offline unless another process has since taken over
    /// their presence key.
    pub async fn mark_offline(&self, user_id: &str) -> ChatResult<()> {
        let key = online_key(user_id);
        match self.kv.get(&key).await? {
            Some(owner) if owner != self.instance_id => {
                debug!(user_id, owner, "presence owned by another instance, keeping it");
                return Ok(());
            }
            Some(_) => {
                self.kv.del(&key).await?;
            }
            None => {}
        }
        self.kv.srem(ONLINE_USERS_KEY, user_id).await
    }

    pub async fn is_online(&self, user_id: &str) -> ChatResult<bool> {
        self.kv.exists(&online_key(user_id)).await
    }

    /// Users whose presence key is still live. Index entries whose key has
    /// lapsed are removed as they are found.
    pub async fn list_online(&self) -> ChatResult<BTreeSet<UserId>> {
        let mut online = BTreeSet::new();
        for user_id in self.kv.smembers(ONLINE_USERS_KEY).await? {
            if self.kv.exists(&online_key(&user_id)).await? {
                online.insert(user_id);
            } else {
                debug!(user_id, "pruning stale presence entry");
                self.kv.srem(ONLINE_USERS_KEY, &user_id).await?;
            }
        }
        Ok(online)
    }

    pub async fn count_online(&self) -> ChatResult<usize> {
        Ok(self.list_online().await?.len())
    }
}
