// src/backbone/redis.rs

// Redis implementation of the backbone with automatic reconnection.

use async_trait::async_trait;
use futures_util::{StreamExt, stream::BoxStream};
use redis::{AsyncCommands, aio::ConnectionManager};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{KeyValueStore, PubSub};
use crate::error::ChatResult;

#[derive(Clone)]
pub struct RedisBackbone {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisBackbone {
    /// Connect to Redis. Supports both redis:// and rediss:// (TLS) URLs.
    pub async fn connect(url: &str) -> ChatResult<Self> {
        if url.starts_with("rediss://") {
            info!("Redis TLS enabled (rediss://)");
        }
        let client = redis::Client::open(url)?;
        debug!("Getting Redis connection manager...");
        let conn = client.get_connection_manager().await?;
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KeyValueStore for RedisBackbone {
    async fn get(&self, key: &str) -> ChatResult<Option<String>> {
        let value: Option<String> = self.conn().get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ChatResult<()> {
        let _: () = self.conn().set_ex(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> ChatResult<i64> {
        let value: i64 = self.conn().incr(key, 1).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> ChatResult<()> {
        let _: bool = self.conn().expire(key, ttl_secs(ttl) as i64).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> ChatResult<bool> {
        let removed: i64 = self.conn().del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> ChatResult<bool> {
        let exists: bool = self.conn().exists(key).await?;
        Ok(exists)
    }

    async fn sadd(&self, key: &str, member: &str) -> ChatResult<()> {
        let _: i64 = self.conn().sadd(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> ChatResult<()> {
        let _: i64 = self.conn().srem(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> ChatResult<Vec<String>> {
        let members: Vec<String> = self.conn().smembers(key).await?;
        Ok(members)
    }

    async fn ping(&self) -> ChatResult<()> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn()).await?;
        Ok(())
    }
}

#[async_trait]
impl PubSub for RedisBackbone {
    async fn publish(&self, channel: &str, payload: String) -> ChatResult<()> {
        let receivers: i64 = self.conn().publish(channel, payload).await?;
        debug!(channel, receivers, "published to bus");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> ChatResult<BoxStream<'static, String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        info!(channel, "subscribed to Redis channel");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(error = %e, "failed to read pub/sub payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}
