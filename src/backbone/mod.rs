// src/backbone/mod.rs

// Shared key-value and publish/subscribe backbone.
//
// Presence, unread counters and the broadcast bus are written against these
// traits so that several server processes can share state. `RedisBackbone`
// is the production implementation; `MemoryBackbone` serves single-process
// deployments and tests.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;

use crate::error::ChatResult;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBackbone;
pub use self::redis::RedisBackbone;

/// TTL-capable key-value store with set membership. Every operation is atomic
/// on the server side, so concurrent callers across processes are safe.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> ChatResult<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ChatResult<()>;
    /// Atomically increments an integer key, creating it at 0 first.
    async fn incr(&self, key: &str) -> ChatResult<i64>;
    async fn expire(&self, key: &str, ttl: Duration) -> ChatResult<()>;
    /// Returns whether the key existed.
    async fn del(&self, key: &str) -> ChatResult<bool>;
    async fn exists(&self, key: &str) -> ChatResult<bool>;
    async fn sadd(&self, key: &str, member: &str) -> ChatResult<()>;
    async fn srem(&self, key: &str, member: &str) -> ChatResult<()>;
    async fn smembers(&self, key: &str) -> ChatResult<Vec<String>>;
    async fn ping(&self) -> ChatResult<()>;
}

/// Fire-and-forget channel messaging.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> ChatResult<()>;
    /// Stream of payloads published on `channel`. The stream ends when the
    /// underlying connection is lost; callers resubscribe.
    async fn subscribe(&self, channel: &str) -> ChatResult<BoxStream<'static, String>>;
}
