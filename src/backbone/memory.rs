// src/backbone/memory.rs

// In-process backbone for single-node deployments and tests.

use async_trait::async_trait;
use futures_util::{StreamExt, stream::BoxStream};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{KeyValueStore, PubSub};
use crate::error::{ChatError, ChatResult};

const CHANNEL_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(HashSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Key-value store and pub/sub held in process memory.
///
/// Cloning shares the underlying state, so two handles behave like two
/// processes connected to the same Redis.
#[derive(Debug, Clone)]
pub struct MemoryBackbone {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryBackbone {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackbone {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            channels: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulates the shared backend going down (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> ChatResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChatError::BackendUnavailable(
                "in-memory backbone marked unavailable".into(),
            ))
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_BUFFER).0)
            .clone()
    }

    /// Returns the live entry for `key`, purging it first if it expired.
    fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

fn wrong_type(key: &str) -> ChatError {
    ChatError::BackendUnavailable(format!("wrong value type stored at {key}"))
}

#[async_trait]
impl KeyValueStore for MemoryBackbone {
    async fn get(&self, key: &str) -> ChatResult<Option<String>> {
        self.check()?;
        let mut entries = self.entries();
        match Self::live(&mut entries, key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> ChatResult<()> {
        self.check()?;
        self.entries().insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> ChatResult<i64> {
        self.check()?;
        let mut entries = self.entries();
        let next = match Self::live(&mut entries, key) {
            None => 1,
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => text.parse::<i64>().map_err(|_| wrong_type(key))? + 1,
            Some(_) => return Err(wrong_type(key)),
        };
        let expires_at = entries.get(key).and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> ChatResult<()> {
        self.check()?;
        let mut entries = self.entries();
        if let Some(entry) = Self::live(&mut entries, key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> ChatResult<bool> {
        self.check()?;
        let mut entries = self.entries();
        let existed = Self::live(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> ChatResult<bool> {
        self.check()?;
        Ok(Self::live(&mut self.entries(), key).is_some())
    }

    async fn sadd(&self, key: &str, member: &str) -> ChatResult<()> {
        self.check()?;
        let mut entries = self.entries();
        if Self::live(&mut entries, key).is_none() {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Set(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        match entries.get_mut(key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                set.insert(member.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> ChatResult<()> {
        self.check()?;
        let mut entries = self.entries();
        let now_empty = match Self::live(&mut entries, key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                set.remove(member);
                set.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
            None => false,
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> ChatResult<Vec<String>> {
        self.check()?;
        let mut entries = self.entries();
        match Self::live(&mut entries, key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn ping(&self) -> ChatResult<()> {
        self.check()
    }
}

#[async_trait]
impl PubSub for MemoryBackbone {
    async fn publish(&self, channel: &str, payload: String) -> ChatResult<()> {
        self.check()?;
        // No subscribers is not an error.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> ChatResult<BoxStream<'static, String>> {
        self.check()?;
        let rx = self.sender(channel).subscribe();
        let stream = BroadcastStream::new(rx).filter_map(|item| async move { item.ok() });
        Ok(stream.boxed())
    }
}
