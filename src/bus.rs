// src/bus.rs

// Cross-process broadcast bus.
//
// Every envelope delivered locally is also published so that other processes
// can deliver it to the recipients connected to them. The bus is
// at-least-once: consumers drop repeats by envelope id through
// `DedupCache`, which also swallows a process's own echoes.

use dashmap::{DashMap, mapref::entry::Entry};
use futures_util::StreamExt;
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backbone::PubSub;
use crate::error::{ChatError, ChatResult};
use crate::models::BroadcastEnvelope;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// Remembers recently seen envelope ids for a bounded time.
pub struct DedupCache {
    seen: DashMap<Uuid, Instant>,
    capacity: usize,
    ttl: Duration,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            capacity,
            ttl,
        }
    }

    /// Records `id` and returns true the first time it is seen within the TTL.
    pub fn first_sighting(&self, id: Uuid) -> bool {
        let now = Instant::now();
        let fresh = match self.seen.entry(id) {
            Entry::Occupied(mut seen) => {
                if now.duration_since(*seen.get()) < self.ttl {
                    false
                } else {
                    seen.insert(now);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        };
        if fresh && self.seen.len() > self.capacity {
            self.prune(now);
        }
        fresh
    }

    fn prune(&self, now: Instant) {
        self.seen
            .retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);
        // Still over capacity: drop the oldest half.
        if self.seen.len() > self.capacity {
            let mut by_age: Vec<(Uuid, Instant)> =
                self.seen.iter().map(|e| (*e.key(), *e.value())).collect();
            by_age.sort_by_key(|(_, at)| *at);
            for (id, _) in by_age.into_iter().take(self.capacity / 2 + 1) {
                self.seen.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Clone)]
pub struct BroadcastBus {
    pubsub: Arc<dyn PubSub>,
    channel: String,
    publish_timeout: Duration,
}

impl BroadcastBus {
    pub fn new(pubsub: Arc<dyn PubSub>, channel: &str, publish_timeout: Duration) -> Self {
        Self {
            pubsub,
            channel: channel.to_string(),
            publish_timeout,
        }
    }

    /// Publishes an envelope, giving up after the publish timeout.
    pub async fn publish(&self, envelope: &BroadcastEnvelope) -> ChatResult<()> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| ChatError::Validation(format!("unserializable envelope: {e}")))?;

        match tokio::time::timeout(
            self.publish_timeout,
            self.pubsub.publish(&self.channel, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ChatError::BackendUnavailable(format!(
                "publish timed out after {:?}",
                self.publish_timeout
            ))),
        }
    }

    /// Spawns the subscription loop. Each decoded envelope is passed to
    /// `handler`; when the stream ends or cannot be opened the loop waits and
    /// subscribes again.
    pub fn subscribe<H, Fut>(&self, handler: H) -> JoinHandle<()>
    where
        H: Fn(BroadcastEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let pubsub = self.pubsub.clone();
        let channel = self.channel.clone();

        tokio::spawn(async move {
            loop {
                let mut stream = match pubsub.subscribe(&channel).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!(channel, error = %e, "bus subscription failed");
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                };
                info!(channel, "bus subscriber started");

                while let Some(payload) = stream.next().await {
                    match serde_json::from_str::<BroadcastEnvelope>(&payload) {
                        Ok(envelope) => {
                            debug!(envelope_id = %envelope.id, origin = %envelope.origin, "bus envelope received");
                            handler(envelope).await;
                        }
                        Err(e) => warn!(error = %e, "dropping malformed bus envelope"),
                    }
                }

                warn!(channel, "bus stream ended, resubscribing");
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        })
    }
}
