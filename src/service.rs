// src/service.rs

// Public face of the chat subsystem.
//
// `ChatService` owns every component and the background tasks that drive
// them. HTTP and WebSocket handlers talk only to this type.

use serde::Serialize;
use std::{collections::BTreeSet, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::backbone::{KeyValueStore, PubSub};
use crate::bus::{BroadcastBus, DedupCache};
use crate::config::ChatConfig;
use crate::delivery::{DeliveryPool, DeliveryTask, Dispatcher, PoolOptions};
use crate::error::{ChatError, ChatResult};
use crate::ingest::{IngestPipeline, spawn_summary_writer};
use crate::liveness::LivenessMonitor;
use crate::models::{BroadcastEnvelope, Message, ServerFrame, UnreadSummary, UserId};
use crate::presence::PresenceStore;
use crate::queue::{OverflowPolicy, WorkQueue};
use crate::registry::{Connection, ConnectionRegistry, EnqueueError, Outbound};
use crate::rooms::RoomTable;
use crate::session::{EvictReason, SessionManager};
use crate::store::ChatStore;
use crate::unread::UnreadCounter;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    pub store: bool,
    pub backbone: bool,
    pub connections: usize,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.store && self.backbone
    }
}

pub struct ChatService {
    config: ChatConfig,
    store: Arc<dyn ChatStore>,
    kv: Arc<dyn KeyValueStore>,
    sessions: Arc<SessionManager>,
    presence: Arc<PresenceStore>,
    unread: Arc<UnreadCounter>,
    pool: Arc<DeliveryPool>,
    ingest: IngestPipeline,
    tasks: Vec<JoinHandle<()>>,
}

impl ChatService {
    /// Wires all components together and spawns the delivery workers, the
    /// summary writer, the bus subscriber and the liveness monitor.
    pub fn start(
        config: ChatConfig,
        store: Arc<dyn ChatStore>,
        kv: Arc<dyn KeyValueStore>,
        pubsub: Arc<dyn PubSub>,
    ) -> Self {
        let presence = Arc::new(PresenceStore::new(
            kv.clone(),
            config.presence_ttl,
            &config.instance_id,
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::new(ConnectionRegistry::new(presence.clone())),
            Arc::new(RoomTable::new()),
            presence.clone(),
            config.outbound_capacity,
        ));
        let unread = Arc::new(UnreadCounter::new(kv.clone(), config.unread_ttl));

        let bus = BroadcastBus::new(pubsub, &config.bus_channel, config.publish_timeout);
        let dispatcher = Arc::new(Dispatcher::new(
            sessions.clone(),
            unread.clone(),
            bus.clone(),
            DedupCache::new(config.dedup_capacity, config.dedup_ttl),
        ));
        let pool = Arc::new(DeliveryPool::start(
            dispatcher,
            PoolOptions {
                workers: config.workers,
                ingest_capacity: config.ingest_queue_capacity,
                ingest_overflow: config.ingest_overflow,
                bus_capacity: config.bus_queue_capacity,
                bus_overflow: config.bus_overflow,
            },
        ));

        let (summaries, summary_rx) = WorkQueue::bounded(
            "summary",
            config.summary_queue_capacity,
            OverflowPolicy::Inline,
        );
        let ingest = IngestPipeline::new(
            store.clone(),
            pool.clone(),
            summaries,
            config.max_content_chars,
            &config.instance_id,
        );

        let mut tasks = vec![spawn_summary_writer(store.clone(), summary_rx)];
        tasks.push({
            let pool = pool.clone();
            bus.subscribe(move |envelope| {
                let pool = pool.clone();
                async move { pool.dispatch(DeliveryTask::from_bus(envelope)).await }
            })
        });
        tasks.push(
            LivenessMonitor::new(sessions.clone(), presence.clone(), config.heartbeat_interval)
                .spawn(),
        );

        info!(
            instance_id = %config.instance_id,
            workers = config.workers,
            "chat service started"
        );

        Self {
            config,
            store,
            kv,
            sessions,
            presence,
            unread,
            pool,
            ingest,
            tasks,
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Opens a connection for an authenticated user, superseding any earlier
    /// one, and queues their unread summary as the first frame.
    pub async fn connect(&self, user_id: &str) -> ChatResult<(Arc<Connection>, mpsc::Receiver<Outbound>)> {
        if user_id.trim().is_empty() {
            return Err(ChatError::Validation("user_id is required".into()));
        }
        let (conn, rx) = self.sessions.connect(user_id).await;

        match self.unread.get_all(user_id).await {
            Ok(summary) => {
                self.reply(&conn, summary.into()).await;
            }
            Err(e) => warn!(user_id, error = %e, "failed to load unread summary on connect"),
        }
        Ok((conn, rx))
    }

    pub async fn disconnect(&self, conn: &Connection, reason: EvictReason) {
        self.sessions.evict(conn, reason).await;
    }

    /// Queues a direct answer (ack, pong, error) to one connection. A client
    /// whose queue is full is evicted as a slow consumer. Returns whether the
    /// frame was queued.
    pub async fn reply(&self, conn: &Connection, frame: ServerFrame) -> bool {
        match conn.send_frame(frame) {
            Ok(()) => true,
            Err(EnqueueError::Full) => {
                warn!(user_id = %conn.user_id, "outbound queue full on reply, evicting slow consumer");
                self.sessions.evict(conn, EvictReason::SlowConsumer).await;
                false
            }
            Err(EnqueueError::Closed) => false,
        }
    }

    pub async fn send_chat_frame(
        &self,
        user_id: &str,
        conversation_id: &str,
        content: &str,
    ) -> ChatResult<Message> {
        self.ingest.ingest(conversation_id, user_id, content).await
    }

    /// Relays a typing indicator to the conversation's room.
    pub async fn typing(&self, user_id: &str, conversation_id: &str) -> ChatResult<()> {
        self.ensure_participant(user_id, conversation_id).await?;
        let envelope = BroadcastEnvelope::typing(conversation_id, user_id, &self.config.instance_id);
        self.pool.dispatch(DeliveryTask::local(envelope)).await;
        Ok(())
    }

    /// Clears the user's unread count, marks stored messages read and sends a
    /// read receipt to the room.
    pub async fn mark_read(&self, user_id: &str, conversation_id: &str) -> ChatResult<()> {
        self.ensure_participant(user_id, conversation_id).await?;
        self.unread.reset(user_id, conversation_id).await?;
        let updated = self.store.mark_read(conversation_id, user_id).await?;
        debug!(user_id, conversation_id, updated, "messages marked read");

        let envelope = BroadcastEnvelope::read(conversation_id, user_id, &self.config.instance_id);
        self.pool.dispatch(DeliveryTask::local(envelope)).await;
        Ok(())
    }

    pub async fn join(&self, conn: &Arc<Connection>, conversation_id: &str) -> ChatResult<()> {
        self.ensure_participant(&conn.user_id, conversation_id).await?;
        if self.sessions.rooms().join(conversation_id, conn) {
            Ok(())
        } else {
            Err(ChatError::Transport("connection closed".into()))
        }
    }

    pub fn leave(&self, conn: &Connection, conversation_id: &str) {
        self.sessions.rooms().leave(conversation_id, conn);
    }

    /// Sends a server-wide notice to every connected user, here and on every
    /// other process. Returns how many local connections it was queued for.
    pub async fn broadcast_to_all(&self, event: &str, data: serde_json::Value) -> ChatResult<usize> {
        if event.trim().is_empty() {
            return Err(ChatError::Validation("broadcast event is required".into()));
        }
        let envelope = BroadcastEnvelope::broadcast(event, data, &self.config.instance_id);
        let report = self
            .pool
            .dispatcher()
            .process(DeliveryTask::local(envelope))
            .await;
        info!(event, delivered = report.delivered, "broadcast to all users");
        Ok(report.delivered)
    }

    pub async fn get_unread_summary(&self, user_id: &str) -> ChatResult<UnreadSummary> {
        self.unread.get_all(user_id).await
    }

    pub async fn get_online_users(&self) -> ChatResult<BTreeSet<UserId>> {
        self.presence.list_online().await
    }

    pub async fn get_online_count(&self) -> ChatResult<usize> {
        self.presence.count_online().await
    }

    pub async fn is_online(&self, user_id: &str) -> ChatResult<bool> {
        self.presence.is_online(user_id).await
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            store: self.store.ping().await.is_ok(),
            backbone: self.kv.ping().await.is_ok(),
            connections: self.sessions.registry().len().await,
        }
    }

    /// Closes every local connection, marks their users offline and stops
    /// the background tasks.
    pub async fn shutdown(&self) {
        let connections = self.sessions.registry().snapshot().await;
        info!(connections = connections.len(), "shutting down chat service");
        for conn in connections {
            self.sessions.evict(&conn, EvictReason::Shutdown).await;
        }
        self.pool.shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }

    async fn ensure_participant(&self, user_id: &str, conversation_id: &str) -> ChatResult<()> {
        if self.store.is_participant(conversation_id, user_id).await? {
            Ok(())
        } else {
            Err(ChatError::permission(user_id, conversation_id))
        }
    }
}
