// src/delivery.rs

use metrics::counter;
use std::{
    collections::HashSet,
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::bus::{BroadcastBus, DedupCache};
use crate::models::{BroadcastEnvelope, EnvelopeKind};
use crate::queue::{OverflowPolicy, Submitted, WorkQueue};
use crate::registry::{Connection, EnqueueError};
use crate::session::{EvictReason, SessionManager};
use crate::unread::UnreadCounter;

/// Where a delivery task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Ingested on this process; also published to the bus.
    Local,
    /// Received from the bus.
    Bus,
}

#[derive(Debug, Clone)]
pub struct DeliveryTask {
    pub envelope: BroadcastEnvelope,
    pub origin: Origin,
}

impl DeliveryTask {
    pub fn local(envelope: BroadcastEnvelope) -> Self {
        Self {
            envelope,
            origin: Origin::Local,
        }
    }

    pub fn from_bus(envelope: BroadcastEnvelope) -> Self {
        Self {
            envelope,
            origin: Origin::Bus,
        }
    }
}

/// Counts from one processed task.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub evicted: usize,
    pub duplicate: bool,
}

/// Fans one envelope out to the local connections that should see it.
pub struct Dispatcher {
    sessions: Arc<SessionManager>,
    unread: Arc<UnreadCounter>,
    bus: BroadcastBus,
    dedup: DedupCache,
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionManager>,
        unread: Arc<UnreadCounter>,
        bus: BroadcastBus,
        dedup: DedupCache,
    ) -> Self {
        Self {
            sessions,
            unread,
            bus,
            dedup,
        }
    }

    pub async fn process(&self, task: DeliveryTask) -> DeliveryReport {
        let DeliveryTask { envelope, origin } = task;
        let mut report = DeliveryReport::default();

        if !self.dedup.first_sighting(envelope.id) {
            counter!("chat_duplicates_skipped_total").increment(1);
            debug!(envelope_id = %envelope.id, "skipping duplicate envelope");
            report.duplicate = true;
            return report;
        }

        let Some(frame) = envelope.to_frame() else {
            warn!(envelope_id = %envelope.id, "message envelope without message, skipping");
            return report;
        };

        // Enqueue is non-blocking; unhealthy recipients are evicted only after
        // every other recipient got the frame.
        let mut unhealthy = Vec::new();
        for conn in self.recipients(&envelope).await {
            match conn.send_frame(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => unhealthy.push((conn, e)),
            }
        }

        if origin == Origin::Local && envelope.kind == EnvelopeKind::Message {
            self.count_unread(&envelope).await;
        }

        for (conn, err) in unhealthy {
            let reason = match err {
                EnqueueError::Full => {
                    warn!(user_id = %conn.user_id, "outbound queue full, evicting slow consumer");
                    EvictReason::SlowConsumer
                }
                EnqueueError::Closed => EvictReason::Closed,
            };
            self.sessions.evict(&conn, reason).await;
            report.evicted += 1;
        }

        if origin == Origin::Local {
            if let Err(e) = self.bus.publish(&envelope).await {
                counter!("chat_bus_publish_failures_total").increment(1);
                warn!(envelope_id = %envelope.id, error = %e, "bus publish failed, delivered locally only");
            }
        }

        report
    }

    /// Room members, plus connected participants for chat messages, minus the
    /// sender. Each connection appears once. A broadcast goes to every local
    /// connection.
    async fn recipients(&self, envelope: &BroadcastEnvelope) -> Vec<Arc<Connection>> {
        if envelope.kind == EnvelopeKind::Broadcast {
            let mut all = self.sessions.registry().snapshot().await;
            all.retain(|conn| !conn.is_closed());
            return all;
        }

        let sender = envelope.sender();
        let mut seen = HashSet::new();
        let mut recipients = Vec::new();

        let mut consider = |conn: Arc<Connection>| {
            if conn.user_id != sender && !conn.is_closed() && seen.insert(conn.id) {
                recipients.push(conn);
            }
        };

        for conn in self.sessions.rooms().members_of(&envelope.conversation_id) {
            consider(conn);
        }
        if envelope.kind == EnvelopeKind::Message {
            for user_id in &envelope.payload.recipients {
                if let Some(conn) = self.sessions.registry().lookup(user_id).await {
                    consider(conn);
                }
            }
        }
        recipients
    }

    async fn count_unread(&self, envelope: &BroadcastEnvelope) {
        let sender = envelope.sender();
        for user_id in envelope.payload.recipients.iter().filter(|u| *u != sender) {
            if let Err(e) = self
                .unread
                .increment(user_id, &envelope.conversation_id)
                .await
            {
                warn!(
                    user_id = %user_id,
                    conversation_id = %envelope.conversation_id,
                    error = %e,
                    "failed to increment unread counter"
                );
            }
        }
    }
}

/// Fixed pool of delivery workers.
///
/// Each worker owns one shard of the ingestion queue and one shard of the bus
/// queue. Tasks are routed by conversation id, so messages of one
/// conversation are processed in order.
pub struct DeliveryPool {
    dispatcher: Arc<Dispatcher>,
    local: Vec<WorkQueue<DeliveryTask>>,
    remote: Vec<WorkQueue<DeliveryTask>>,
    workers: Vec<JoinHandle<()>>,
}

pub struct PoolOptions {
    pub workers: usize,
    pub ingest_capacity: usize,
    pub ingest_overflow: OverflowPolicy,
    pub bus_capacity: usize,
    pub bus_overflow: OverflowPolicy,
}

impl DeliveryPool {
    pub fn start(dispatcher: Arc<Dispatcher>, options: PoolOptions) -> Self {
        let workers = options.workers.max(1);
        let ingest_shard = (options.ingest_capacity / workers).max(1);
        let bus_shard = (options.bus_capacity / workers).max(1);

        let mut local = Vec::with_capacity(workers);
        let mut remote = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let (local_queue, local_rx) =
                WorkQueue::bounded("ingest", ingest_shard, options.ingest_overflow);
            let (remote_queue, remote_rx) =
                WorkQueue::bounded("bus", bus_shard, options.bus_overflow);
            local.push(local_queue);
            remote.push(remote_queue);
            handles.push(tokio::spawn(run_worker(
                worker_id,
                dispatcher.clone(),
                local_rx,
                remote_rx,
            )));
        }

        Self {
            dispatcher,
            local,
            remote,
            workers: handles,
        }
    }

    fn shard(&self, conversation_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        conversation_id.hash(&mut hasher);
        (hasher.finish() % self.local.len() as u64) as usize
    }

    /// Queues a task on its conversation's worker. If the queue's overflow
    /// policy hands the task back, it is processed on the caller's task.
    pub async fn dispatch(&self, task: DeliveryTask) {
        let shard = self.shard(&task.envelope.conversation_id);
        let queue = match task.origin {
            Origin::Local => &self.local[shard],
            Origin::Bus => &self.remote[shard],
        };
        match queue.submit(task).await {
            Submitted::Queued => {}
            Submitted::Inline(task) => {
                self.dispatcher.process(task).await;
            }
            Submitted::Dropped => {
                warn!(queue = queue.name(), "delivery task dropped");
            }
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn shutdown(&self) {
        for handle in &self.workers {
            handle.abort();
        }
    }
}

async fn run_worker(
    worker_id: usize,
    dispatcher: Arc<Dispatcher>,
    mut local_rx: mpsc::Receiver<DeliveryTask>,
    mut remote_rx: mpsc::Receiver<DeliveryTask>,
) {
    debug!(worker_id, "delivery worker started");
    loop {
        let task = tokio::select! {
            Some(task) = local_rx.recv() => task,
            Some(task) = remote_rx.recv() => task,
            else => break,
        };
        dispatcher.process(task).await;
    }
    debug!(worker_id, "delivery worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::MemoryBackbone;
    use crate::models::{Message, ServerFrame};
    use crate::presence::PresenceStore;
    use crate::registry::{ConnectionRegistry, Outbound};
    use crate::rooms::RoomTable;
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    struct Fixture {
        sessions: Arc<SessionManager>,
        unread: Arc<UnreadCounter>,
        dispatcher: Dispatcher,
    }

    fn fixture(backbone: &MemoryBackbone, outbound_capacity: usize) -> Fixture {
        let kv = Arc::new(backbone.clone());
        let presence = Arc::new(PresenceStore::new(kv.clone(), Duration::from_secs(60), "node-a"));
        let sessions = Arc::new(SessionManager::new(
            Arc::new(ConnectionRegistry::new(presence.clone())),
            Arc::new(RoomTable::new()),
            presence,
            outbound_capacity,
        ));
        let unread = Arc::new(UnreadCounter::new(kv.clone(), Duration::from_secs(60)));
        let bus = BroadcastBus::new(kv, "chat:test", Duration::from_secs(1));
        let dispatcher = Dispatcher::new(
            sessions.clone(),
            unread.clone(),
            bus,
            DedupCache::new(1000, Duration::from_secs(60)),
        );
        Fixture {
            sessions,
            unread,
            dispatcher,
        }
    }

    fn message(conversation_id: &str, sender: &str, content: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            sender_id: sender.into(),
            content: content.into(),
            created_at: Utc::now(),
            is_read: false,
        }
    }

    #[tokio::test]
    async fn message_reaches_room_and_connected_participants_but_not_sender() {
        let backbone = MemoryBackbone::new();
        let f = fixture(&backbone, 8);
        let (alice, mut alice_rx) = f.sessions.connect("alice").await;
        let (_bob, mut bob_rx) = f.sessions.connect("bob").await;
        f.sessions.rooms().join("c1", &alice);

        let envelope = BroadcastEnvelope::message(message("c1", "alice", "hi"), vec!["bob".into()], "node-a");
        let report = f.dispatcher.process(DeliveryTask::local(envelope)).await;

        assert_eq!(report.delivered, 1);
        assert!(matches!(
            bob_rx.try_recv(),
            Ok(Outbound::Frame(ServerFrame::Message { .. }))
        ));
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(f.unread.get("bob", "c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bus_echo_is_not_delivered_or_counted_twice() {
        let backbone = MemoryBackbone::new();
        let f = fixture(&backbone, 8);
        let (_bob, mut bob_rx) = f.sessions.connect("bob").await;

        let envelope = BroadcastEnvelope::message(message("c1", "alice", "hi"), vec!["bob".into()], "node-a");
        f.dispatcher.process(DeliveryTask::local(envelope.clone())).await;
        let echo = f.dispatcher.process(DeliveryTask::from_bus(envelope)).await;

        assert!(echo.duplicate);
        assert!(bob_rx.try_recv().is_ok());
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(f.unread.get("bob", "c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bus_deliveries_do_not_touch_unread_counters() {
        let backbone = MemoryBackbone::new();
        let f = fixture(&backbone, 8);
        let (_bob, mut bob_rx) = f.sessions.connect("bob").await;

        let envelope = BroadcastEnvelope::message(message("c1", "alice", "hi"), vec!["bob".into()], "node-b");
        f.dispatcher.process(DeliveryTask::from_bus(envelope)).await;

        assert!(bob_rx.try_recv().is_ok());
        assert_eq!(f.unread.get("bob", "c1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_without_blocking_others() {
        let backbone = MemoryBackbone::new();
        let f = fixture(&backbone, 1);
        let (slow, _slow_rx) = f.sessions.connect("slow").await;
        let (_fast, mut fast_rx) = f.sessions.connect("fast").await;
        f.sessions.rooms().join("c1", &slow);

        for i in 0..2 {
            let envelope = BroadcastEnvelope::message(
                message("c1", "alice", &format!("m{i}")),
                vec!["slow".into(), "fast".into()],
                "node-a",
            );
            f.dispatcher.process(DeliveryTask::local(envelope)).await;
            // Keep the fast consumer drained.
            assert!(fast_rx.try_recv().is_ok());
        }

        assert!(slow.is_closed());
        assert!(f.sessions.registry().lookup("slow").await.is_none());
        assert!(f.sessions.registry().lookup("fast").await.is_some());
    }

    #[tokio::test]
    async fn unavailable_bus_degrades_to_local_delivery() {
        let backbone = MemoryBackbone::new();
        let f = fixture(&backbone, 8);
        let (_bob, mut bob_rx) = f.sessions.connect("bob").await;
        backbone.set_available(false);

        let envelope = BroadcastEnvelope::typing("c1", "alice", "node-a");
        f.sessions
            .rooms()
            .join("c1", &f.sessions.registry().lookup("bob").await.unwrap());
        let report = f.dispatcher.process(DeliveryTask::local(envelope)).await;

        assert_eq!(report.delivered, 1);
        assert!(matches!(
            bob_rx.try_recv(),
            Ok(Outbound::Frame(ServerFrame::Typing { .. }))
        ));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection_outside_any_room() {
        let backbone = MemoryBackbone::new();
        let f = fixture(&backbone, 8);
        let (_alice, mut alice_rx) = f.sessions.connect("alice").await;
        let (_bob, mut bob_rx) = f.sessions.connect("bob").await;

        let envelope = BroadcastEnvelope::broadcast("maintenance", serde_json::json!("soon"), "node-a");
        let report = f.dispatcher.process(DeliveryTask::local(envelope)).await;

        assert_eq!(report.delivered, 2);
        for rx in [&mut alice_rx, &mut bob_rx] {
            match rx.try_recv() {
                Ok(Outbound::Frame(ServerFrame::Broadcast { event, .. })) => {
                    assert_eq!(event, "maintenance")
                }
                other => panic!("unexpected outbound item {other:?}"),
            }
        }
        assert_eq!(f.unread.get_all("alice").await.unwrap().total_unread, 0);
    }

    #[tokio::test]
    async fn pool_preserves_per_conversation_order() {
        let backbone = MemoryBackbone::new();
        let f = fixture(&backbone, 256);
        let (_bob, mut bob_rx) = f.sessions.connect("bob").await;
        let pool = DeliveryPool::start(
            Arc::new(f.dispatcher),
            PoolOptions {
                workers: 4,
                ingest_capacity: 64,
                ingest_overflow: OverflowPolicy::Block,
                bus_capacity: 64,
                bus_overflow: OverflowPolicy::Block,
            },
        );

        for i in 0..100 {
            let envelope = BroadcastEnvelope::message(
                message("c1", "alice", &i.to_string()),
                vec!["bob".into()],
                "node-a",
            );
            pool.dispatch(DeliveryTask::local(envelope)).await;
        }

        for expected in 0..100 {
            let item = tokio::time::timeout(Duration::from_secs(2), bob_rx.recv())
                .await
                .unwrap()
                .unwrap();
            match item {
                Outbound::Frame(ServerFrame::Message { content, .. }) => {
                    assert_eq!(content, expected.to_string())
                }
                other => panic!("unexpected outbound item {other:?}"),
            }
        }
        pool.shutdown();
    }
}
