// src/registry.rs

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};
use tokio::sync::{
    RwLock,
    mpsc::{self, error::TrySendError},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{ConversationId, ServerFrame, UserId};
use crate::presence::PresenceStore;

/// Work item for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(ServerFrame),
    /// Transport-level ping sent by the liveness monitor.
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The outbound queue is at capacity: the client is a slow consumer.
    Full,
    /// The writer task is gone.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Liveness {
    Alive = 0,
    AwaitingPong = 1,
}

impl Liveness {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Liveness::AwaitingPong,
            _ => Liveness::Alive,
        }
    }
}

/// Server-side handle of one live client socket.
///
/// The socket itself is owned by the reader/writer tasks; everyone else talks
/// to the client through the bounded `outbound` queue and closes it through
/// the close handle.
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub user_id: UserId,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::Sender<Outbound>,
    /// Rooms this connection is in; kept in step by `RoomTable`.
    pub(crate) joined_rooms: DashSet<ConversationId>,
    liveness: AtomicU8,
    close: CancellationToken,
}

impl Connection {
    /// Creates a connection and the receiving end its writer task drains.
    pub fn open(user_id: &str, outbound_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(outbound_capacity);
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            connected_at: Utc::now(),
            outbound,
            joined_rooms: DashSet::new(),
            liveness: AtomicU8::new(Liveness::Alive as u8),
            close: CancellationToken::new(),
        });
        (conn, rx)
    }

    /// Non-blocking enqueue. Never waits on a slow client.
    pub fn try_enqueue(&self, item: Outbound) -> Result<(), EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }
        self.outbound.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    pub fn send_frame(&self, frame: ServerFrame) -> Result<(), EnqueueError> {
        self.try_enqueue(Outbound::Frame(frame))
    }

    pub fn joined_rooms(&self) -> Vec<ConversationId> {
        self.joined_rooms.iter().map(|room| room.key().clone()).collect()
    }

    pub fn liveness(&self) -> Liveness {
        Liveness::from_u8(self.liveness.load(Ordering::Acquire))
    }

    /// Any inbound traffic (pong, frame) proves the client is alive.
    pub fn mark_alive(&self) {
        self.liveness
            .store(Liveness::Alive as u8, Ordering::Release);
    }

    /// Moves the connection to `AwaitingPong`, returning the previous state.
    pub fn begin_ping(&self) -> Liveness {
        Liveness::from_u8(
            self.liveness
                .swap(Liveness::AwaitingPong as u8, Ordering::AcqRel),
        )
    }

    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once the connection has been closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close.cancelled()
    }
}

/// Maps each user to their single live connection on this process.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<UserId, Arc<Connection>>>,
    presence: Arc<PresenceStore>,
}

impl ConnectionRegistry {
    pub fn new(presence: Arc<PresenceStore>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            presence,
        }
    }

    /// Registers `conn` as the user's connection and returns the one it
    /// replaced. The caller owns closing the superseded connection.
    pub async fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let superseded = {
            let mut connections = self.connections.write().await;
            connections.insert(conn.user_id.clone(), conn.clone())
        };

        if let Some(old) = &superseded {
            info!(user_id = %conn.user_id, old = %old.id, new = %conn.id, "connection superseded");
        } else {
            info!(user_id = %conn.user_id, connection_id = %conn.id, "connection registered");
        }

        // Presence is best effort; a flaky backbone must not refuse the socket.
        if let Err(e) = self.presence.mark_online(&conn.user_id).await {
            warn!(user_id = %conn.user_id, error = %e, "failed to mark user online");
        }
        superseded
    }

    pub async fn unregister(&self, user_id: &str) -> Option<Arc<Connection>> {
        let removed = self.connections.write().await.remove(user_id);
        if removed.is_some() {
            debug!(user_id, "connection unregistered");
        }
        removed
    }

    /// Removes `conn` only if it is still the registered connection of its
    /// user, so cleanup of a superseded socket never removes its successor.
    pub async fn remove_if_current(&self, conn: &Connection) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(&conn.user_id) {
            Some(current) if current.id == conn.id => {
                connections.remove(&conn.user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, user_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(user_id).cloned()
    }

    /// Copy of all connections, taken under the read lock and released
    /// before the caller touches any of them.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for conn in self.snapshot().await {
            f(&conn);
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
