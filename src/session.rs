// src/session.rs

use metrics::counter;
use std::{fmt, sync::Arc};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::presence::PresenceStore;
use crate::registry::{Connection, ConnectionRegistry, Outbound};
use crate::rooms::RoomTable;

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// The client went away or the socket failed.
    Closed,
    /// The same user connected again.
    Superseded,
    /// The outbound queue overflowed.
    SlowConsumer,
    /// No pong within one heartbeat interval.
    Dead,
    Shutdown,
}

impl EvictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictReason::Closed => "closed",
            EvictReason::Superseded => "superseded",
            EvictReason::SlowConsumer => "slow_consumer",
            EvictReason::Dead => "dead",
            EvictReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens and tears down connections, keeping the registry, the room table
/// and presence consistent with each other.
pub struct SessionManager {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomTable>,
    presence: Arc<PresenceStore>,
    outbound_capacity: usize,
}

impl SessionManager {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomTable>,
        presence: Arc<PresenceStore>,
        outbound_capacity: usize,
    ) -> Self {
        Self {
            registry,
            rooms,
            presence,
            outbound_capacity,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn rooms(&self) -> &Arc<RoomTable> {
        &self.rooms
    }

    /// Opens a connection for `user_id`, closing any connection it replaces.
    pub async fn connect(&self, user_id: &str) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (conn, rx) = Connection::open(user_id, self.outbound_capacity);
        if let Some(old) = self.registry.register(conn.clone()).await {
            old.close();
            self.rooms.leave_all(&old);
            counter!("chat_evictions_total", "reason" => EvictReason::Superseded.as_str())
                .increment(1);
        }
        (conn, rx)
    }

    /// Closes the connection and removes it from every room. If it is still
    /// the user's registered connection it is also unregistered and the user
    /// is marked offline. Safe to call more than once.
    pub async fn evict(&self, conn: &Connection, reason: EvictReason) {
        conn.close();
        self.rooms.leave_all(conn);

        if !self.registry.remove_if_current(conn).await {
            return;
        }
        counter!("chat_evictions_total", "reason" => reason.as_str()).increment(1);
        info!(
            user_id = %conn.user_id,
            connection_id = %conn.id,
            %reason,
            "connection evicted"
        );

        if let Err(e) = self.presence.mark_offline(&conn.user_id).await {
            warn!(user_id = %conn.user_id, error = %e, "failed to mark user offline");
        }
    }
}
