// src/rooms.rs

use dashmap::DashMap;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tracing::debug;
use uuid::Uuid;

use crate::models::ConversationId;
use crate::registry::Connection;

type Members = HashMap<Uuid, Weak<Connection>>;

/// Conversation id to the local connections currently viewing it.
///
/// Rooms are created on first join and removed when the last member leaves.
/// Members are held weakly: the registry owns connections, a room only points
/// at them.
#[derive(Default)]
pub struct RoomTable {
    rooms: DashMap<ConversationId, Members>,
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent. Returns `false` and leaves no trace if the connection is
    /// already closed.
    pub fn join(&self, conversation_id: &str, conn: &Arc<Connection>) -> bool {
        if conn.is_closed() {
            return false;
        }
        self.rooms
            .entry(conversation_id.to_string())
            .or_default()
            .insert(conn.id, Arc::downgrade(conn));
        conn.joined_rooms.insert(conversation_id.to_string());

        // Eviction closes before it runs `leave_all`, so a close that raced
        // the insert above is caught here.
        if conn.is_closed() {
            self.leave(conversation_id, conn);
            return false;
        }
        debug!(conversation_id, user_id = %conn.user_id, "joined room");
        true
    }

    pub fn leave(&self, conversation_id: &str, conn: &Connection) {
        conn.joined_rooms.remove(conversation_id);
        let now_empty = match self.rooms.get_mut(conversation_id) {
            Some(mut members) => {
                members.remove(&conn.id);
                members.is_empty()
            }
            None => return,
        };
        if now_empty {
            self.rooms
                .remove_if(conversation_id, |_, members| members.is_empty());
        }
        debug!(conversation_id, user_id = %conn.user_id, "left room");
    }

    /// Live members of a room, copied out so no shard lock is held while the
    /// caller writes to them.
    pub fn members_of(&self, conversation_id: &str) -> Vec<Arc<Connection>> {
        self.rooms
            .get(conversation_id)
            .map(|members| members.values().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// Removes the connection from every room it is in. Only the rooms the
    /// connection recorded are visited.
    pub fn leave_all(&self, conn: &Connection) {
        for conversation_id in conn.joined_rooms() {
            self.leave(&conversation_id, conn);
        }
    }

    pub fn is_member(&self, conversation_id: &str, conn: &Connection) -> bool {
        self.rooms
            .get(conversation_id)
            .is_some_and(|members| members.contains_key(&conn.id))
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
