// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type UserId = String;
pub type ConversationId = String;

/// A persisted chat message. Immutable once stored, except for `is_read`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    #[serde(alias = "chat_id")]
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
}

/// A frame sent from a client to the server.
/// Deserialized from incoming JSON text; `type` is the only routing signal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message {
        #[serde(alias = "chat_id")]
        conversation_id: ConversationId,
        content: String,
    },
    Typing {
        #[serde(alias = "chat_id")]
        conversation_id: ConversationId,
    },
    Read {
        #[serde(alias = "chat_id")]
        conversation_id: ConversationId,
    },
    JoinChat {
        #[serde(alias = "chat_id")]
        conversation_id: ConversationId,
    },
    LeaveChat {
        #[serde(alias = "chat_id")]
        conversation_id: ConversationId,
    },
    Ping,
    Pong,
    #[serde(other)]
    Unknown,
}

/// A frame sent from the server to a client.
/// Serialized into JSON text for sending.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        conversation_id: ConversationId,
        from: UserId,
        content: String,
        message: Message,
        timestamp: i64,
    },
    Typing {
        conversation_id: ConversationId,
        from: UserId,
        timestamp: i64,
    },
    Read {
        conversation_id: ConversationId,
        from: UserId,
        timestamp: i64,
    },
    /// Optimistic acknowledgement once the sender's message is durable.
    Sent {
        conversation_id: ConversationId,
        message_id: Uuid,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    UnreadSummary {
        total: i64,
        chats: BTreeMap<ConversationId, i64>,
    },
    Error {
        code: String,
        reason: String,
    },
    /// Server-wide notice sent to every connected user.
    Broadcast {
        event: String,
        data: serde_json::Value,
        timestamp: i64,
    },
}

impl ServerFrame {
    pub fn pong() -> Self {
        ServerFrame::Pong {
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn error(code: &str, reason: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.to_string(),
            reason: reason.into(),
        }
    }

    /// Id of the chat message carried by this frame, if any.
    pub fn message_id(&self) -> Option<Uuid> {
        match self {
            ServerFrame::Message { message, .. } => Some(message.id),
            ServerFrame::Sent { message_id, .. } => Some(*message_id),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Message,
    Typing,
    Read,
    Broadcast,
}

/// Payload of a bus envelope. `message` and `recipients` are only set for
/// `EnvelopeKind::Message`, `event` and `data` only for
/// `EnvelopeKind::Broadcast`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct EnvelopePayload {
    pub from: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: i64,
}

/// Wire object relayed between processes over the broadcast bus.
/// `id` is the idempotency key; for chat messages it is the message id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BroadcastEnvelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub conversation_id: ConversationId,
    pub origin: String,
    pub payload: EnvelopePayload,
}

impl BroadcastEnvelope {
    pub fn message(message: Message, recipients: Vec<UserId>, origin: &str) -> Self {
        Self {
            id: message.id,
            kind: EnvelopeKind::Message,
            conversation_id: message.conversation_id.clone(),
            origin: origin.to_string(),
            payload: EnvelopePayload {
                from: message.sender_id.clone(),
                timestamp: message.created_at.timestamp(),
                message: Some(message),
                recipients,
                event: None,
                data: None,
            },
        }
    }

    pub fn typing(conversation_id: &str, user_id: &str, origin: &str) -> Self {
        Self::activity(EnvelopeKind::Typing, conversation_id, user_id, origin)
    }

    pub fn read(conversation_id: &str, user_id: &str, origin: &str) -> Self {
        Self::activity(EnvelopeKind::Read, conversation_id, user_id, origin)
    }

    /// Envelope for every connected user on every process. It belongs to no
    /// conversation and has no sender.
    pub fn broadcast(event: &str, data: serde_json::Value, origin: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: EnvelopeKind::Broadcast,
            conversation_id: ConversationId::new(),
            origin: origin.to_string(),
            payload: EnvelopePayload {
                from: UserId::new(),
                message: None,
                recipients: Vec::new(),
                event: Some(event.to_string()),
                data: Some(data),
                timestamp: Utc::now().timestamp(),
            },
        }
    }

    fn activity(kind: EnvelopeKind, conversation_id: &str, user_id: &str, origin: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            conversation_id: conversation_id.to_string(),
            origin: origin.to_string(),
            payload: EnvelopePayload {
                from: user_id.to_string(),
                message: None,
                recipients: Vec::new(),
                event: None,
                data: None,
                timestamp: Utc::now().timestamp(),
            },
        }
    }

    pub fn sender(&self) -> &str {
        &self.payload.from
    }

    /// Converts the envelope into the frame local recipients receive.
    /// Returns `None` for a message envelope without its message or a
    /// broadcast without its event.
    pub fn to_frame(&self) -> Option<ServerFrame> {
        let conversation_id = self.conversation_id.clone();
        let from = self.payload.from.clone();
        let timestamp = self.payload.timestamp;
        match self.kind {
            EnvelopeKind::Message => {
                let message = self.payload.message.clone()?;
                Some(ServerFrame::Message {
                    conversation_id,
                    from,
                    content: message.content.clone(),
                    message,
                    timestamp,
                })
            }
            EnvelopeKind::Typing => Some(ServerFrame::Typing {
                conversation_id,
                from,
                timestamp,
            }),
            EnvelopeKind::Read => Some(ServerFrame::Read {
                conversation_id,
                from,
                timestamp,
            }),
            EnvelopeKind::Broadcast => Some(ServerFrame::Broadcast {
                event: self.payload.event.clone()?,
                data: self.payload.data.clone().unwrap_or_default(),
                timestamp,
            }),
        }
    }
}

/// Unread counts for one user.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UnreadSummary {
    pub total_unread: i64,
    pub chat_unread: BTreeMap<ConversationId, i64>,
}

impl UnreadSummary {
    pub fn from_counts(chat_unread: BTreeMap<ConversationId, i64>) -> Self {
        let total_unread = chat_unread.values().sum();
        Self {
            total_unread,
            chat_unread,
        }
    }
}

impl From<UnreadSummary> for ServerFrame {
    fn from(summary: UnreadSummary) -> Self {
        ServerFrame::UnreadSummary {
            total: summary.total_unread,
            chats: summary.chat_unread,
        }
    }
}
