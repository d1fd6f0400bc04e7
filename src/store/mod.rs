// src/store/mod.rs

// Durable message and conversation storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ChatResult;
use crate::models::{Message, UserId};

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryChatStore;
pub use self::postgres::PgChatStore;

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persists a message. The store assigns `id` and `created_at`.
    async fn create_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> ChatResult<Message>;

    /// Marks every message not sent by `reader_id` as read. Returns the
    /// number of rows that changed.
    async fn mark_read(&self, conversation_id: &str, reader_id: &str) -> ChatResult<u64>;

    async fn participants_of(&self, conversation_id: &str) -> ChatResult<Vec<UserId>>;

    async fn is_participant(&self, conversation_id: &str, user_id: &str) -> ChatResult<bool>;

    async fn update_conversation_summary(
        &self,
        conversation_id: &str,
        last_message: &str,
        at: DateTime<Utc>,
    ) -> ChatResult<()>;

    async fn ping(&self) -> ChatResult<()>;
}
