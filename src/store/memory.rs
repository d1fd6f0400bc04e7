// src/store/memory.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use uuid::Uuid;

use super::ChatStore;
use crate::error::{ChatError, ChatResult};
use crate::models::{ConversationId, Message, UserId};

#[derive(Debug, Default)]
struct Conversation {
    participants: BTreeSet<UserId>,
    messages: Vec<Message>,
    last_message: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

/// Store held in process memory, for tests and local development.
#[derive(Clone, Debug, Default)]
pub struct MemoryChatStore {
    conversations: Arc<Mutex<HashMap<ConversationId, Conversation>>>,
    fail_writes: Arc<AtomicBool>,
    participant_lookup_failures: Arc<AtomicUsize>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn conversations(&self) -> MutexGuard<'_, HashMap<ConversationId, Conversation>> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_conversation<I, S>(&self, conversation_id: &str, participants: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<UserId>,
    {
        let mut conversations = self.conversations();
        let conversation = conversations
            .entry(conversation_id.to_string())
            .or_default();
        conversation
            .participants
            .extend(participants.into_iter().map(Into::into));
    }

    /// Makes every subsequent write fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` participant lookups fail with a storage error.
    pub fn fail_participant_lookups(&self, count: usize) {
        self.participant_lookup_failures.store(count, Ordering::SeqCst);
    }

    /// Stored messages of a conversation, oldest first.
    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.conversations()
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn last_message(&self, conversation_id: &str) -> Option<String> {
        self.conversations()
            .get(conversation_id)
            .and_then(|c| c.last_message.clone())
    }

    fn check_writable(&self) -> ChatResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChatError::Storage("writes disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn create_message(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> ChatResult<Message> {
        self.check_writable()?;
        let mut conversations = self.conversations();
        let conversation = conversations.get_mut(conversation_id).ok_or_else(|| {
            ChatError::Storage(format!("conversation {conversation_id} does not exist"))
        })?;
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            is_read: false,
        };
        conversation.messages.push(message.clone());
        Ok(message)
    }

    async fn mark_read(&self, conversation_id: &str, reader_id: &str) -> ChatResult<u64> {
        self.check_writable()?;
        let mut conversations = self.conversations();
        let Some(conversation) = conversations.get_mut(conversation_id) else {
            return Ok(0);
        };
        let mut changed = 0;
        for message in conversation
            .messages
            .iter_mut()
            .filter(|m| m.sender_id != reader_id && !m.is_read)
        {
            message.is_read = true;
            changed += 1;
        }
        Ok(changed)
    }

    async fn participants_of(&self, conversation_id: &str) -> ChatResult<Vec<UserId>> {
        let failing = self
            .participant_lookup_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChatError::Storage("participant lookup failed".into()));
        }
        Ok(self
            .conversations()
            .get(conversation_id)
            .map(|c| c.participants.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn is_participant(&self, conversation_id: &str, user_id: &str) -> ChatResult<bool> {
        Ok(self
            .conversations()
            .get(conversation_id)
            .is_some_and(|c| c.participants.contains(user_id)))
    }

    async fn update_conversation_summary(
        &self,
        conversation_id: &str,
        last_message: &str,
        at: DateTime<Utc>,
    ) -> ChatResult<()> {
        self.check_writable()?;
        if let Some(conversation) = self.conversations().get_mut(conversation_id) {
            conversation.last_message = Some(last_message.to_string());
            conversation.updated_at = Some(at);
        }
        Ok(())
    }

    async fn ping(&self) -> ChatResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mark_read_skips_own_messages() {
        let store = MemoryChatStore::new();
        store.add_conversation("c1", ["alice", "bob"]);
        store.create_message("c1", "alice", "hi").await.unwrap();
        store.create_message("c1", "bob", "hey").await.unwrap();

        assert_eq!(store.mark_read("c1", "bob").await.unwrap(), 1);
        assert_eq!(store.mark_read("c1", "bob").await.unwrap(), 0);
        let messages = store.messages("c1");
        assert!(messages[0].is_read);
        assert!(!messages[1].is_read);
    }

    #[tokio::test]
    async fn failing_writes_surface_storage_errors() {
        let store = MemoryChatStore::new();
        store.add_conversation("c1", ["alice"]);
        store.set_fail_writes(true);
        let err = store.create_message("c1", "alice", "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::Storage(_)));
        assert!(store.messages("c1").is_empty());
    }
}
