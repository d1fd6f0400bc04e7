// src/ingest.rs

use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, warn};

use crate::delivery::{DeliveryPool, DeliveryTask};
use crate::error::{ChatError, ChatResult};
use crate::models::{BroadcastEnvelope, ConversationId, Message, UserId};
use crate::queue::{Submitted, WorkQueue};
use crate::store::ChatStore;

const PARTICIPANT_LOOKUP_ATTEMPTS: u32 = 2;

/// Pending update of a conversation's `last_message`/`updated_at`.
#[derive(Debug, Clone)]
pub struct SummaryTask {
    pub conversation_id: ConversationId,
    pub last_message: String,
    pub at: DateTime<Utc>,
}

/// Validates, persists and schedules delivery of incoming chat messages.
pub struct IngestPipeline {
    store: Arc<dyn ChatStore>,
    pool: Arc<DeliveryPool>,
    summaries: WorkQueue<SummaryTask>,
    max_content_chars: usize,
    instance_id: String,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn ChatStore>,
        pool: Arc<DeliveryPool>,
        summaries: WorkQueue<SummaryTask>,
        max_content_chars: usize,
        instance_id: &str,
    ) -> Self {
        Self {
            store,
            pool,
            summaries,
            max_content_chars,
            instance_id: instance_id.to_string(),
        }
    }

    /// Accepts a message from `sender_id`.
    ///
    /// Returns once the message is durable and its delivery is scheduled.
    /// Validation and permission failures leave no trace; a storage failure
    /// means nothing was delivered.
    pub async fn ingest(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> ChatResult<Message> {
        self.validate(conversation_id, content)?;

        if !self.store.is_participant(conversation_id, sender_id).await? {
            return Err(ChatError::permission(sender_id, conversation_id));
        }

        let message = self
            .store
            .create_message(conversation_id, sender_id, content)
            .await?;
        debug!(message_id = %message.id, conversation_id, sender_id, "message persisted");

        let recipients: Vec<UserId> = self
            .recipients_of(conversation_id)
            .await
            .into_iter()
            .filter(|user_id| user_id != sender_id)
            .collect();

        self.schedule_summary(SummaryTask {
            conversation_id: message.conversation_id.clone(),
            last_message: message.content.clone(),
            at: message.created_at,
        })
        .await;

        let envelope = BroadcastEnvelope::message(message.clone(), recipients, &self.instance_id);
        self.pool.dispatch(DeliveryTask::local(envelope)).await;

        Ok(message)
    }

    /// Participants to count unread for. One retry; after that room members
    /// still get the message but no unread counter moves.
    async fn recipients_of(&self, conversation_id: &str) -> Vec<UserId> {
        let mut last_error = None;
        for attempt in 1..=PARTICIPANT_LOOKUP_ATTEMPTS {
            match self.store.participants_of(conversation_id).await {
                Ok(participants) => return participants,
                Err(e) => {
                    debug!(conversation_id, attempt, error = %e, "participant lookup failed");
                    last_error = Some(e);
                }
            }
        }
        counter!("chat_participant_lookup_failures_total").increment(1);
        if let Some(e) = last_error {
            warn!(conversation_id, error = %e, "failed to load participants, unread counts skipped");
        }
        Vec::new()
    }

    fn validate(&self, conversation_id: &str, content: &str) -> ChatResult<()> {
        if conversation_id.trim().is_empty() {
            return Err(ChatError::Validation("conversation id is required".into()));
        }
        if content.trim().is_empty() {
            return Err(ChatError::Validation("message content cannot be empty".into()));
        }
        let chars = content.chars().count();
        if chars > self.max_content_chars {
            return Err(ChatError::Validation(format!(
                "message content too long ({chars} > {} characters)",
                self.max_content_chars
            )));
        }
        Ok(())
    }

    async fn schedule_summary(&self, task: SummaryTask) {
        match self.summaries.submit(task).await {
            Submitted::Queued | Submitted::Dropped => {}
            Submitted::Inline(task) => write_summary(self.store.as_ref(), task).await,
        }
    }
}

async fn write_summary(store: &dyn ChatStore, task: SummaryTask) {
    if let Err(e) = store
        .update_conversation_summary(&task.conversation_id, &task.last_message, task.at)
        .await
    {
        error!(conversation_id = %task.conversation_id, error = %e, "failed to update conversation summary");
    }
}

/// Drains the conversation summary queue.
pub fn spawn_summary_writer(
    store: Arc<dyn ChatStore>,
    mut rx: mpsc::Receiver<SummaryTask>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(task) = rx.recv().await {
            write_summary(store.as_ref(), task).await;
        }
    })
}
