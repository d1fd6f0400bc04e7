// src/queue.rs

use metrics::counter;
use std::{fmt, str::FromStr};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// What a bounded work queue does when it is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Hand the item back so the producer processes it itself.
    Inline,
    /// Wait for capacity, pushing back on the producer.
    Block,
    /// Discard the item, with a warning and a counter.
    Drop,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inline" => Ok(OverflowPolicy::Inline),
            "block" => Ok(OverflowPolicy::Block),
            "drop" => Ok(OverflowPolicy::Drop),
            other => Err(format!("unknown overflow policy {other:?} (inline|block|drop)")),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OverflowPolicy::Inline => "inline",
            OverflowPolicy::Block => "block",
            OverflowPolicy::Drop => "drop",
        };
        f.write_str(name)
    }
}

/// Outcome of [`WorkQueue::submit`].
#[derive(Debug)]
pub enum Submitted<T> {
    Queued,
    /// The queue could not take the item; the caller must process it now.
    Inline(T),
    Dropped,
}

/// Producer half of a bounded queue with a named overflow policy.
#[derive(Debug)]
pub struct WorkQueue<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    policy: OverflowPolicy,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
            policy: self.policy,
        }
    }
}

impl<T> WorkQueue<T> {
    pub fn bounded(
        name: &'static str,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { name, tx, policy }, rx)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub async fn submit(&self, item: T) -> Submitted<T> {
        let item = match self.tx.try_send(item) {
            Ok(()) => return Submitted::Queued,
            // No consumer left (shutdown); the caller still owns the work.
            Err(TrySendError::Closed(item)) => return Submitted::Inline(item),
            Err(TrySendError::Full(item)) => item,
        };

        counter!("chat_queue_overflow_total", "queue" => self.name).increment(1);
        match self.policy {
            OverflowPolicy::Inline => {
                warn!(queue = self.name, "queue full, processing inline");
                Submitted::Inline(item)
            }
            OverflowPolicy::Block => match self.tx.send(item).await {
                Ok(()) => Submitted::Queued,
                Err(mpsc::error::SendError(item)) => Submitted::Inline(item),
            },
            OverflowPolicy::Drop => {
                warn!(queue = self.name, "queue full, dropping item");
                Submitted::Dropped
            }
        }
    }
}
