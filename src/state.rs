// src/state.rs

use std::sync::Arc;

use crate::service::ChatService;

/// The application's shared state, accessible from all request handlers.
/// Created once in `main.rs` and shared with every connection through Axum's
/// state management.
#[derive(Clone)]
pub struct ChatState {
    pub chat: Arc<ChatService>,
}

impl ChatState {
    pub fn new(chat: ChatService) -> Self {
        Self {
            chat: Arc::new(chat),
        }
    }
}
