//! Conversation context shared by the turn aggregators of one session.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Append-only ordered message history. Cloning shares the same history.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Arc<Mutex<Vec<ChatMessage>>>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: ChatMessage) {
        self.lock().push(message);
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Pushes never leave the vector half-written, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Vec<ChatMessage>> {
        self.messages.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
