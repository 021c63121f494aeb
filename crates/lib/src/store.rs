//! Storage collaborator contract and an in-memory reference implementation.
//!
//! The orchestrator only ever appends or replaces whole records, so a store
//! implementation needs no compound in-place edits; it is assumed to
//! serialize its own writes.

use crate::chat::{Chat, ChatId, Message};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chat not found: {0}")]
    ChatNotFound(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Durable chat/message store consumed by the orchestrator.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_chat(&self, model: &str) -> Result<Chat, StoreError>;
    /// All chats in creation order.
    async fn all_chats(&self) -> Result<Vec<Chat>, StoreError>;
    async fn get_chat(&self, id: &str) -> Result<Option<Chat>, StoreError>;
    /// Replace the stored chat with the same id.
    async fn update_chat(&self, chat: &Chat) -> Result<(), StoreError>;
    /// Remove a chat and all of its messages.
    async fn delete_chat(&self, id: &str) -> Result<(), StoreError>;
    /// Messages of one chat in insertion order.
    async fn messages(&self, chat_id: &str) -> Result<Vec<Message>, StoreError>;
    async fn add_message(&self, message: &Message) -> Result<(), StoreError>;
    /// Replace the stored message with the same id.
    async fn update_message(&self, message: &Message) -> Result<(), StoreError>;
    async fn delete_messages(&self, chat_id: &str, ids: &[String]) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Inner {
    chats: Vec<Chat>,
    messages: HashMap<ChatId, Vec<Message>>,
}

/// In-memory store (used by the CLI and by tests).
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_chat(&self, model: &str) -> Result<Chat, StoreError> {
        let chat = Chat::new(model);
        let mut g = self.inner.write().await;
        g.messages.insert(chat.id.clone(), Vec::new());
        g.chats.push(chat.clone());
        Ok(chat)
    }

    async fn all_chats(&self) -> Result<Vec<Chat>, StoreError> {
        Ok(self.inner.read().await.chats.clone())
    }

    async fn get_chat(&self, id: &str) -> Result<Option<Chat>, StoreError> {
        Ok(self.inner.read().await.chats.iter().find(|c| c.id == id).cloned())
    }

    async fn update_chat(&self, chat: &Chat) -> Result<(), StoreError> {
        let mut g = self.inner.write().await;
        let slot = g
            .chats
            .iter_mut()
            .find(|c| c.id == chat.id)
            .ok_or_else(|| StoreError::ChatNotFound(chat.id.clone()))?;
        *slot = chat.clone();
        Ok(())
    }

    async fn delete_chat(&self, id: &str) -> Result<(), StoreError> {
        let mut g = self.inner.write().await;
        g.chats.retain(|c| c.id != id);
        g.messages.remove(id);
        Ok(())
    }

    async fn messages(&self, chat_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .messages
            .get(chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut g = self.inner.write().await;
        g.messages
            .entry(message.chat_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn update_message(&self, message: &Message) -> Result<(), StoreError> {
        let mut g = self.inner.write().await;
        let list = g
            .messages
            .get_mut(&message.chat_id)
            .ok_or_else(|| StoreError::ChatNotFound(message.chat_id.clone()))?;
        if let Some(slot) = list.iter_mut().find(|m| m.id == message.id) {
            *slot = message.clone();
        }
        Ok(())
    }

    async fn delete_messages(&self, chat_id: &str, ids: &[String]) -> Result<(), StoreError> {
        let mut g = self.inner.write().await;
        if let Some(list) = g.messages.get_mut(chat_id) {
            list.retain(|m| !ids.contains(&m.id));
        }
        Ok(())
    }
}
