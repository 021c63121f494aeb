//! In-memory table of chat metadata plus the currently selected chat index.
//!
//! Owned exclusively by the orchestrator; nothing else reads or writes it.
//! `selected == None` represents the draft/empty chat state.

use crate::chat::{Chat, ChatId};

#[derive(Debug, Default)]
pub struct ChatRegistry {
    chats: Vec<Chat>,
    selected: Option<usize>,
}

impl ChatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the chat list (e.g. after loading from storage). A selection
    /// that no longer points at a valid index is cleared.
    pub fn set_chats(&mut self, chats: Vec<Chat>) {
        self.chats = chats;
        if let Some(i) = self.selected {
            if i >= self.chats.len() {
                self.selected = None;
            }
        }
    }

    pub fn chats(&self) -> &[Chat] {
        &self.chats
    }

    pub fn push(&mut self, chat: Chat) {
        self.chats.push(chat);
    }

    pub fn remove(&mut self, id: &str) {
        if let Some(i) = self.position(id) {
            self.chats.remove(i);
            match self.selected {
                Some(s) if s == i => self.selected = None,
                Some(s) if s > i => self.selected = Some(s - 1),
                _ => {}
            }
        }
    }

    /// Select a chat by index (or none). An out-of-range index clears the
    /// selection. Returns the newly selected chat, if any.
    pub fn select(&mut self, index: Option<usize>) -> Option<&Chat> {
        self.selected = index.filter(|&i| i < self.chats.len());
        self.selected_chat()
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.selected
    }

    pub fn selected_chat(&self) -> Option<&Chat> {
        self.selected.and_then(|i| self.chats.get(i))
    }

    pub fn selected_chat_id(&self) -> Option<ChatId> {
        self.selected_chat().map(|c| c.id.clone())
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.chats.iter().position(|c| c.id == id)
    }

    pub fn chat(&self, id: &str) -> Option<&Chat> {
        self.chats.iter().find(|c| c.id == id)
    }

    pub fn chat_mut(&mut self, id: &str) -> Option<&mut Chat> {
        self.chats.iter_mut().find(|c| c.id == id)
    }
}
