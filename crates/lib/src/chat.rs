//! Chat and message data model shared by the registry, store, and orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique chat identifier (opaque string).
pub type ChatId = String;

/// Title used for a chat before title generation has produced one, and as the
/// placeholder while a reasoning model is still inside its thinking tag.
pub const DEFAULT_TITLE: &str = "New chat";

/// A persisted conversation thread: model, title, system prompt, and
/// generation options. At most one in-flight stream may exist per chat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub model: String,
    pub title: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub options: GenOptions,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chat-{}", uuid::Uuid::new_v4()),
            model: model.into(),
            title: DEFAULT_TITLE.to_string(),
            system_prompt: String::new(),
            options: GenOptions::default(),
            created_at: Utc::now(),
        }
    }
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One turn in a chat. `content` grows incrementally while an assistant
/// message is streaming; `done` flips when the stream finishes (or is
/// cancelled and finalized with what had accumulated).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: ChatId,
    pub role: Role,
    pub content: String,
    /// Base64-encoded image attachments (local backend only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub done: bool,
}

impl Message {
    pub fn user(chat_id: impl Into<ChatId>, content: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            chat_id: chat_id.into(),
            role: Role::User,
            content: content.into(),
            images,
            created_at: Utc::now(),
            done: true,
        }
    }

    /// Empty assistant message used as the in-flight assembly target while
    /// streaming. Timestamped again when finalized.
    pub fn assistant_partial(chat_id: impl Into<ChatId>) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            chat_id: chat_id.into(),
            role: Role::Assistant,
            content: String::new(),
            images: Vec::new(),
            created_at: Utc::now(),
            done: false,
        }
    }
}

/// Generation options forwarded to the backend. Absent options are omitted
/// from request bodies so backend defaults apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u32>,
}

impl GenOptions {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.top_p.is_none() && self.num_ctx.is_none()
    }
}
