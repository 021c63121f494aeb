//! LLM backends: local inference server (NDJSON streaming) and OpenClaw
//! gateway (OpenAI-compatible SSE streaming), behind one capability surface.
//!
//! Which backend to use is decided once when the [`Backend`] value is
//! constructed from config; it is never re-evaluated mid-stream.

mod decode;
mod gateway;
mod local;
mod stream;

pub use decode::{NdjsonDecoder, SseDecoder, StreamEvent};
pub use gateway::GatewayClient;
pub use local::LocalClient;
pub use stream::ChatEventStream;

use crate::chat::GenOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeout for the lightweight liveness probe. Active chat streams are never
/// subject to a timeout.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One message on the wire: role string plus plain text content, with
/// optional base64 image attachments (local backend only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
            images: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            images: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            images: None,
        }
    }
}

/// A model offered by a backend. The gateway has no enumeration endpoint, so
/// it reports a single pseudo-model for the configured agent.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
}

/// Backend failure taxonomy. Decode-level malformed fragments never surface
/// here: partial frames are buffered and retried against the next chunk.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("authentication failed (401); check the configured token")]
    Auth,
    #[error("endpoint not found (404); backend misconfigured or feature disabled")]
    EndpointNotFound,
    #[error("backend internal error ({0})")]
    BackendInternal(u16),
    #[error("backend returned {code}: {body}")]
    Backend { code: u16, body: String },
    #[error("connection failed: {0}")]
    Connectivity(reqwest::Error),
    #[error("{0}")]
    Unknown(String),
}

impl LlmError {
    /// Transport-level failures get different user-facing wording than
    /// protocol, auth, or backend failures.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, LlmError::Connectivity(_))
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            LlmError::Unknown(e.to_string())
        } else {
            LlmError::Connectivity(e)
        }
    }
}

/// Map a non-2xx status to a typed failure.
pub(crate) fn map_status(status: reqwest::StatusCode, body: String) -> LlmError {
    match status.as_u16() {
        401 => LlmError::Auth,
        404 => LlmError::EndpointNotFound,
        c if c >= 500 => LlmError::BackendInternal(c),
        c => LlmError::Backend { code: c, body },
    }
}

/// The two interchangeable chat-completion providers as a tagged variant.
#[derive(Clone)]
pub enum Backend {
    Local(LocalClient),
    Gateway(GatewayClient),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Local(_) => "local server",
            Backend::Gateway(_) => "gateway",
        }
    }

    /// Non-streaming chat completion.
    pub async fn send_once(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        system_prompt: Option<&str>,
        options: &GenOptions,
    ) -> Result<ChatMessage, LlmError> {
        match self {
            Backend::Local(c) => c.send_once(model, messages, system_prompt, options).await,
            Backend::Gateway(c) => c.send_once(messages, system_prompt, options).await,
        }
    }

    /// Streaming chat completion. Status codes are mapped before any events
    /// are produced; the response body feeds the matching frame decoder.
    pub async fn stream_chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        system_prompt: Option<&str>,
        options: &GenOptions,
    ) -> Result<ChatEventStream, LlmError> {
        match self {
            Backend::Local(c) => c.stream_chat(model, messages, system_prompt, options).await,
            Backend::Gateway(c) => c.stream_chat(messages, system_prompt, options).await,
        }
    }

    /// Liveness probe with a short timeout. Never errors.
    pub async fn test_connection(&self) -> bool {
        match self {
            Backend::Local(c) => c.test_connection().await,
            Backend::Gateway(c) => c.test_connection().await,
        }
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        match self {
            Backend::Local(c) => c.list_models().await,
            Backend::Gateway(c) => Ok(c.list_models()),
        }
    }
}

/// Prepend the system prompt (when non-empty) as a system-role entry.
pub(crate) fn with_system_prompt(
    messages: Vec<ChatMessage>,
    system_prompt: Option<&str>,
) -> Vec<ChatMessage> {
    match system_prompt.map(str::trim).filter(|s| !s.is_empty()) {
        Some(sp) => {
            let mut all = Vec::with_capacity(messages.len() + 1);
            all.push(ChatMessage::system(sp));
            all.extend(messages);
            all
        }
        None => messages,
    }
}
