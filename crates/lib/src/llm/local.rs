//! Local inference server client (http://127.0.0.1:11434 by default).
//! Supports non-streaming and streaming chat (NDJSON), model listing, and a
//! liveness probe.

use super::{
    map_status, with_system_prompt, ChatEventStream, ChatMessage, LlmError, ModelInfo,
    PROBE_TIMEOUT,
};
use crate::chat::GenOptions;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

/// Client for the local server HTTP API. Addresses raw model names; no auth
/// or agent headers.
#[derive(Clone)]
pub struct LocalClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<WireOptions>,
    stream: bool,
}

/// Generation options as the server reads them: snake_case field names,
/// unlike the camelCase config/storage form.
#[derive(Debug, Serialize)]
struct WireOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<u32>,
}

impl From<GenOptions> for WireOptions {
    fn from(o: GenOptions) -> Self {
        Self {
            temperature: o.temperature,
            top_p: o.top_p,
            num_ctx: o.num_ctx,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponseBody {
    #[serde(default)]
    message: Option<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Option<Vec<TagModel>>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

impl LocalClient {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request_body(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        system_prompt: Option<&str>,
        options: &GenOptions,
        stream: bool,
    ) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: with_system_prompt(messages, system_prompt),
            options: (!options.is_empty()).then(|| WireOptions::from(*options)),
            stream,
        }
    }

    /// POST /api/chat, non-streaming.
    pub async fn send_once(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        system_prompt: Option<&str>,
        options: &GenOptions,
    ) -> Result<ChatMessage, LlmError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = self.request_body(model, messages, system_prompt, options, false);
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(map_status(status, body));
        }
        let data: ChatResponseBody = res.json().await?;
        let content = data.message.map(|m| m.content).unwrap_or_default();
        Ok(ChatMessage::assistant(content))
    }

    /// POST /api/chat with stream: true. The NDJSON body is decoded lazily by
    /// the returned stream.
    pub async fn stream_chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        system_prompt: Option<&str>,
        options: &GenOptions,
    ) -> Result<ChatEventStream, LlmError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = self.request_body(model, messages, system_prompt, options, true);
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(map_status(status, body));
        }
        Ok(ChatEventStream::ndjson(res))
    }

    /// GET on the server root. Any transport error or non-200 yields false.
    pub async fn test_connection(&self) -> bool {
        let res = self
            .client
            .get(&self.base_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        matches!(res, Ok(r) if r.status().is_success())
    }

    /// GET /api/tags, the server's model list.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
        let url = format!("{}/api/tags", self.base_url);
        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(map_status(status, body));
        }
        let data: TagsResponse = res.json().await?;
        Ok(data
            .models
            .unwrap_or_default()
            .into_iter()
            .map(|m| ModelInfo { name: m.name })
            .collect())
    }
}
