//! OpenClaw gateway client: OpenAI-compatible /v1/chat/completions with SSE
//! streaming, addressed through an agent pseudo-model (`agent:<agentId>`).

use super::{map_status, with_system_prompt, ChatEventStream, ChatMessage, LlmError, ModelInfo, PROBE_TIMEOUT};
use crate::chat::GenOptions;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:18789";
const AGENT_HEADER: &str = "x-openclaw-agent-id";
const SESSION_HEADER: &str = "x-openclaw-session-key";

/// Client for the cloud gateway. Token and session key are optional; the
/// corresponding headers are only sent when configured.
#[derive(Clone)]
pub struct GatewayClient {
    base_url: String,
    agent_id: String,
    token: Option<String>,
    session_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

/// Gateway messages are plain text only; image attachments are dropped.
#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Option<Vec<CompletionChoice>>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: Option<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

impl GatewayClient {
    pub fn new(
        base_url: Option<String>,
        agent_id: impl Into<String>,
        token: Option<String>,
        session_key: Option<String>,
    ) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            agent_id: agent_id.into(),
            token: token.filter(|t| !t.trim().is_empty()),
            session_key: session_key.filter(|k| !k.trim().is_empty()),
            client: reqwest::Client::new(),
        }
    }

    /// The pseudo-model name for the configured agent.
    pub fn model_name(&self) -> String {
        format!("agent:{}", self.agent_id)
    }

    fn apply_headers(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut req = req.header(AGENT_HEADER, &self.agent_id);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(key) = &self.session_key {
            req = req.header(SESSION_HEADER, key);
        }
        req
    }

    fn request_body(
        &self,
        messages: Vec<ChatMessage>,
        system_prompt: Option<&str>,
        options: &GenOptions,
        stream: bool,
    ) -> CompletionRequest {
        CompletionRequest {
            model: self.model_name(),
            messages: with_system_prompt(messages, system_prompt)
                .into_iter()
                .map(|m| WireMessage {
                    role: m.role,
                    content: m.content,
                })
                .collect(),
            stream,
            temperature: options.temperature,
            top_p: options.top_p,
        }
    }

    /// POST /v1/chat/completions, non-streaming.
    pub async fn send_once(
        &self,
        messages: Vec<ChatMessage>,
        system_prompt: Option<&str>,
        options: &GenOptions,
    ) -> Result<ChatMessage, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.request_body(messages, system_prompt, options, false);
        let res = self.apply_headers(self.client.post(&url)).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(map_status(status, body));
        }
        let data: CompletionResponse = res.json().await?;
        let content = data
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();
        Ok(ChatMessage::assistant(content))
    }

    /// POST /v1/chat/completions with stream: true; the SSE body is decoded
    /// lazily by the returned stream.
    pub async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        system_prompt: Option<&str>,
        options: &GenOptions,
    ) -> Result<ChatEventStream, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.request_body(messages, system_prompt, options, true);
        let res = self.apply_headers(self.client.post(&url)).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(map_status(status, body));
        }
        Ok(ChatEventStream::sse(res))
    }

    /// GET /health, where 200 means healthy. Never errors.
    pub async fn test_connection(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        let res = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        matches!(res, Ok(r) if r.status().is_success())
    }

    /// The gateway has no model enumeration endpoint; report the configured
    /// agent as a single pseudo-model.
    pub fn list_models(&self) -> Vec<ModelInfo> {
        vec![ModelInfo {
            name: self.model_name(),
        }]
    }
}
