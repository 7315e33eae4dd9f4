//! HTTP clients for the reasoning backends. Both implement [`LlmClient`] and are interchangeable
//! behind [`crate::agent::LlmDecisionProvider`].

use std::future::Future;
use std::pin::Pin;

use anyhow::Context;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::{LlmClient, LlmRequest};

/// Config for an Ollama-style `POST /api/generate` endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct OllamaConfig {
    /// Full endpoint URL, e.g. `http://127.0.0.1:11434/api/generate`.
    pub endpoint: String,
    /// Used when the agent block names no model.
    #[serde(default)]
    pub default_model: String,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

fn pick_model<'a>(requested: &'a str, fallback: &'a str) -> &'a str {
    if requested.trim().is_empty() {
        fallback
    } else {
        requested
    }
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    cfg: OllamaConfig,
    http: Client,
}

impl OllamaClient {
    pub fn new(cfg: OllamaConfig, http: Client) -> Self {
        Self { cfg, http }
    }

    pub async fn generate(&self, request: &LlmRequest) -> anyhow::Result<String> {
        if !request.aux_handles.is_empty() {
            debug!(handles = ?request.aux_handles, "ollama backend ignores aux channels");
        }
        let body = OllamaRequest {
            model: pick_model(&request.model, &self.cfg.default_model),
            system: &request.system,
            prompt: &request.prompt,
            stream: false,
        };

        let res = self
            .http
            .post(&self.cfg.endpoint)
            .json(&body)
            .send()
            .await
            .context("ollama request failed")?
            .error_for_status()
            .context("ollama non-2xx response")?
            .json::<OllamaResponse>()
            .await
            .context("ollama response decode failed")?;

        Ok(res.response)
    }
}

impl LlmClient for OllamaClient {
    fn complete<'a>(
        &'a self,
        request: LlmRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        Box::pin(async move { self.generate(&request).await })
    }
}

/// Config for an OpenAI-compatible `POST /v1/chat/completions` endpoint.
///
/// Routers that host MCP servers accept the extra `mcp_servers` field; aux channel handles are
/// sent there.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChatCompletionsConfig {
    pub endpoint: String,
    #[serde(default)]
    pub default_model: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "no_handles")]
    mcp_servers: &'a [String],
}

fn no_handles(handles: &&[String]) -> bool {
    handles.is_empty()
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatCompletionsClient {
    cfg: ChatCompletionsConfig,
    http: Client,
}

impl ChatCompletionsClient {
    pub fn new(cfg: ChatCompletionsConfig, http: Client) -> Self {
        Self { cfg, http }
    }

    pub async fn chat(&self, request: &LlmRequest) -> anyhow::Result<String> {
        let mut messages = Vec::with_capacity(2);
        if !request.system.trim().is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &request.system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: pick_model(&request.model, &self.cfg.default_model),
            messages,
            mcp_servers: &request.aux_handles,
        };

        let mut req = self.http.post(&self.cfg.endpoint).json(&body);
        if let Some(key) = self.cfg.api_key.as_deref() {
            req = req.bearer_auth(key);
        }

        let res = req
            .send()
            .await
            .context("chat completions request failed")?
            .error_for_status()
            .context("chat completions non-2xx response")?
            .json::<ChatResponse>()
            .await
            .context("chat completions response decode failed")?;

        res.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("chat completions response had no content"))
    }
}

impl LlmClient for ChatCompletionsClient {
    fn complete<'a>(
        &'a self,
        request: LlmRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
        Box::pin(async move { self.chat(&request).await })
    }
}
