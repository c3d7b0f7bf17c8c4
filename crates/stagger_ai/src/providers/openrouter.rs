//! OpenRouter provider (multi-model gateway).
//!
//! OpenRouter uses the OpenAI chat completions format, so streaming replies go
//! through the shared SSE driver in [`super::openai_sse`]. Specifics:
//!
//! - Base URL: `https://openrouter.ai/api/v1`
//! - Extra headers: `HTTP-Referer` (optional) and `X-Title`
//! - Model IDs use `org/name[:variant]` format (e.g. `qwen/qwen3-4b:free`)

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use super::openai_sse::{self, ChatCompletionResponse};
use super::{AiProvider, ChunkReceiver, ProviderError};
use crate::types::{ChatMessage, ChatRequest, ChatResponse, FinishReason};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_TITLE: &str = "Stagger";

// ---------------------------------------------------------------------------
// Wire types (serialization only)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct OpenRouterChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenRouterMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    /// When streaming, ask the API to include usage in the final chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenRouterMessage<'a> {
    role: &'static str,
    content: &'a str,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// OpenRouter API provider.
pub struct OpenRouterProvider {
    api_key: Option<String>,
    base_url: String,
    title: String,
    referer: Option<String>,
    client: reqwest::Client,
}

impl OpenRouterProvider {
    /// Create a new OpenRouter provider against the public endpoint.
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.into())
    }

    /// Create a provider with a custom base URL.
    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            api_key: if api_key.is_empty() {
                None
            } else {
                Some(api_key)
            },
            base_url: base_url.trim_end_matches('/').to_string(),
            title: DEFAULT_TITLE.into(),
            referer: None,
            client: reqwest::Client::new(),
        }
    }

    /// Set the `X-Title` / `HTTP-Referer` attribution headers.
    pub fn with_attribution(mut self, title: impl Into<String>, referer: Option<String>) -> Self {
        self.title = title.into();
        self.referer = referer;
        self
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Convert generic messages to the wire format, system prompt first.
    fn convert_messages<'a>(
        messages: &'a [ChatMessage],
        system_prompt: Option<&'a str>,
    ) -> Vec<OpenRouterMessage<'a>> {
        let mut out = Vec::with_capacity(messages.len() + 1);

        if let Some(sys) = system_prompt {
            out.push(OpenRouterMessage {
                role: "system",
                content: sys,
            });
        }

        out.extend(messages.iter().map(|m| OpenRouterMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));

        out
    }

    /// Build the JSON request body.
    fn build_body<'a>(&self, request: &'a ChatRequest, stream: bool) -> OpenRouterChatRequest<'a> {
        OpenRouterChatRequest {
            model: &request.model,
            messages: Self::convert_messages(&request.messages, request.system_prompt.as_deref()),
            stream,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    /// Get the API key or return an error.
    fn require_key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or(ProviderError::InvalidKey)
    }

    /// Send a POST to the chat completions endpoint and map non-success
    /// statuses onto [`ProviderError`].
    async fn post_completions(
        &self,
        body: &OpenRouterChatRequest<'_>,
    ) -> Result<reqwest::Response, ProviderError> {
        let key = self.require_key()?;
        let url = format!("{}/chat/completions", self.base_url);

        let mut builder = self
            .client
            .post(&url)
            .bearer_auth(key)
            .header("Content-Type", "application/json")
            .header("X-Title", &self.title);
        if let Some(referer) = &self.referer {
            builder = builder.header("HTTP-Referer", referer);
        }

        let resp = builder
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        check_status(resp).await
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ProviderError::InvalidKey);
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimit);
    }
    if status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::GATEWAY_TIMEOUT
    {
        return Err(ProviderError::Timeout);
    }
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(ProviderError::Provider(format!(
            "OpenRouter API error {status}: {text}"
        )));
    }
    Ok(resp)
}

/// Turn a complete-reply body into a [`ChatResponse`].
async fn read_completion(
    resp: reqwest::Response,
    requested_model: &str,
) -> Result<ChatResponse, ProviderError> {
    let data: ChatCompletionResponse = resp
        .json()
        .await
        .map_err(|e| ProviderError::Provider(format!("Unexpected response body: {e}")))?;

    let choice = data
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Provider("No choices in OpenRouter response".into()))?;

    Ok(ChatResponse {
        content: choice.message.content.unwrap_or_default(),
        model: if data.model.is_empty() {
            requested_model.to_string()
        } else {
            data.model
        },
        usage: data.usage.map(|u| u.into_usage()).unwrap_or_default(),
        finish_reason: FinishReason::from_wire(choice.finish_reason.as_deref()),
    })
}

#[async_trait]
impl AiProvider for OpenRouterProvider {
    fn name(&self) -> &str {
        "OpenRouter"
    }

    async fn is_available(&self) -> bool {
        self.api_key.as_ref().is_some_and(|k| !k.is_empty())
    }

    /// Non-streaming chat completion.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = self.build_body(request, false);
        let resp = self.post_completions(&body).await?;
        read_completion(resp, &request.model).await
    }

    /// Streaming chat completion via SSE.
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkReceiver, ProviderError> {
        let body = self.build_body(request, true);
        let resp = self.post_completions(&body).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(openai_sse::drive_sse_stream(resp, tx));

        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
