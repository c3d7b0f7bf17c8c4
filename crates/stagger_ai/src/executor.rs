//! Attempt executor -- one timed call to one provider.
//!
//! The executor turns whatever the provider does into an explicit
//! [`AttemptOutcome`]. The deadline bounds the time to the *first usable
//! output*: the full body in complete mode, the first non-empty delta in
//! stream mode. Cancellation drops the in-flight call, which closes its
//! connection.

use std::sync::Arc;

use stagger_core::ReplyMode;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::providers::{AiProvider, ChunkReceiver, ProviderError};
use crate::types::{ChatMessage, ChatRequest};

const DEFAULT_SYSTEM_PROMPT: &str = "Use this context if helpful: {context}";

/// Usable output of an attempt that got somewhere.
#[derive(Debug)]
pub enum AttemptOutput {
    /// A non-incremental reply, delivered whole.
    Complete(String),
    /// An incremental reply: the first text chunk, then the rest of the
    /// stream up to and including the end marker.
    Streaming { first: String, rest: ChunkReceiver },
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Succeeded(AttemptOutput),
    Failed(ProviderError),
    TimedOut,
    Cancelled,
}

/// Issues single attempts against one provider.
#[derive(Clone)]
pub struct AttemptExecutor {
    provider: Arc<dyn AiProvider>,
    reply_mode: ReplyMode,
    system_prompt: String,
    max_tokens: Option<u32>,
}

impl AttemptExecutor {
    pub fn new(provider: Arc<dyn AiProvider>, reply_mode: ReplyMode) -> Self {
        Self {
            provider,
            reply_mode,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_tokens: None,
        }
    }

    /// Template for the system prompt; `{context}` is replaced per request.
    pub fn with_system_prompt(mut self, template: impl Into<String>) -> Self {
        self.system_prompt = template.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Whether the provider can take calls at all (e.g. has a credential).
    pub async fn provider_available(&self) -> bool {
        self.provider.is_available().await
    }

    pub fn build_request(&self, model: &str, messages: &[ChatMessage], context: &str) -> ChatRequest {
        ChatRequest {
            messages: messages.to_vec(),
            model: model.to_string(),
            max_tokens: self.max_tokens,
            temperature: None,
            system_prompt: Some(self.system_prompt.replace("{context}", context)),
        }
    }

    /// Run one attempt to its first usable output, its deadline, or its
    /// cancellation, whichever comes first.
    pub async fn execute(
        &self,
        model: &str,
        messages: &[ChatMessage],
        context: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let request = self.build_request(model, messages, context);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => AttemptOutcome::Cancelled,
            result = tokio::time::timeout_at(deadline, self.first_output(&request)) => match result {
                Err(_elapsed) => AttemptOutcome::TimedOut,
                Ok(Err(ProviderError::Timeout)) => AttemptOutcome::TimedOut,
                Ok(Err(e)) => AttemptOutcome::Failed(e),
                Ok(Ok(output)) => AttemptOutcome::Succeeded(output),
            },
        }
    }

    async fn first_output(&self, request: &ChatRequest) -> Result<AttemptOutput, ProviderError> {
        match self.reply_mode {
            ReplyMode::Complete => {
                let reply = self.provider.chat(request).await?;
                if reply.content.trim().is_empty() {
                    return Err(ProviderError::Provider("Empty reply".into()));
                }
                Ok(AttemptOutput::Complete(reply.content))
            }
            ReplyMode::Stream => {
                let mut rest = self.provider.stream_chat(request).await?;
                loop {
                    match rest.recv().await {
                        Some(Ok(chunk)) if chunk.done => {
                            // A stream that opens with its end marker carries
                            // at most this one piece of text.
                            if chunk.content.is_empty() {
                                return Err(ProviderError::Provider(
                                    "Stream finished without content".into(),
                                ));
                            }
                            return Ok(AttemptOutput::Complete(chunk.content));
                        }
                        Some(Ok(chunk)) if chunk.content.is_empty() => continue,
                        Some(Ok(chunk)) => {
                            return Ok(AttemptOutput::Streaming {
                                first: chunk.content,
                                rest,
                            });
                        }
                        Some(Err(e)) => return Err(e),
                        None => {
                            return Err(ProviderError::Network(
                                "Stream closed before any content".into(),
                            ));
                        }
                    }
                }
            }
        }
    }
}
