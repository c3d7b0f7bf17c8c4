//! AI provider trait and implementations.
//!
//! Each provider module exposes a struct that implements [`AiProvider`].

pub(crate) mod openai_sse;
pub mod openrouter;

#[cfg(test)]
pub(crate) mod scripted;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{ChatRequest, ChatResponse, StreamChunk};

/// Receiving half of an incremental reply. The provider closes it after a
/// `done` chunk or an error.
pub type ChunkReceiver = mpsc::Receiver<Result<StreamChunk, ProviderError>>;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that a single provider call may end with. These stay local to one
/// attempt and are only ever logged.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout")]
    Timeout,

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Stream parse error: {0}")]
    Parse(String),

    #[error("Invalid API key")]
    InvalidKey,

    #[error("Rate limited")]
    RateLimit,
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Provider(format!("Malformed response body: {err}"))
        } else {
            Self::Network(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Unified interface for chat completion backends.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Human-readable display name.
    fn name(&self) -> &str;

    /// Whether the provider has what it needs (e.g. a credential) to be called.
    async fn is_available(&self) -> bool;

    /// Non-streaming completion.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Streaming completion -- returns a channel that yields chunks. Dropping
    /// the receiver must release the underlying connection.
    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkReceiver, ProviderError>;
}
