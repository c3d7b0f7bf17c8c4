//! Shared SSE parsing for OpenAI-compatible chat completion streams.
//!
//! OpenRouter speaks the OpenAI wire format:
//!
//! ```text
//! : OPENROUTER PROCESSING
//! data: {"id":"...","choices":[{"delta":{"content":"Hello"},...}]}
//! data: {"id":"...","choices":[{"delta":{"content":" world"},...}]}
//! data: [DONE]
//! ```
//!
//! Network chunks do not line up with frames, so raw bytes are buffered and
//! split on `\n` before they are decoded. The driver forwards deltas as
//! [`StreamChunk`]s and stops reading (dropping the response, and with it the
//! connection) the moment its receiver goes away.

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::ProviderError;
use crate::types::{StreamChunk, TokenUsage};

// ---------------------------------------------------------------------------
// Wire types (deserialization only)
// ---------------------------------------------------------------------------

/// Top-level SSE JSON frame from `/chat/completions` (streaming).
#[derive(Debug, Deserialize)]
pub(crate) struct SseFrame {
    #[serde(default)]
    pub choices: Vec<SseChoice>,
    pub usage: Option<SseUsage>,
    /// OpenRouter reports mid-stream upstream failures in-band.
    pub error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SseChoice {
    pub delta: Option<SseDelta>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SseDelta {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SseUsage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl SseUsage {
    pub fn into_usage(self) -> TokenUsage {
        let p = self.prompt_tokens.unwrap_or(0);
        let c = self.completion_tokens.unwrap_or(0);
        TokenUsage {
            prompt_tokens: p,
            completion_tokens: c,
            total_tokens: self.total_tokens.unwrap_or(p + c),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireError {
    pub message: Option<String>,
    pub code: Option<serde_json::Value>,
}

impl WireError {
    pub fn describe(&self) -> String {
        let message = self.message.as_deref().unwrap_or("unknown upstream error");
        match &self.code {
            Some(code) => format!("{message} (code {code})"),
            None => message.to_string(),
        }
    }
}

/// Non-streaming response from `/chat/completions` with `stream: false`.
/// `choices` is required: a body without it is a provider error.
#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub model: String,
    pub usage: Option<SseUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompletionChoice {
    pub message: CompletionMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompletionMessage {
    pub content: Option<String>,
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Reassembles lines from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Pop the next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(decode_line(&raw[..raw.len() - 1]))
    }

    /// Whatever is left once the byte stream has ended.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// What a single SSE line amounts to.
#[derive(Debug, PartialEq)]
pub(crate) enum SseLine {
    /// Blank line, comment, or a field we do not use.
    Skip,
    Delta {
        content: String,
        usage: Option<TokenUsage>,
    },
    Done,
}

pub(crate) fn parse_line(line: &str) -> Result<SseLine, ProviderError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(SseLine::Skip);
    }
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim_start();

    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let frame: SseFrame = serde_json::from_str(data)
        .map_err(|e| ProviderError::Parse(format!("{e} -- data: {data}")))?;

    if let Some(err) = frame.error {
        return Err(ProviderError::Provider(err.describe()));
    }

    // Empty on role-only deltas.
    let content = frame
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .unwrap_or_default();

    Ok(SseLine::Delta {
        content,
        usage: frame.usage.map(SseUsage::into_usage),
    })
}

// ---------------------------------------------------------------------------
// SSE stream driver
// ---------------------------------------------------------------------------

enum Flow {
    Continue,
    Stop,
}

/// Consume a `reqwest::Response` that returns SSE-formatted chat completion
/// deltas and forward them on `tx`. The last item sent is either a `done`
/// chunk or an error; a byte stream that ends without `[DONE]` is a parse
/// error.
///
/// This function is meant to be spawned via `tokio::spawn`.
pub(crate) async fn drive_sse_stream(
    resp: reqwest::Response,
    tx: mpsc::Sender<Result<StreamChunk, ProviderError>>,
) {
    let mut stream = resp.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut usage: Option<TokenUsage> = None;

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                debug!("SSE receiver dropped; releasing connection");
                return;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(bytes)) => lines.push(&bytes),
            Some(Err(e)) => {
                warn!("SSE stream read error: {e}");
                let _ = tx.send(Err(ProviderError::from(e))).await;
                return;
            }
            None => break,
        }

        while let Some(line) = lines.next_line() {
            if let Flow::Stop = forward_line(&line, &mut usage, &tx).await {
                return;
            }
        }
    }

    if let Some(line) = lines.take_remainder() {
        if let Flow::Stop = forward_line(&line, &mut usage, &tx).await {
            return;
        }
    }

    let _ = tx
        .send(Err(ProviderError::Parse(
            "stream ended without [DONE]".into(),
        )))
        .await;
}

async fn forward_line(
    line: &str,
    usage: &mut Option<TokenUsage>,
    tx: &mpsc::Sender<Result<StreamChunk, ProviderError>>,
) -> Flow {
    match parse_line(line) {
        Ok(SseLine::Skip) => Flow::Continue,
        Ok(SseLine::Done) => {
            let _ = tx.send(Ok(StreamChunk::finished(usage.take()))).await;
            Flow::Stop
        }
        Ok(SseLine::Delta {
            content,
            usage: frame_usage,
        }) => {
            if frame_usage.is_some() {
                *usage = frame_usage;
            }
            if content.is_empty() {
                return Flow::Continue;
            }
            match tx.send(Ok(StreamChunk::text(content))).await {
                Ok(()) => Flow::Continue,
                Err(_) => Flow::Stop, // receiver dropped
            }
        }
        Err(e) => {
            debug!("Rejecting SSE line: {e}");
            let _ = tx.send(Err(e)).await;
            Flow::Stop
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
