//! Scripted provider for race tests. Each model follows a fixed timeline and
//! every call records when it started and whether its resources were let go.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};

use super::openai_sse::{drive_sse_stream, tests::mock_response};
use super::{AiProvider, ChunkReceiver, ProviderError};
use crate::types::{ChatRequest, ChatResponse, FinishReason, StreamChunk, TokenUsage};

#[derive(Debug, Clone)]
pub(crate) enum Script {
    /// Whole reply after `after`.
    Reply { after: Duration, text: &'static str },
    /// First token after `after`, then one token every `gap`.
    Tokens {
        after: Duration,
        gap: Duration,
        tokens: Vec<&'static str>,
    },
    /// Raw SSE body parts fed through the real decoder after `after`.
    Sse {
        after: Duration,
        parts: Vec<&'static str>,
    },
    Fail { after: Duration, error: ProviderError },
    /// Never answers.
    Hang,
}

/// Flags a call as released when dropped, i.e. when its future or stream
/// driver is gone.
struct ReleaseGuard(Arc<AtomicBool>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CallRecord {
    pub model: String,
    pub started: Instant,
    pub system_prompt: Option<String>,
    released: Arc<AtomicBool>,
}

impl CallRecord {
    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct ScriptedProvider {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<CallRecord>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, model: &str, script: Script) -> Self {
        self.scripts.insert(model.to_string(), script);
        self
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call(&self, model: &str) -> Option<CallRecord> {
        self.calls().into_iter().find(|c| c.model == model)
    }

    fn begin(&self, request: &ChatRequest) -> (Script, ReleaseGuard) {
        let released = Arc::new(AtomicBool::new(false));
        self.calls.lock().unwrap().push(CallRecord {
            model: request.model.clone(),
            started: Instant::now(),
            system_prompt: request.system_prompt.clone(),
            released: released.clone(),
        });
        let script = self
            .scripts
            .get(&request.model)
            .cloned()
            .unwrap_or(Script::Fail {
                after: Duration::ZERO,
                error: ProviderError::Provider(format!("no script for {}", request.model)),
            });
        (script, ReleaseGuard(released))
    }
}

fn response(model: &str, text: String) -> ChatResponse {
    ChatResponse {
        content: text,
        model: model.to_string(),
        usage: TokenUsage::default(),
        finish_reason: FinishReason::Stop,
    }
}

#[async_trait]
impl AiProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "Scripted"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let (script, _guard) = self.begin(request);
        match script {
            Script::Reply { after, text } => {
                sleep(after).await;
                Ok(response(&request.model, text.to_string()))
            }
            Script::Tokens { after, gap, tokens } => {
                sleep(after + gap * tokens.len() as u32).await;
                Ok(response(&request.model, tokens.concat()))
            }
            Script::Sse { .. } => Err(ProviderError::Provider(
                "SSE script requires streaming mode".into(),
            )),
            Script::Fail { after, error } => {
                sleep(after).await;
                Err(error)
            }
            Script::Hang => std::future::pending().await,
        }
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkReceiver, ProviderError> {
        let (script, guard) = self.begin(request);
        let (tx, rx) = mpsc::channel(8);
        match script {
            Script::Reply { after, text } => {
                sleep(after).await;
                tokio::spawn(async move {
                    let _guard = guard;
                    if tx.send(Ok(StreamChunk::text(text))).await.is_ok() {
                        let _ = tx.send(Ok(StreamChunk::finished(None))).await;
                    }
                });
            }
            Script::Tokens { after, gap, tokens } => {
                sleep(after).await;
                tokio::spawn(async move {
                    let _guard = guard;
                    for (i, token) in tokens.into_iter().enumerate() {
                        if i > 0 {
                            tokio::select! {
                                _ = tx.closed() => return,
                                _ = sleep(gap) => {}
                            }
                        }
                        if tx.send(Ok(StreamChunk::text(token))).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Ok(StreamChunk::finished(None))).await;
                });
            }
            Script::Sse { after, parts } => {
                sleep(after).await;
                tokio::spawn(async move {
                    let _guard = guard;
                    drive_sse_stream(mock_response(parts), tx).await;
                });
            }
            Script::Fail { after, error } => {
                sleep(after).await;
                return Err(error);
            }
            Script::Hang => std::future::pending::<()>().await,
        }
        Ok(rx)
    }
}
