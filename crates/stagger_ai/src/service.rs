//! Chat service -- the entry point the application calls.
//!
//! Picks the latest user message as the lookup query, enriches it with
//! background context, races the configured tiers and hands back either a
//! collected [`ChatReply`] or a live [`OutEvent`] stream.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stagger_core::StaggerConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{ContextEnricher, DuckDuckGoEnricher, NoContext};
use crate::executor::AttemptExecutor;
use crate::providers::openrouter::OpenRouterProvider;
use crate::race::{RaceCoordinator, RacePolicy, RaceRequest};
use crate::relay::{OutEvent, StreamRelay};
use crate::types::{ChatMessage, latest_user_query};

/// `modelUsed` value when no model answered.
pub const NO_MODEL: &str = "none";

/// Non-streaming reply body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub reply: String,
    #[serde(rename = "modelUsed")]
    pub model_used: String,
}

pub struct ChatService {
    executor: AttemptExecutor,
    policy: RacePolicy,
    enricher: Arc<dyn ContextEnricher>,
    busy_message: String,
}

impl ChatService {
    pub fn new(
        executor: AttemptExecutor,
        policy: RacePolicy,
        enricher: Arc<dyn ContextEnricher>,
        busy_message: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            policy,
            enricher,
            busy_message: busy_message.into(),
        }
    }

    /// Wire the OpenRouter provider, the race policy and the context
    /// enricher from configuration.
    pub fn from_config(config: &StaggerConfig) -> Result<Self> {
        let api_key = config.openrouter_api_key.clone().unwrap_or_default();
        let provider = OpenRouterProvider::with_base_url(api_key, config.openrouter_base_url.clone())
            .with_attribution(config.app_title.clone(), config.http_referer.clone());
        let executor = AttemptExecutor::new(Arc::new(provider), config.reply_mode)
            .with_system_prompt(config.system_prompt.clone());

        let policy = RacePolicy::from_config(&config.race).context("Invalid race configuration")?;

        let enricher: Arc<dyn ContextEnricher> = if config.context.enabled {
            Arc::new(DuckDuckGoEnricher::from_config(&config.context)?)
        } else {
            Arc::new(NoContext)
        };

        info!(
            mode = ?policy.mode(),
            reply_mode = ?config.reply_mode,
            tiers = policy.tiers().len(),
            models = policy.model_count(),
            context = config.context.enabled,
            "Chat service ready"
        );
        Ok(Self::new(executor, policy, enricher, config.busy_message.clone()))
    }

    pub fn policy(&self) -> &RacePolicy {
        &self.policy
    }

    pub fn busy_message(&self) -> &str {
        &self.busy_message
    }

    /// Whether the provider can take calls. Logs a warning when it cannot,
    /// since every attempt would then fail.
    pub async fn is_ready(&self) -> bool {
        let ready = self.executor.provider_available().await;
        if !ready {
            warn!(
                provider = self.executor.provider_name(),
                "Provider is not available (is {} set?); every attempt will fail",
                stagger_core::config::API_KEY_ENV
            );
        }
        ready
    }

    /// Race for a complete answer.
    pub async fn reply(&self, messages: Vec<ChatMessage>) -> ChatReply {
        let request = self.prepare(messages).await;
        let result = self
            .coordinator()
            .run(request, CancellationToken::new())
            .await;

        match result.winner {
            Some(model_used) if result.error.is_none() => ChatReply {
                reply: result.answer,
                model_used,
            },
            _ => {
                if let Some(error) = &result.error {
                    debug!(%error, "Reply failed");
                }
                ChatReply {
                    reply: self.busy_message.clone(),
                    model_used: NO_MODEL.into(),
                }
            }
        }
    }

    /// Race and stream the winner's reply as it arrives. Cancelling
    /// `cancel` or dropping the receiver stops the race.
    pub async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<OutEvent> {
        let request = self.prepare(messages).await;
        let events = self.coordinator().subscribe(request, cancel.clone());
        StreamRelay::new(self.busy_message.clone()).spawn(events, cancel)
    }

    async fn prepare(&self, messages: Vec<ChatMessage>) -> RaceRequest {
        let context = match latest_user_query(&messages) {
            Some(query) => self.enricher.lookup(query).await,
            None => String::new(),
        };
        RaceRequest { messages, context }
    }

    fn coordinator(&self) -> RaceCoordinator {
        RaceCoordinator::new(self.executor.clone(), self.policy.clone())
    }
}
