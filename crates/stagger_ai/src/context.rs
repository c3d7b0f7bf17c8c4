//! Context enrichment -- a best-effort background snippet for the system
//! prompt. Lookups never fail the request; anything that goes wrong yields an
//! empty string.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use stagger_core::ContextConfig;
use tracing::{debug, warn};
use url::Url;

#[async_trait]
pub trait ContextEnricher: Send + Sync {
    /// Background text for `query`, or `""` when none is available.
    async fn lookup(&self, query: &str) -> String;
}

/// Enricher that never adds context.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContext;

#[async_trait]
impl ContextEnricher for NoContext {
    async fn lookup(&self, _query: &str) -> String {
        String::new()
    }
}

// ---------------------------------------------------------------------------
// DuckDuckGo Instant Answer
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstantAnswer {
    #[serde(default)]
    abstract_text: String,
    #[serde(default)]
    related_topics: Vec<RelatedTopic>,
}

/// Either a plain topic (with `Text`) or a named group of topics (without).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RelatedTopic {
    #[serde(default)]
    text: Option<String>,
}

impl InstantAnswer {
    fn into_context(self, max_topics: usize) -> String {
        let abstract_text = self.abstract_text.trim().to_string();
        let topics = self
            .related_topics
            .into_iter()
            .filter_map(|t| t.text)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .take(max_topics);

        std::iter::once(abstract_text)
            .filter(|a| !a.is_empty())
            .chain(topics)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn parse_instant_answer(body: &str, max_topics: usize) -> Result<String> {
    let answer: InstantAnswer =
        serde_json::from_str(body).context("Malformed instant answer response")?;
    Ok(answer.into_context(max_topics))
}

/// Looks the latest user query up in the DuckDuckGo Instant Answer API.
pub struct DuckDuckGoEnricher {
    client: reqwest::Client,
    endpoint: Url,
    max_topics: usize,
}

impl DuckDuckGoEnricher {
    pub fn new(base_url: &str, timeout: Duration, max_topics: usize) -> Result<Self> {
        let endpoint = Url::parse(base_url)
            .with_context(|| format!("Invalid context lookup URL: {base_url}"))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build context lookup client")?;
        Ok(Self {
            client,
            endpoint,
            max_topics,
        })
    }

    pub fn from_config(config: &ContextConfig) -> Result<Self> {
        Self::new(&config.base_url, config.timeout(), config.max_topics)
    }

    fn request_url(&self, query: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("format", "json")
            .append_pair("no_html", "1");
        url
    }

    async fn fetch(&self, query: &str) -> Result<String> {
        let resp = self
            .client
            .get(self.request_url(query))
            .send()
            .await
            .context("Context lookup request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("Context lookup returned {}", resp.status());
        }
        let body = resp
            .text()
            .await
            .context("Failed to read context lookup body")?;
        parse_instant_answer(&body, self.max_topics)
    }
}

#[async_trait]
impl ContextEnricher for DuckDuckGoEnricher {
    async fn lookup(&self, query: &str) -> String {
        let query = query.trim();
        if query.is_empty() {
            return String::new();
        }
        match self.fetch(query).await {
            Ok(context) => {
                debug!(chars = context.len(), "Context lookup finished");
                context
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Context lookup failed, continuing without it");
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abstract_then_limited_topics() {
        let body = r#"{
            "AbstractText": "Rust is a general-purpose programming language.",
            "RelatedTopics": [
                {"Text": "Rust (fungus)", "FirstURL": "https://duckduckgo.com/Rust_(fungus)"},
                {"Name": "Games", "Topics": [{"Text": "Rust (video game)"}]},
                {"Text": "  "},
                {"Text": "Iron oxide"},
                {"Text": "Cargo"},
                {"Text": "Corrosion"}
            ]
        }"#;
        let context = parse_instant_answer(body, 3).unwrap();
        assert_eq!(
            context,
            "Rust is a general-purpose programming language.\nRust (fungus)\nIron oxide\nCargo"
        );
    }

    #[test]
    fn empty_answer_is_empty_context() {
        assert_eq!(parse_instant_answer("{}", 3).unwrap(), "");
        assert_eq!(
            parse_instant_answer(r#"{"AbstractText": "", "RelatedTopics": []}"#, 3).unwrap(),
            ""
        );
    }

    #[test]
    fn topics_only_when_abstract_missing() {
        let body = r#"{"AbstractText": "", "RelatedTopics": [{"Text": "Only topic"}]}"#;
        assert_eq!(parse_instant_answer(body, 3).unwrap(), "Only topic");
    }

    #[test]
    fn malformed_body_is_an_error() {
        assert!(parse_instant_answer("<html>", 3).is_err());
    }

    #[test]
    fn request_url_encodes_the_query() {
        let enricher =
            DuckDuckGoEnricher::new("https://api.duckduckgo.com", Duration::from_secs(1), 3)
                .unwrap();
        let url = enricher.request_url("what is rust & cargo?");
        assert_eq!(url.host_str(), Some("api.duckduckgo.com"));
        assert_eq!(url.path(), "/");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("q".to_string(), "what is rust & cargo?".to_string()),
                ("format".to_string(), "json".to_string()),
                ("no_html".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        assert!(DuckDuckGoEnricher::new("not a url", Duration::from_secs(1), 3).is_err());
    }

    #[tokio::test]
    async fn unreachable_service_yields_empty_context() {
        let enricher =
            DuckDuckGoEnricher::new("http://127.0.0.1:9", Duration::from_millis(500), 3).unwrap();
        assert_eq!(enricher.lookup("rust").await, "");
    }

    #[tokio::test]
    async fn blank_query_skips_the_lookup() {
        let enricher =
            DuckDuckGoEnricher::new("http://127.0.0.1:9", Duration::from_millis(500), 3).unwrap();
        assert_eq!(enricher.lookup("   ").await, "");
        assert_eq!(NoContext.lookup("rust").await, "");
    }
}
