use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable holding the OpenRouter bearer credential.
pub const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "STAGGER_CONFIG";

// ---------------------------------------------------------------------------
// Race settings
// ---------------------------------------------------------------------------

/// How tiers are launched relative to attempts that are still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaceMode {
    /// Every tier starts at its stagger delay, alongside anything still running.
    #[default]
    Race,
    /// One model at a time, in priority order.
    Sequential,
}

/// Which provider reply format attempts request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    /// Incremental SSE deltas.
    #[default]
    Stream,
    /// One complete JSON body.
    Complete,
}

/// A named group of models sharing one launch delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub stagger_ms: u64,
    pub models: Vec<String>,
}

impl TierConfig {
    pub fn new(name: &str, stagger_ms: u64, models: &[&str]) -> Self {
        Self {
            name: name.into(),
            stagger_ms,
            models: models.iter().map(|m| m.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    pub mode: RaceMode,
    /// Time allowed for an attempt to produce its first usable output.
    pub attempt_timeout_ms: u64,
    /// Hard ceiling on the whole request, delivery included.
    pub request_deadline_ms: u64,
    pub tiers: Vec<TierConfig>,
}

impl RaceConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            mode: RaceMode::Race,
            attempt_timeout_ms: 6_000,
            request_deadline_ms: 30_000,
            tiers: default_tiers(),
        }
    }
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig::new(
            "fast",
            0,
            &[
                "stepfun/step-3.5-flash:free",
                "nvidia/nemotron-nano-9b-v2:free",
                "google/gemma-3-4b-it:free",
                "meta-llama/llama-3.2-3b-instruct:free",
                "qwen/qwen3-4b:free",
            ],
        ),
        TierConfig::new(
            "balanced",
            2_000,
            &[
                "google/gemma-3-12b-it:free",
                "mistralai/mistral-small-3.1-24b-instruct:free",
                "z-ai/glm-4.5-air:free",
                "upstage/solar-pro-3:free",
                "nvidia/nemotron-3-nano-30b-a3b:free",
            ],
        ),
        TierConfig::new(
            "heavy",
            4_000,
            &[
                "deepseek/deepseek-r1-0528:free",
                "meta-llama/llama-3.3-70b-instruct:free",
                "nousresearch/hermes-3-llama-3.1-405b:free",
                "qwen/qwen3-next-80b-a3b-instruct:free",
                "openai/gpt-oss-120b:free",
            ],
        ),
    ]
}

// ---------------------------------------------------------------------------
// Context lookup settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub enabled: bool,
    pub base_url: String,
    pub timeout_ms: u64,
    /// Maximum number of related-topic snippets appended after the abstract.
    pub max_topics: usize,
}

impl ContextConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.duckduckgo.com".into(),
            timeout_ms: 2_500,
            max_topics: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// StaggerConfig
// ---------------------------------------------------------------------------

/// Application configuration stored at `~/.stagger/config.json`.
///
/// The OpenRouter credential is **never** written to disk. It is read from
/// the `OPENROUTER_API_KEY` environment variable at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StaggerConfig {
    #[serde(skip)]
    pub openrouter_api_key: Option<String>,

    // Provider
    pub openrouter_base_url: String,
    pub app_title: String,
    pub http_referer: Option<String>,
    pub reply_mode: ReplyMode,

    // Prompting
    /// System prompt template; `{context}` is replaced with the lookup result.
    pub system_prompt: String,
    /// The only failure text a caller ever sees.
    pub busy_message: String,

    pub context: ContextConfig,
    pub race: RaceConfig,

    // General
    pub log_level: String,
}

impl Default for StaggerConfig {
    fn default() -> Self {
        Self {
            openrouter_api_key: None,
            openrouter_base_url: "https://openrouter.ai/api/v1".into(),
            app_title: "Stagger".into(),
            http_referer: None,
            reply_mode: ReplyMode::Stream,
            system_prompt: "You are Stagger. Use this context if helpful: {context}".into(),
            busy_message: "All models are busy. Please retry in a moment.".into(),
            context: ContextConfig::default(),
            race: RaceConfig::default(),
            log_level: "info".into(),
        }
    }
}

impl StaggerConfig {
    /// Returns the base config directory: `~/.stagger/`
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".stagger"))
    }

    /// Returns the config file path, honouring `STAGGER_CONFIG`.
    pub fn config_path() -> Result<PathBuf> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => Ok(Self::base_dir()?.join("config.json")),
        }
    }

    /// Returns the logs directory: `~/.stagger/logs/`
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Loads config from disk (creating the default file if missing) and
    /// fills the credential from the process environment.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from_path(&path)?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load config from a specific file path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let config: Self = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to_path(path)?;
            info!("Created default config at {}", path.display());
            Ok(config)
        }
    }

    /// Save config to a specific file path (the credential is excluded via
    /// `#[serde(skip)]`).
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory: {}", parent.display())
                })?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Overlay values that only ever come from the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(API_KEY_ENV) {
            let key = key.trim();
            if !key.is_empty() {
                self.openrouter_api_key = Some(key.to_string());
            }
        }
    }
}
