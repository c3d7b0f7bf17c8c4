use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stagger_ai::service::NO_MODEL;
use stagger_ai::{ChatMessage, ChatReply, ChatService};
use stagger_core::StaggerConfig;
use stagger_core::logging;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "stagger")]
#[command(about = "Race tiered chat models and answer with whichever replies first", long_about = None)]
#[command(version = VERSION)]
struct Cli {
    /// Print the reply as `data:` frames while it arrives instead of one
    /// JSON object at the end
    #[arg(long)]
    stream: bool,

    /// Config file to use instead of $STAGGER_CONFIG or ~/.stagger/config.json
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Request body read from stdin: `{"messages": [{"role": .., "content": ..}]}`.
#[derive(Debug, Deserialize)]
struct ChatBody {
    messages: Vec<ChatMessage>,
}

fn parse_body(raw: &str) -> Result<Vec<ChatMessage>> {
    let body: ChatBody = serde_json::from_str(raw).context("Request body is not valid JSON")?;
    if body.messages.is_empty() {
        bail!("Request body has no messages");
    }
    Ok(body.messages)
}

async fn read_messages(mut input: impl AsyncRead + Unpin) -> Result<Vec<ChatMessage>> {
    let mut raw = String::new();
    input
        .read_to_string(&mut raw)
        .await
        .context("Failed to read request from stdin")?;
    parse_body(&raw)
}

fn load_config(path: Option<&PathBuf>) -> Result<StaggerConfig> {
    match path {
        Some(path) => {
            let mut config = StaggerConfig::load_from_path(path)?;
            config.apply_env(|name| std::env::var(name).ok());
            Ok(config)
        }
        None => StaggerConfig::load(),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let _log_guard = logging::init_logging(&config.log_level)?;
    info!("Starting Stagger v{VERSION}");

    let messages = read_messages(tokio::io::stdin()).await?;

    let service = ChatService::from_config(&config)?;
    service.is_ready().await;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling request");
                cancel.cancel();
            }
        }
    });

    if cli.stream {
        let mut events = service.stream(messages, cancel).await;
        let mut stdout = tokio::io::stdout();
        while let Some(event) = events.recv().await {
            stdout.write_all(event.to_frame().as_bytes()).await?;
            stdout.flush().await?;
        }
    } else {
        let reply = tokio::select! {
            reply = service.reply(messages) => reply,
            _ = cancel.cancelled() => ChatReply {
                reply: service.busy_message().to_string(),
                model_used: NO_MODEL.into(),
            },
        };
        info!(model = %reply.model_used, "Reply ready");
        println!("{}", serde_json::to_string(&reply)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("stagger: {e:#}");
            ExitCode::FAILURE
        }
    }
}
