//! Command-line client for the streaming completion service.

use std::io::Write as _;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chat_stream::prelude::*;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "chat-stream", version, about = "Stream chat completions from the generation service")]
struct Args {
    /// Service base URL
    #[arg(long, env = "CHAT_STREAM_BASE_URL", value_name = "URL")]
    base_url: Option<String>,

    /// Treat this many seconds without data as a dropped connection
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct ModelArgs {
    /// Model name as known to the service
    #[arg(short, long, env = "CHAT_STREAM_MODEL")]
    model: String,

    /// Persona prompt to answer with
    #[arg(short, long)]
    persona: Option<String>,

    /// Response language
    #[arg(short, long, default_value = "en")]
    language: String,

    /// Ask reasoning models to stream their thinking
    #[arg(long)]
    think: bool,
}

impl ModelArgs {
    fn request(&self, query: impl Into<String>, chat: bool) -> GenerateRequest {
        let mut request = GenerateRequest::new(self.model.clone(), query)
            .language(self.language.clone())
            .chat(chat)
            .think(self.think);
        if let Some(persona) = &self.persona {
            request = request.persona(persona.clone());
        }
        request
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask one question and stream the answer to stdout
    Ask {
        #[command(flatten)]
        model: ModelArgs,

        /// Print the final turn output as JSON instead of the streamed text
        #[arg(long)]
        json: bool,

        /// The question
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
    },
    /// Read questions from stdin, one per line, keeping a transcript
    Chat {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Print the service health document
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    chat_stream::init_observability();
    let args = Args::parse();

    let mut config = ClientConfig::from_env().context("invalid CHAT_STREAM_* settings")?;
    if let Some(base_url) = args.base_url {
        config = config.base_url(base_url);
    }
    if let Some(secs) = args.idle_timeout {
        config = config.idle_timeout(Duration::from_secs(secs));
    }
    let client = ChatClient::builder()
        .config(config)
        .build()
        .context("failed to build client")?;

    match args.command {
        Command::Ask { model, json, query } => {
            let request = model.request(query.join(" "), false);
            let turn = client.start_turn(&request)?;
            let output = follow(turn, !json).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            if let Some(error) = output.error {
                bail!("stream failed: {error}");
            }
        }
        Command::Chat { model } => chat(client, model).await?,
        Command::Health => {
            let doc = client.health().await.context("health check failed")?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }
    Ok(())
}

async fn chat(client: ChatClient, model: ModelArgs) -> Result<()> {
    let mut conversation = Conversation::new(client);
    info!(conversation = %conversation.id(), model = %model.model, "chat started");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        let turn = conversation.send(&model.request(query, true)).await?;
        let output = follow(turn, true).await?;
        if let Some(error) = &output.error {
            eprintln!("error: {error}");
        }
        conversation.record(&output);
    }
    info!(messages = conversation.history().len(), "chat ended");
    Ok(())
}

/// Streams a turn's text to stdout until it ends. Ctrl-C cancels the turn.
async fn follow(mut turn: TurnStream, echo: bool) -> Result<TurnOutput> {
    let abort = turn.abort_handle();
    let mut stdout = std::io::stdout();
    loop {
        let update = tokio::select! {
            update = turn.next_update() => update,
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                abort.abort();
                continue;
            }
        };
        let Some(update) = update else { break };
        match update {
            TurnUpdate::Event(event) if echo => {
                if let Some(text) = visible_text(&event) {
                    write!(stdout, "{text}")?;
                    stdout.flush()?;
                }
            }
            TurnUpdate::Retrying(notice) => eprintln!(
                "\nconnection lost ({}); retry {}/{} in {:?}",
                notice.reason, notice.attempt, notice.max_retries, notice.delay
            ),
            TurnUpdate::Completed { .. } | TurnUpdate::Cancelled if echo => writeln!(stdout)?,
            _ => {}
        }
    }
    Ok(turn.finish().await?)
}

fn visible_text(event: &StreamEvent) -> Option<String> {
    match event.kind() {
        EventKind::Token => event
            .payload::<TokenPayload>()
            .text()
            .or(event.data.as_raw())
            .map(ToOwned::to_owned),
        EventKind::CodeToken => event
            .payload::<chat_stream::event::CodeTokenPayload>()
            .token,
        _ => None,
    }
}
