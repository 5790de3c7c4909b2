//! appbuild: build and iterate on apps with the app.build agent.
//!
//!   appbuild send <message>     Send a message and follow the agent's reply
//!   appbuild history <app-id>   Show an application's stored conversation
//!   appbuild replay <file>      Decode a captured event stream offline

mod config;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use appbuild_sdk::client::{AgentClient, Environment, SendMessage};
use appbuild_sdk::conversation::{ConversationStore, CorrelationError, Ingested, Thread};
use appbuild_sdk::debug::TracingSink;
use appbuild_sdk::event::AgentEvent;
use appbuild_sdk::phase::{ChatState, GroupStatus, PhaseView};
use appbuild_sdk::sse::{SseDecoder, StreamEnd, StreamError, StreamHandler};
use appbuild_sdk::TraceId;
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufRead;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Session};

#[derive(Parser)]
#[command(name = "appbuild", about = "Build apps with the app.build agent")]
struct Cli {
    /// Backend URL
    #[arg(long, env = "APPBUILD_SERVER", global = true)]
    server: Option<String>,

    /// Bearer token (or set APPBUILD_TOKEN)
    #[arg(long, env = "APPBUILD_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Deployment environment: staging or production
    #[arg(long, global = true)]
    environment: Option<Environment>,

    /// Request timeout in seconds [default: 600]
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a message and follow the reply stream
    Send {
        message: String,
        /// Application to continue (defaults to the saved session)
        #[arg(long)]
        app_id: Option<String>,
        /// Trace to continue (defaults to the saved session)
        #[arg(long)]
        trace_id: Option<String>,
        /// Start a new application instead of continuing the session
        #[arg(long)]
        new: bool,
    },
    /// Print an application's stored history
    History { app_id: String },
    /// Decode a captured SSE transcript without contacting the server
    Replay { file: PathBuf },
}

/// Files each event and prints the ones that made it into a log.
struct Printer<W> {
    store: ConversationStore,
    out: W,
}

impl<W: Write> StreamHandler for Printer<W> {
    fn on_message(&mut self, event: AgentEvent) -> Result<(), CorrelationError> {
        let line = event_line(&event);
        if let Ingested::Filed(_) = self.store.ingest(event)? {
            if let Some(line) = line {
                writeln!(self.out, "{line}").ok();
            }
        }
        Ok(())
    }

    fn on_error(&mut self, error: &StreamError) {
        if !error.is_terminal() {
            eprintln!("warning: {error}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "appbuild=info,appbuild_sdk=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load();

    match &cli.command {
        Command::Send {
            message,
            app_id,
            trace_id,
            new,
        } => {
            let request = SendMessage::new(message.as_str());
            let request = match (explicit_thread(app_id.as_deref(), trace_id.as_deref()), app_id) {
                _ if *new => request,
                (Some(thread), _) => request.on_thread(&thread),
                (None, Some(app_id)) => SendMessage {
                    application_id: Some(app_id.clone()),
                    ..request
                },
                (None, None) => match Session::load().thread() {
                    Some(thread) => request.on_thread(&thread),
                    None => request,
                },
            };
            send(&cli, &config, request).await
        }
        Command::History { app_id } => history(&cli, &config, app_id).await,
        Command::Replay { file } => replay(file).await,
    }
}

fn explicit_thread(app_id: Option<&str>, trace_id: Option<&str>) -> Option<Thread> {
    match (app_id, trace_id) {
        (Some(app), Some(trace)) => Some(Thread {
            application_id: app.to_string(),
            trace_id: TraceId::from(trace),
        }),
        (None, Some(trace)) => {
            let trace = TraceId::from(trace);
            Some(Thread {
                application_id: trace.application_id()?.to_string(),
                trace_id: trace,
            })
        }
        _ => None,
    }
}

async fn send(cli: &Cli, config: &Config, request: SendMessage) -> Result<()> {
    let client = AgentClient::new(config::resolve(cli, config)).context("Failed to build HTTP client")?;
    let store = ConversationStore::new();

    if let Some(trace_id) = &request.trace_id {
        if let Err(e) = store.ingest(AgentEvent::user(trace_id.clone(), &request.message)) {
            tracing::warn!(error = %e, "not echoing message");
        }
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let mut printer = Printer {
        store: store.clone(),
        out: std::io::stdout(),
    };
    let outcome = client
        .send_message(&request, &mut printer, cancel)
        .await
        .context("Message failed")?;

    if let Some(limit) = &outcome.limit {
        println!("Messages left today: {}/{}", limit.remaining, limit.limit);
    }
    if outcome.end == StreamEnd::Cancelled {
        println!("Cancelled.");
    }

    let Some(last) = store.last_thread() else {
        println!("The agent sent nothing.");
        return Ok(());
    };
    let mut session = Session::load();
    session.remember(&last);
    session.save();

    let view = store.phase_view(&last.application_id);
    println!();
    print_view(&last.application_id, &view);
    print_next_step(ChatState::derive(
        &view,
        store.is_running(&last.application_id),
        true,
    ));
    Ok(())
}

async fn history(cli: &Cli, config: &Config, app_id: &str) -> Result<()> {
    let client = AgentClient::new(config::resolve(cli, config)).context("Failed to build HTTP client")?;
    let events = client
        .app_history(app_id)
        .await
        .with_context(|| format!("Failed to fetch history for {app_id}"))?;

    let store = ConversationStore::new();
    for event in events {
        if let Err(e) = store.ingest(event) {
            tracing::warn!(error = %e, "skipping history entry");
        }
    }
    print_view(app_id, &store.phase_view(app_id));
    Ok(())
}

async fn replay(file: &Path) -> Result<()> {
    let input = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("Failed to open {}", file.display()))?;

    let store = replay_stream(tokio::io::BufReader::new(input), std::io::stdout()).await?;

    for app_id in store.application_ids() {
        println!();
        print_view(&app_id, &store.phase_view(&app_id));
    }
    Ok(())
}

/// Decode a transcript into a fresh store, printing events as they are filed.
async fn replay_stream<R, W>(reader: R, out: W) -> Result<ConversationStore>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let store = ConversationStore::new();
    let mut printer = Printer {
        store: store.clone(),
        out,
    };
    let decoder = SseDecoder::new(Arc::new(TracingSink));
    let end = decoder
        .parse(reader, &mut printer)
        .await
        .context("Replay failed")?;
    tracing::info!(?end, "replay finished");
    Ok(store)
}

fn event_line(event: &AgentEvent) -> Option<String> {
    let text = event.text();
    if text.is_empty() {
        return None;
    }
    Some(format!("[{}] {text}", event.kind()))
}

fn print_view(app_id: &str, view: &PhaseView) {
    println!("── app {app_id} ──");
    for (i, group) in view.groups.iter().enumerate() {
        let marker = match view.group_status(i) {
            GroupStatus::Running => "…",
            GroupStatus::Done => "✓",
        };
        println!("{marker} {}", group.title());
        for event in &group.events {
            for line in event.text().lines() {
                println!("    {line}");
            }
        }
    }
}

fn print_next_step(state: ChatState) {
    match state {
        ChatState::RefinementRequested => {
            println!("The agent is waiting for your answer: appbuild send \"<reply>\"")
        }
        ChatState::IterationReady | ChatState::Completed => {
            println!("Ready for changes: appbuild send \"<what to change>\"")
        }
        ChatState::Error => println!("The agent hit an error. Send a message to retry."),
        ChatState::Building => println!("The agent is still working."),
        ChatState::Initial => {}
    }
}
