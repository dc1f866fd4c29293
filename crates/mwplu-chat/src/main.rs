//! Line-oriented terminal client for MWPLU document chat.

mod printer;

use anyhow::Context;
use clap::Parser;
use log::{debug, info, warn};
use mwplu_chat::config::ChatConfig;
use mwplu_chat::core::{
    ChatError, ChatPersistence, ChatSession, EventBus, HttpWebhookClient, InMemoryPersistence,
    JsonlPersistence, TurnOutcome, TurnReconciler,
};
use mwplu_chat::protocol::Role;
use printer::ReplyPrinter;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Command-line options for the chat client.
#[derive(Parser)]
#[command(name = "mwplu-chat", version)]
struct Cli {
    /// Document the conversation is about
    #[arg(long)]
    document: String,
    /// Authenticated user id
    #[arg(long, env = "MWPLU_USER_ID")]
    user: String,
    /// Optional path to a mwplu-chat.json5 config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory for the JSONL conversation store (overrides storage.path)
    #[arg(long)]
    store: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mwplu_chat::init_logging();

    let cli = Cli::parse();
    info!(
        "starting chat client (document_id={}, config_set={}, store_set={})",
        cli.document,
        cli.config.is_some(),
        cli.store.is_some()
    );
    let config = load_config(&cli)?;
    config.validate().context("invalid config")?;

    let persistence = build_persistence(&cli, &config)?;
    let bus = Arc::new(EventBus::default());
    let session = Arc::new(
        ChatSession::with_event_sink(persistence, bus.clone()).with_messages(config.messages.clone()),
    );
    session.set_user(Some(cli.user.clone()));

    let resumed = session
        .initialize(&cli.document)
        .await
        .context("failed to load conversation")?;
    if resumed {
        print_history(&session);
    }

    let transport =
        Arc::new(HttpWebhookClient::from_config(&config).context("failed to build webhook client")?);
    let reconciler = TurnReconciler::from_config(&config, session.clone(), transport);
    let printer = spawn_printer(bus.subscribe());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/clear" => {
                if let Err(err) = session.clear_chat().await {
                    eprintln!("{err}");
                }
                continue;
            }
            _ => {}
        }
        match reconciler.send_message(line, Some(&cli.document)).await {
            Ok(report) => {
                if let TurnOutcome::Unconfirmed { message_id } = &report.outcome {
                    warn!("reply shown but not confirmed (message_id={})", message_id);
                }
                debug!(
                    "turn finished (user_message_id={}, outcome={:?})",
                    report.user_message_id, report.outcome
                );
            }
            Err(ChatError::Validation(err)) => eprintln!("{err}"),
            // Rendered into the conversation already.
            Err(err) => debug!("turn failed: {}", err),
        }
    }

    drop(reconciler);
    drop(session);
    drop(bus);
    let _ = printer.await;
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<ChatConfig> {
    if let Some(path) = cli.config.as_ref() {
        return ChatConfig::load_from_path(path).context("failed to load config");
    }
    let cwd = std::env::current_dir().context("cwd")?;
    info!("loading layered config from cwd: {}", cwd.display());
    let layered = ChatConfig::load_layered(&cwd).context("failed to load layered config")?;
    debug!("layered config loaded (layers={})", layered.layers.len());
    Ok(layered.config)
}

fn build_persistence(cli: &Cli, config: &ChatConfig) -> anyhow::Result<Arc<dyn ChatPersistence>> {
    let root = cli
        .store
        .clone()
        .or_else(|| config.storage.path.as_ref().map(PathBuf::from));
    match root {
        Some(root) => {
            info!("using jsonl store (root={})", root.display());
            let store = JsonlPersistence::new(&root).context("failed to open conversation store")?;
            Ok(Arc::new(store))
        }
        None => {
            info!("no storage path configured, conversations are kept in memory");
            Ok(Arc::new(InMemoryPersistence::new()))
        }
    }
}

fn print_history(session: &ChatSession) {
    for message in session.messages() {
        let label = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        println!("{label}: {}", message.message);
    }
}

fn spawn_printer(mut events: broadcast::Receiver<mwplu_chat::protocol::ChatEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut printer = ReplyPrinter::new();
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(text) = printer.render(&event) {
                        let mut stdout = std::io::stdout().lock();
                        let _ = stdout.write_all(text.as_bytes());
                        let _ = stdout.flush();
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("printer lagged behind (skipped={})", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
