//! chai: terminal client for chai real-time chat.
//!
//! Mounts a channel for one conversation, prints messages from other users
//! to stdout and sends each stdin line as a message. Logs go to stderr.
//!
//!   /reconnect   mount again after retries are exhausted
//!   /quit        leave

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chai_sdk::{
    CachedCredentialStore, Channel, CredentialPair, CredentialStore, Event, HttpRefresher,
    OutgoingMessage, WsConnector,
};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

mod config;

use config::{Config, Resolved};

#[derive(Parser, Debug)]
#[command(name = "chai", about = "Terminal client for chai real-time chat")]
pub struct Cli {
    /// Socket endpoint (e.g. wss://chat.example.com/ws)
    #[arg(long, env = "CHAI_ENDPOINT")]
    endpoint: Option<String>,

    /// HTTP API base URL used for token refresh
    #[arg(long, env = "CHAI_API_URL")]
    api_url: Option<String>,

    /// Reconnect attempts after the first connection fails
    #[arg(long)]
    retry_attempts: Option<u32>,

    /// Delay between reconnect attempts, in milliseconds
    #[arg(long)]
    retry_interval_ms: Option<u64>,

    /// Stored credential file (default: ~/.config/chai/user.json)
    #[arg(long, env = "CHAI_CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// Import a credential pair from this JSON file before connecting
    #[arg(long)]
    import: Option<PathBuf>,

    /// Conversation that stdin lines are sent to
    #[arg(long, short)]
    conversation: Option<i64>,

    /// Write the effective settings to the config file
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chai_cli=info,chai_sdk=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let resolved = Resolved::merge(&cli, &Config::load());
    if cli.save_config {
        let path = config::config_path();
        resolved.to_config().save_to(&path)?;
        tracing::info!(path = %path.display(), "Saved config");
    }

    let refresher = Arc::new(HttpRefresher::new(resolved.api_url.clone()));
    let store = CachedCredentialStore::open(&resolved.credentials, refresher).with_context(|| {
        format!("can't open credentials at {}", resolved.credentials.display())
    })?;
    let store = Arc::new(store);
    if let Some(import) = &cli.import {
        let raw = std::fs::read_to_string(import)
            .with_context(|| format!("can't read {}", import.display()))?;
        let user: CredentialPair = serde_json::from_str(&raw).context("bad credential file")?;
        tracing::info!(user_id = user.id, "Imported credentials");
        store.replace(Some(user))?;
    }
    let Some(user) = store.user() else {
        anyhow::bail!(
            "not signed in: no credentials at {} (use --import)",
            resolved.credentials.display()
        );
    };

    tracing::info!(endpoint = %resolved.endpoint, user_id = user.id, "Mounting channel");
    let (channel, mut events) = Channel::mount(
        resolved.connect_params(),
        store.clone(),
        Arc::new(WsConnector::new()),
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                match line {
                    "" => {}
                    "/quit" => break,
                    "/reconnect" => channel.remount(),
                    text => send_line(&channel, store.as_ref(), cli.conversation, text),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    channel.unmount();
    Ok(())
}

fn send_line(
    channel: &Channel,
    store: &dyn CredentialStore,
    conversation: Option<i64>,
    text: &str,
) {
    let Some(conversation_id) = conversation else {
        tracing::warn!("No --conversation given, not sending");
        return;
    };
    let Some(user) = store.user() else {
        tracing::warn!("Signed out, not sending");
        return;
    };
    let sent = channel.send(&OutgoingMessage {
        content: text.to_string(),
        user_id: user.id,
        conversation_id,
    });
    if !sent {
        tracing::warn!("Not connected, message dropped");
    }
}

fn print_event(event: &Event) {
    match event {
        Event::Message(msg) => {
            println!(
                "[{}] #{} <{}> {}",
                msg.created_at, msg.conversation_id, msg.user_id, msg.content
            );
        }
        Event::Connected { socket } => tracing::info!(%socket, "Connected"),
        Event::Disconnected { code } => tracing::info!(code, "Disconnected"),
        Event::ServerInfo(text) => tracing::info!(info = %text, "Server"),
        Event::ServerError(text) => tracing::warn!(error = %text, "Server"),
        Event::Unrecognized(_) => {}
        Event::RetryScheduled { attempt, delay } => {
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting")
        }
        Event::RetriesExhausted { attempts } => {
            tracing::warn!(attempts, "Gave up reconnecting, type /reconnect to try again")
        }
        Event::Renewed => tracing::info!("Credentials renewed"),
        Event::RenewalFailed { reason } => tracing::warn!(%reason, "Credential renewal failed"),
    }
}
