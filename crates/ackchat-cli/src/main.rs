use ackchat::client::ChatClient;
use ackchat::protocol::ConversationStatus;
use ackchat::ui::{ChannelUi, UiEvent};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "ackchat", version, about = "ackchat terminal client")]
struct Cli {
    /// Server address (host:port).
    #[arg(long, default_value = "127.0.0.1:50000")]
    server: String,
    /// User name to log in as.
    #[arg(long)]
    name: String,
    /// Log protocol traffic to stderr.
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "ackchat=debug" } else { "ackchat=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let (ui, mut events) = ChannelUi::new();
    let client = ChatClient::connect(&cli.server, &cli.name, Arc::new(ui)).await?;
    client.login()?;
    wait_for_login(&mut events).await?;
    println!("logged in as {}; type messages, /quit to leave", cli.name);

    chat_loop(&client, &mut events).await
}

async fn wait_for_login(events: &mut mpsc::UnboundedReceiver<UiEvent>) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            UiEvent::LoginComplete => return Ok(()),
            UiEvent::Error { text, code, .. } => bail!("{text} (code {code})"),
            other => print_event(&other),
        }
    }
    bail!("connection closed before login completed")
}

async fn chat_loop(
    client: &ChatClient,
    events: &mut mpsc::UnboundedReceiver<UiEvent>,
) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    // Lines typed while the previous message is still unconfirmed.
    let mut pending: VecDeque<String> = VecDeque::new();
    let mut locked = false;

    loop {
        tokio::select! {
            line = stdin.next_line(), if stdin_open => {
                match line.context("failed to read stdin")? {
                    Some(line) if line.trim() == "/quit" => {
                        stdin_open = false;
                        pending.push_back(line);
                    }
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => pending.push_back(line),
                    None => {
                        stdin_open = false;
                        pending.push_back("/quit".to_string());
                    }
                }
            }
            event = events.recv() => {
                let Some(event) = event else { return Ok(()) };
                match event {
                    UiEvent::Lock(l) => locked = l,
                    UiEvent::LogoutComplete => {
                        println!("logged out");
                        return Ok(());
                    }
                    UiEvent::Error { text, code, .. } => bail!("{text} (code {code})"),
                    other => print_event(&other),
                }
            }
        }

        if !locked && client.status() == ConversationStatus::Registered {
            if let Some(line) = pending.pop_front() {
                if line.trim() == "/quit" {
                    pending.clear();
                    client.logout()?;
                } else {
                    client.send_message(&line)?;
                    locked = true;
                }
            }
        }
    }
}

fn print_event(event: &UiEvent) {
    match event {
        UiEvent::MessageLine { sender, text } => println!("{sender}: {text}"),
        UiEvent::ClientList(names) => println!("* members: {}", names.join(", ")),
        UiEvent::LastServerTime(nanos) => {
            tracing::debug!(server_time_us = nanos / 1_000, "request completed");
        }
        UiEvent::Statistics(stats) => println!(
            "* {} events received, {} confirmed ({} chat, {} login, {} logout)",
            stats.events_received,
            stats.confirms_sent,
            stats.chat_events,
            stats.login_events,
            stats.logout_events
        ),
        UiEvent::LoginComplete | UiEvent::LogoutComplete | UiEvent::Lock(_) => {}
        UiEvent::Error { source, text, code } => eprintln!("{source}: {text} (code {code})"),
    }
}
