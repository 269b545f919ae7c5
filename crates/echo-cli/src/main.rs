//! # Echo
//!
//! Terminal client: joins a relay under a username, chats with one selected
//! peer at a time, and places one-to-one calls through the str0m engine.
//!
//! Relay events are printed as they arrive; stdin lines become commands.

mod input;

use clap::Parser;
use echo_call::RtcEngine;
use echo_client::{relay, ClientError, ClientEvent, ClientSession, Command, SessionHandle, SessionSettings};
use echo_common::models::Participant;
use input::Input;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{broadcast, RwLock};

#[derive(Parser)]
#[command(name = "echo", about = "One-to-one chat and calls over an Echo relay", version)]
struct Cli {
    /// Display name announced to the relay
    #[arg(short, long, env = "ECHO_USERNAME")]
    username: String,

    /// Relay WebSocket URL (defaults to relay.url from configuration)
    #[arg(short, long)]
    relay: Option<String>,
}

type Roster = Arc<RwLock<Vec<Participant>>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = echo_common::config::init()?;

    // Initialize tracing (structured logging); stdout belongs to the chat
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "echo=debug".into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting Echo v{}", env!("CARGO_PKG_VERSION"));

    let relay_url = cli.relay.unwrap_or_else(|| config.relay.url.clone());
    let link = relay::connect(&relay_url).await?;

    // === Media engine ===
    let engine = Arc::new(RtcEngine::new(config.call.bind_ip()?));
    let settings = SessionSettings::from_config(config);

    let (session, handle) = ClientSession::new(cli.username, engine, &settings, link);
    let roster: Roster = Arc::new(RwLock::new(Vec::new()));

    tokio::spawn(print_events(handle.subscribe(), roster.clone()));
    tokio::spawn(read_input(handle, roster));

    println!("{}", input::HELP);
    match session.run().await {
        Ok(()) => Ok(()),
        Err(ClientError::Relay(e)) => {
            println!("Disconnected from relay.");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn read_input(handle: SessionHandle, roster: Roster) {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let parsed = input::parse(&line, &roster.read().await);
        let commands = match parsed {
            Ok(Input::Empty) => continue,
            Ok(Input::Help) => {
                println!("{}", input::HELP);
                continue;
            }
            Ok(Input::Users) => {
                let roster = roster.read().await;
                if roster.is_empty() {
                    println!("Nobody else is online.");
                }
                for p in roster.iter() {
                    println!("  • {} ({})", p.display_name, p.id);
                }
                continue;
            }
            Ok(Input::Command(command)) => vec![command],
            Ok(Input::Message(text)) => vec![Command::Compose(text.clone()), Command::SendMessage(text)],
            Err(usage) => {
                println!("{usage}");
                continue;
            }
        };

        for command in commands {
            let leaving = command == Command::Leave;
            if handle.send(command).await.is_err() || leaving {
                return;
            }
        }
    }

    // EOF
    let _ = handle.send(Command::Leave).await;
}

async fn print_events(mut events: broadcast::Receiver<ClientEvent>, roster: Roster) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event printer fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            ClientEvent::Connected { id } => println!("Connected as {id}"),
            ClientEvent::Roster(participants) => {
                println!("{} participant(s) online", participants.len());
                *roster.write().await = participants;
            }
            ClientEvent::PeerSelected(p) => println!("Chatting with {}", p.display_name),
            ClientEvent::History(messages) => {
                for m in messages {
                    println!("[{}] {}", m.sender_name, m.body);
                }
            }
            ClientEvent::MessageAppended(m) => println!("[{}] {}", m.sender_name, m.body),
            ClientEvent::PeerTyping { peer, typing: true } => println!("{peer} is typing…"),
            ClientEvent::PeerTyping { .. } => {}
            ClientEvent::CallPhase(phase) => tracing::debug!(?phase, "Call phase"),
            ClientEvent::IncomingCall { from } => println!("Incoming call from {from}, answering"),
            ClientEvent::CallConnected { peer } => println!("In a call with {peer}"),
            ClientEvent::CallFailed { peer, reason } => println!("Call with {peer} failed: {reason}"),
            ClientEvent::CallRejected { peer, reason } => println!("{peer} rejected the call ({reason})"),
            ClientEvent::CallEnded { peer } => println!("Call with {peer} ended"),
            ClientEvent::RemoteStream { peer, stream } => {
                println!("Receiving {:?} from {peer}", stream.kinds);
            }
            ClientEvent::MediaControl { local, peer } => println!(
                "You: mic {} camera {} | Peer: mic {} camera {}",
                on_off(local.audio_enabled),
                on_off(local.video_enabled),
                on_off(peer.audio_enabled),
                on_off(peer.video_enabled),
            ),
            ClientEvent::Error { message, .. } => println!("✗ {message}"),
            ClientEvent::Disconnected | ClientEvent::Left => break,
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}
