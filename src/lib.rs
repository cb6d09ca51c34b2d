pub mod client;
pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

use crate::client::{Client, ClientHandle, Command};
use crate::config::AppConfig;
use crate::peer::media::{DeviceAccess, SyntheticDevices};
use crate::peer::NegotiatorEvent;
use crate::session::{ChatMode, Sender, SessionEvent};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "omechat", version, about = "Anonymous random-pairing chat client")]
struct Cli {
    /// Matchmaking relay, e.g. ws://localhost:3001
    #[arg(long)]
    server: Option<String>,

    #[arg(long, value_enum, default_value_t = ChatMode::Text)]
    mode: ChatMode,

    /// Join video chats with the microphone only
    #[arg(long)]
    no_camera: bool,

    /// Simulate a refused camera permission
    #[arg(long)]
    deny_camera: bool,

    /// Simulate a refused microphone permission
    #[arg(long)]
    deny_microphone: bool,

    #[arg(short, long)]
    verbose: bool,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (mut config, rejected) = AppConfig::from_env();
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    config.verbose |= cli.verbose;
    logger::init(&config);
    for reason in rejected {
        warn!("{reason}");
    }

    let (client, handle, events) = match cli.mode {
        ChatMode::Text => Client::text(config),
        ChatMode::Video => {
            let devices = SyntheticDevices {
                camera: access(cli.deny_camera),
                microphone: access(cli.deny_microphone),
            };
            Client::video(config, Arc::new(devices))
        }
    };
    let client = if cli.no_camera {
        client.without_camera()
    } else {
        client
    };

    println!("commands: /next /end /cam /mic /retry /quit, anything else is sent as a message");
    let printer = tokio::spawn(print_events(events));
    let reader = tokio::spawn(read_commands(handle));

    let result = client.run().await;
    reader.abort();
    printer.await.context("event printer panicked")?;
    result.context("chat client stopped")?;
    Ok(())
}

fn access(denied: bool) -> DeviceAccess {
    if denied {
        DeviceAccess::Denied
    } else {
        DeviceAccess::Granted
    }
}

async fn read_commands(handle: ClientHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some(command) = parse_command(&line) else {
            continue;
        };
        if handle.send(command).is_err() {
            return;
        }
    }
    let _ = handle.shutdown();
}

async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        if let Some(line) = describe(&event) {
            println!("{line}");
        }
    }
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    match line {
        "" => None,
        "/next" => Some(Command::FindNew),
        "/end" => Some(Command::EndCall),
        "/cam" => Some(Command::ToggleCamera),
        "/mic" => Some(Command::ToggleMicrophone),
        "/retry" => Some(Command::RetryMedia),
        "/quit" => Some(Command::Shutdown),
        _ if line.starts_with('/') => {
            println!("unknown command {line}");
            None
        }
        text => Some(Command::SendMessage(text.into())),
    }
}

fn describe(event: &SessionEvent) -> Option<String> {
    let line = match event {
        SessionEvent::StatusChanged(status) => format!("[status] {status:?}"),
        SessionEvent::Matched(m) => format!("[matched] {} in room {}", m.peer.name, m.room_id),
        SessionEvent::Icebreaker(text) => format!("[icebreaker] {text}"),
        SessionEvent::Message(m) => match m.sender {
            Sender::Me => format!("you: {}", m.text),
            Sender::Other => format!("stranger: {}", m.text),
            Sender::System => format!("* {}", m.text),
        },
        SessionEvent::MessagesCleared => "----".into(),
        SessionEvent::PeerTyping(true) => "[stranger is typing...]".into(),
        SessionEvent::PeerTyping(false) => return None,
        SessionEvent::RoomFull => "[room full]".into(),
        SessionEvent::MediaGrant(g) => {
            format!("[media] camera={} microphone={}", g.camera, g.microphone)
        }
        SessionEvent::Call(NegotiatorEvent::RoleAssigned { role, .. }) => {
            format!("[call] negotiating as {role:?}")
        }
        SessionEvent::Call(NegotiatorEvent::StateChanged(state)) => format!("[call] {state:?}"),
        SessionEvent::Call(NegotiatorEvent::RemoteTrack(track)) => {
            format!("[call] receiving {} from stranger", track.kind)
        }
        SessionEvent::Call(NegotiatorEvent::RemoteStreamCleared) => "[call] remote stream gone".into(),
        SessionEvent::Call(NegotiatorEvent::Error(e)) => format!("[call] {e}"),
        SessionEvent::Error(e) => format!("[error] {e}"),
        SessionEvent::ChannelClosed => "[relay connection closed]".into(),
    };
    Some(line)
}
