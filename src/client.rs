//! Single-task event loop tying the relay, the session and the peer link together.

use crate::config::AppConfig;
use crate::error::ChatError;
use crate::peer::media::{MediaController, MediaDevices};
use crate::peer::negotiator::{Negotiator, NegotiatorOptions};
use crate::peer::transport::TransportFactory;
use crate::peer::WebRtcFactory;
use crate::session::{ChatMode, ChatSession, SessionEvent, SessionOptions};
use crate::signaling::SignalingChannel;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What the presentation layer can ask for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SendMessage(String),
    Typing,
    FindNew,
    EndCall,
    ToggleCamera,
    ToggleMicrophone,
    RetryMedia,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    pub fn send(&self, command: Command) -> Result<(), ChatError> {
        self.tx.send(command).map_err(|_| ChatError::ChannelClosed)
    }

    pub fn send_message(&self, text: impl Into<String>) -> Result<(), ChatError> {
        self.send(Command::SendMessage(text.into()))
    }

    pub fn shutdown(&self) -> Result<(), ChatError> {
        self.send(Command::Shutdown)
    }
}

/// Devices and peer connections, only present in video mode.
struct CallStack {
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn TransportFactory>,
}

pub struct Client {
    config: AppConfig,
    camera: bool,
    call: Option<CallStack>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Client {
    fn build(
        config: AppConfig,
        call: Option<CallStack>,
    ) -> (Self, ClientHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let client = Self {
            config,
            camera: true,
            call,
            commands,
            events,
        };
        (client, ClientHandle { tx }, events_rx)
    }

    /// Relay-only chat. No media devices or peer connections are touched.
    pub fn text(config: AppConfig) -> (Self, ClientHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::build(config, None)
    }

    pub fn video(
        config: AppConfig,
        devices: Arc<dyn MediaDevices>,
    ) -> (Self, ClientHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let factory = Arc::new(WebRtcFactory::from_config(&config));
        Self::video_with(config, devices, factory)
    }

    /// Video chat over a caller supplied peer transport.
    pub fn video_with(
        config: AppConfig,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn TransportFactory>,
    ) -> (Self, ClientHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::build(config, Some(CallStack { devices, factory }))
    }

    pub fn mode(&self) -> ChatMode {
        if self.call.is_some() {
            ChatMode::Video
        } else {
            ChatMode::Text
        }
    }

    /// Joins video chats with the microphone only.
    pub fn without_camera(mut self) -> Self {
        self.camera = false;
        self
    }

    /// Runs until shutdown, end of call, or loss of the relay.
    ///
    /// Failing to reach the relay is returned straight away. On every exit
    /// path the peer link and local media are released first.
    pub async fn run(self) -> Result<(), ChatError> {
        let mode = self.mode();
        let Client {
            config,
            camera,
            call,
            mut commands,
            events,
        } = self;

        let mut channel = SignalingChannel::connect(&config.server_url, config.connect_timeout).await?;
        let mut inbound = channel.take_inbound().ok_or(ChatError::ChannelClosed)?;

        let (negotiator, mut link_rx, mut call_rx) = match call {
            Some(CallStack { devices, factory }) => {
                let (negotiator, link_rx, call_rx) = Negotiator::new(
                    factory,
                    channel.handle(),
                    MediaController::new(devices),
                    NegotiatorOptions::from(&config),
                );
                (Some(negotiator), Some(link_rx), Some(call_rx))
            }
            None => (None, None, None),
        };

        let options = SessionOptions {
            camera,
            ..SessionOptions::from(&config)
        };
        let (mut session, mut timers) =
            ChatSession::new(mode, options, channel.handle(), negotiator, events.clone());
        session.start().await;

        let result = loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => session.handle_server_event(event).await,
                    None => {
                        info!("relay connection lost");
                        let _ = events.send(SessionEvent::ChannelClosed);
                        break Err(ChatError::ChannelClosed);
                    }
                },
                Some(event) = recv_opt(&mut link_rx) => session.handle_link_event(event).await,
                Some(event) = recv_opt(&mut call_rx) => {
                    let _ = events.send(SessionEvent::Call(event));
                }
                Some(timer) = timers.recv() => session.handle_timer(timer),
                command = commands.recv() => match command {
                    Some(Command::SendMessage(text)) => session.send_message(&text),
                    Some(Command::Typing) => session.typing(),
                    Some(Command::FindNew) => session.find_new().await,
                    Some(Command::EndCall) => {
                        session.end_call().await;
                        break Ok(());
                    }
                    Some(Command::ToggleCamera) => session.toggle_camera(),
                    Some(Command::ToggleMicrophone) => session.toggle_microphone(),
                    Some(Command::RetryMedia) => session.retry_media().await,
                    Some(Command::Shutdown) | None => break Ok(()),
                },
            }
        };

        debug!("client loop finished: {result:?}");
        session.shutdown().await;
        channel.close().await;
        result
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
