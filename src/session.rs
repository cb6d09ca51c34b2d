//! Chat session bookkeeping.
//!
//! [`ChatSession`] tracks the current match, the message list and the user's
//! status, and reports every change to the presentation layer as a
//! [`SessionEvent`]. In video mode it also drives the [`Negotiator`].
//!
//! Delayed work (re-queue after a peer leaves, the match's conversation
//! starter, typing indicator expiry) is a
//! spawned sleep that posts a [`SessionTimer`] back to the owning loop. Each
//! timer carries the epoch it was armed in and is ignored if the session has
//! moved on since.

use crate::config::AppConfig;
use crate::error::ChatError;
use crate::peer::negotiator::{LinkOutcome, Negotiator};
use crate::peer::transport::LinkEvent;
use crate::peer::types::MatchInfo;
use crate::peer::MediaGrant;
use crate::signaling::{ClientEvent, ServerEvent, SignalingHandle};
use crate::utils::{random_id, random_user_name};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const PEER_LEFT_NOTICE: &str =
    "User disconnected. Click \"Find New\" to chat with someone else.";
pub const ROOM_FULL_NOTICE: &str =
    "The chat room is full. Restart the client to try again later.";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    Text,
    Video,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Me,
    Other,
    /// Notices generated locally, e.g. the welcome line.
    System,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub text: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(text: impl Into<String>, sender: Sender) -> Self {
        Self {
            id: random_id(),
            text: text.into(),
            sender,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Ended,
    /// The relay refused us; nothing is queued until restart.
    Blocked,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            user_id: random_id(),
            user_name: random_user_name(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTimer {
    Requeue { epoch: u64 },
    Icebreaker { epoch: u64 },
    TypingExpired { pulse: u64 },
}

/// Everything the presentation layer needs to render.
#[derive(Debug)]
pub enum SessionEvent {
    StatusChanged(ConnectionStatus),
    Matched(MatchInfo),
    Icebreaker(String),
    Message(Message),
    MessagesCleared,
    PeerTyping(bool),
    RoomFull,
    MediaGrant(MediaGrant),
    Call(crate::peer::NegotiatorEvent),
    Error(ChatError),
    ChannelClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub requeue_delay: Duration,
    pub typing_window: Duration,
    pub icebreaker_delay: Duration,
    /// Ask for the camera in video mode; the microphone is always requested.
    pub camera: bool,
}

impl From<&AppConfig> for SessionOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            requeue_delay: config.requeue_delay,
            typing_window: config.typing_window,
            icebreaker_delay: config.icebreaker_delay,
            camera: true,
        }
    }
}

pub struct ChatSession {
    mode: ChatMode,
    options: SessionOptions,
    identity: Identity,
    status: ConnectionStatus,
    current: Option<MatchInfo>,
    messages: Vec<Message>,
    peer_typing: bool,
    typing_pulse: u64,
    epoch: u64,
    blocked: bool,
    signaling: SignalingHandle,
    negotiator: Option<Negotiator>,
    events: mpsc::UnboundedSender<SessionEvent>,
    timers: mpsc::UnboundedSender<SessionTimer>,
}

impl ChatSession {
    /// `negotiator` is only used in video mode. Returns the session and the
    /// timer stream its owner feeds back into [`ChatSession::handle_timer`].
    pub fn new(
        mode: ChatMode,
        options: SessionOptions,
        signaling: SignalingHandle,
        negotiator: Option<Negotiator>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionTimer>) {
        let (timers, timers_rx) = mpsc::unbounded_channel();
        let negotiator = match mode {
            ChatMode::Video => negotiator,
            ChatMode::Text => None,
        };
        let session = Self {
            mode,
            options,
            identity: Identity::generate(),
            status: ConnectionStatus::Idle,
            current: None,
            messages: Vec::new(),
            peer_typing: false,
            typing_pulse: 0,
            epoch: 0,
            blocked: false,
            signaling,
            negotiator,
            events,
            timers,
        };
        (session, timers_rx)
    }

    pub fn mode(&self) -> ChatMode {
        self.mode
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn current_match(&self) -> Option<&MatchInfo> {
        self.current.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn peer_typing(&self) -> bool {
        self.peer_typing
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn negotiator(&self) -> Option<&Negotiator> {
        self.negotiator.as_ref()
    }

    /// Acquires media in video mode, then joins the queue.
    ///
    /// A media failure is reported and leaves the session idle; the user can
    /// retry with [`ChatSession::retry_media`].
    pub async fn start(&mut self) {
        if self.acquire_media().await {
            self.join_queue();
        }
    }

    /// Re-runs media acquisition after a refusal and joins if still idle.
    pub async fn retry_media(&mut self) {
        if self.mode != ChatMode::Video {
            return;
        }
        if self.acquire_media().await && self.status == ConnectionStatus::Idle {
            self.join_queue();
        }
    }

    async fn acquire_media(&mut self) -> bool {
        let camera = self.options.camera;
        let Some(negotiator) = self.negotiator.as_mut() else {
            return true;
        };
        match negotiator.acquire_media(camera, true).await {
            Ok(grant) => {
                self.emit(SessionEvent::MediaGrant(grant));
                true
            }
            Err(e) => {
                warn!("media unavailable: {e}");
                self.emit(SessionEvent::Error(e.into()));
                false
            }
        }
    }

    /// Takes a fresh identifier and asks the relay for a partner.
    pub fn join_queue(&mut self) {
        if self.blocked {
            debug!("blocked, not joining the queue");
            return;
        }
        self.epoch += 1;
        self.identity.user_id = random_id();
        info!("joining queue as {} ({})", self.identity.user_name, self.identity.user_id);
        self.send(ClientEvent::JoinQueue {
            user_id: self.identity.user_id.clone(),
            user_name: self.identity.user_name.clone(),
            mode: self.mode,
        });
        self.set_status(ConnectionStatus::Connecting);
    }

    pub fn send_message(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() || self.current.is_none() {
            return;
        }
        self.send(ClientEvent::SendMessage { text: text.into() });
        self.push_message(Message::new(text, Sender::Me));
    }

    /// Outbound typing pulse; dropped when not matched.
    pub fn typing(&mut self) {
        if self.current.is_some() {
            self.send(ClientEvent::Typing);
        }
    }

    /// User asked for a different partner.
    pub async fn find_new(&mut self) {
        if self.blocked {
            return;
        }
        info!("looking for a new partner");
        self.epoch += 1;
        self.reset_link().await;
        self.send(ClientEvent::FindNew);
        self.leave_match();
        self.clear_messages();
        self.set_status(ConnectionStatus::Connecting);
    }

    /// Hangs up for good; the session does not re-queue afterwards.
    pub async fn end_call(&mut self) {
        info!("ending call");
        self.epoch += 1;
        self.send(ClientEvent::EndCall);
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.stop().await;
        }
        self.leave_match();
        self.set_status(ConnectionStatus::Ended);
    }

    pub fn toggle_camera(&mut self) {
        let Some(negotiator) = self.negotiator.as_mut() else {
            return;
        };
        if negotiator.toggle_camera().is_some() {
            let grant = negotiator.media().grant();
            self.emit(SessionEvent::MediaGrant(grant));
        }
    }

    pub fn toggle_microphone(&mut self) {
        let Some(negotiator) = self.negotiator.as_mut() else {
            return;
        };
        if negotiator.toggle_microphone().is_some() {
            let grant = negotiator.media().grant();
            self.emit(SessionEvent::MediaGrant(grant));
        }
    }

    /// Releases everything. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.epoch += 1;
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.stop().await;
        }
    }

    pub async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Matched {
                room_id,
                other_user,
                icebreaker,
            } => {
                if self.blocked {
                    return;
                }
                let m = MatchInfo {
                    room_id,
                    local_id: self.identity.user_id.clone(),
                    peer: other_user,
                    icebreaker,
                };
                self.on_matched(m).await;
            }
            ServerEvent::Message { text, .. } => {
                if self.current.is_some() {
                    self.push_message(Message::new(text, Sender::Other));
                }
            }
            ServerEvent::Typing => self.on_peer_typing(),
            ServerEvent::UserDisconnected
            | ServerEvent::PeerDisconnected
            | ServerEvent::CallEnded => self.on_peer_left().await,
            ServerEvent::PeerWantsFindNew => self.on_peer_wants_find_new().await,
            ServerEvent::CallOffer { offer, .. } => {
                if let Some(negotiator) = self.negotiator.as_mut() {
                    negotiator.handle_offer(offer).await;
                }
            }
            ServerEvent::CallAnswer { answer, .. } => {
                if let Some(negotiator) = self.negotiator.as_mut() {
                    negotiator.handle_answer(answer).await;
                }
            }
            ServerEvent::IceCandidate { candidate, .. } => {
                if let Some(negotiator) = self.negotiator.as_mut() {
                    negotiator.handle_remote_candidate(candidate).await;
                }
            }
            ServerEvent::RoomFull => self.on_room_full().await,
        }
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        let Some(negotiator) = self.negotiator.as_mut() else {
            return;
        };
        if let Some(LinkOutcome::PeerLost) = negotiator.handle_link_event(event).await {
            self.on_peer_lost().await;
        }
    }

    pub fn handle_timer(&mut self, timer: SessionTimer) {
        match timer {
            SessionTimer::Requeue { epoch } => {
                if epoch != self.epoch || self.blocked {
                    debug!("re-queue superseded");
                    return;
                }
                self.clear_messages();
                self.join_queue();
            }
            SessionTimer::Icebreaker { epoch } => {
                if epoch != self.epoch {
                    return;
                }
                let icebreaker = self.current.as_ref().and_then(|m| m.icebreaker.clone());
                if let Some(icebreaker) = icebreaker {
                    self.emit(SessionEvent::Icebreaker(icebreaker));
                }
            }
            SessionTimer::TypingExpired { pulse } => {
                if pulse == self.typing_pulse && self.peer_typing {
                    self.peer_typing = false;
                    self.emit(SessionEvent::PeerTyping(false));
                }
            }
        }
    }

    async fn on_matched(&mut self, m: MatchInfo) {
        info!("matched with {} in room {}", m.peer.name, m.room_id);
        self.epoch += 1;
        self.clear_messages();
        self.push_message(Message::new(
            format!("You are now connected with {}!", m.peer.name),
            Sender::System,
        ));
        self.current = Some(m.clone());
        self.set_status(ConnectionStatus::Connected);
        self.emit(SessionEvent::Matched(m.clone()));
        if m.icebreaker.is_some() {
            self.schedule(
                SessionTimer::Icebreaker { epoch: self.epoch },
                self.options.icebreaker_delay,
            );
        }

        if let Some(negotiator) = self.negotiator.as_mut() {
            if let Err(e) = negotiator.start_connection(&m).await {
                warn!("could not start peer link: {e}");
                self.emit(SessionEvent::Error(e.into()));
            }
        }
    }

    fn on_peer_typing(&mut self) {
        if self.current.is_none() {
            return;
        }
        self.typing_pulse += 1;
        if !self.peer_typing {
            self.peer_typing = true;
            self.emit(SessionEvent::PeerTyping(true));
        }
        self.schedule(
            SessionTimer::TypingExpired {
                pulse: self.typing_pulse,
            },
            self.options.typing_window,
        );
    }

    async fn on_peer_left(&mut self) {
        if self.current.is_none() {
            debug!("peer left without an active match, ignoring");
            return;
        }
        info!("peer left");
        self.epoch += 1;
        self.push_message(Message::new(PEER_LEFT_NOTICE, Sender::System));
        self.set_status(ConnectionStatus::Disconnected);
        self.leave_match();
        self.reset_link().await;
        self.schedule(
            SessionTimer::Requeue { epoch: self.epoch },
            self.options.requeue_delay,
        );
    }

    async fn on_peer_wants_find_new(&mut self) {
        if self.blocked {
            return;
        }
        info!("peer moved on");
        self.epoch += 1;
        self.reset_link().await;
        self.leave_match();
        self.clear_messages();
        self.set_status(ConnectionStatus::Connecting);
        self.send(ClientEvent::PeerConfirmFindNew);
    }

    async fn on_peer_lost(&mut self) {
        if self.blocked {
            return;
        }
        warn!("peer link lost, looking for a new partner");
        self.epoch += 1;
        self.reset_link().await;
        self.send(ClientEvent::FindNew);
        self.leave_match();
        self.clear_messages();
        self.set_status(ConnectionStatus::Connecting);
        self.emit(SessionEvent::Error(ChatError::PeerLost));
    }

    async fn on_room_full(&mut self) {
        warn!("room is full");
        self.blocked = true;
        self.epoch += 1;
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.stop().await;
        }
        self.leave_match();
        self.push_message(Message::new(ROOM_FULL_NOTICE, Sender::System));
        self.set_status(ConnectionStatus::Blocked);
        self.emit(SessionEvent::RoomFull);
    }

    /// Closes the link and re-opens the user's devices for the next match.
    async fn reset_link(&mut self) {
        let Some(negotiator) = self.negotiator.as_mut() else {
            return;
        };
        negotiator.stop().await;
        match negotiator.reacquire_media().await {
            Ok(grant) => self.emit(SessionEvent::MediaGrant(grant)),
            Err(e) => {
                warn!("could not re-open media: {e}");
                self.emit(SessionEvent::Error(e.into()));
            }
        }
    }

    fn leave_match(&mut self) {
        self.current = None;
        if self.peer_typing {
            self.peer_typing = false;
            self.emit(SessionEvent::PeerTyping(false));
        }
    }

    fn push_message(&mut self, message: Message) {
        self.messages.push(message.clone());
        self.emit(SessionEvent::Message(message));
    }

    fn clear_messages(&mut self) {
        if !self.messages.is_empty() {
            self.messages.clear();
            self.emit(SessionEvent::MessagesCleared);
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            debug!("status {:?} -> {status:?}", self.status);
            self.status = status;
            self.emit(SessionEvent::StatusChanged(status));
        }
    }

    fn send(&self, event: ClientEvent) {
        if let Err(e) = self.signaling.emit(event) {
            warn!("signaling send failed: {e}");
            self.emit(SessionEvent::Error(e.into()));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn schedule(&self, timer: SessionTimer, after: Duration) {
        let tx = self.timers.clone();
        tokio::spawn(async move {
            sleep(after).await;
            let _ = tx.send(timer);
        });
    }
}
