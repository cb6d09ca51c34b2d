//! Events exchanged with the matchmaking relay.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`; events
//! without a payload omit `data`.

use crate::error::SignalingError;
use crate::peer::types::{IceCandidate, PeerInfo, SessionDescription};
use crate::session::ChatMode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Client → relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinQueue {
        user_id: String,
        user_name: String,
        mode: ChatMode,
    },
    SendMessage {
        text: String,
    },
    Typing,
    FindNew,
    CallOffer {
        offer: SessionDescription,
    },
    CallAnswer {
        answer: SessionDescription,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    EndCall,
    PeerConfirmFindNew,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinQueue { .. } => "join-queue",
            ClientEvent::SendMessage { .. } => "send-message",
            ClientEvent::Typing => "typing",
            ClientEvent::FindNew => "find-new",
            ClientEvent::CallOffer { .. } => "call-offer",
            ClientEvent::CallAnswer { .. } => "call-answer",
            ClientEvent::IceCandidate { .. } => "ice-candidate",
            ClientEvent::EndCall => "end-call",
            ClientEvent::PeerConfirmFindNew => "peer-confirm-find-new",
        }
    }
}

/// Relay → client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Matched {
        room_id: String,
        other_user: PeerInfo,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        icebreaker: Option<String>,
    },
    Message {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    Typing,
    UserDisconnected,
    PeerDisconnected,
    CallEnded,
    PeerWantsFindNew,
    CallOffer {
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    CallAnswer {
        answer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    IceCandidate {
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    RoomFull,
}

pub fn decode_server_event(text: &str) -> Result<ServerEvent, serde_json::Error> {
    serde_json::from_str(text)
}

pub fn encode_client_event(event: &ClientEvent) -> Result<String, SignalingError> {
    Ok(serde_json::to_string(event)?)
}

/// Outbound half of the signaling channel.
///
/// Created once per session and cloned into every component that talks to
/// the relay.
#[derive(Debug, Clone)]
pub struct SignalingHandle {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl SignalingHandle {
    /// A handle plus the receiving end a transport (or a test) drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: ClientEvent) -> Result<(), SignalingError> {
        debug!("emit {}", event.name());
        self.tx.send(event).map_err(|_| SignalingError::Closed)
    }
}
