//! Peer link state machine.
//!
//! A link moves `New → Connecting → Connected`, drops to `Recovering` when the
//! transport reports `failed`/`disconnected`, and ends in `Closed` once
//! stopped. The offer/answer exchange is tracked separately by
//! [`NegotiationPhase`].

use serde::Serialize;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Which side sends the offer. Fixed when the link is created.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// The participant whose identifier sorts lower makes the offer.
    ///
    /// Both sides compute this from the same pair of identifiers, so they
    /// always agree without an extra round trip.
    pub fn for_pair(local_id: &str, remote_id: &str) -> Role {
        if local_id < remote_id {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

/// Connection state reported by the underlying transport.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(st: RTCPeerConnectionState) -> Self {
        match st {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Recovering,
    Closed,
}

/// What the owner of a link has to do after a transport state report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changed, nothing else to do.
    Moved(LinkState),
    /// The peer is gone; tear down and look for a new match.
    Lost,
    Ignored,
}

impl LinkState {
    pub fn start(self) -> LinkState {
        match self {
            LinkState::New => LinkState::Connecting,
            other => other,
        }
    }

    pub fn is_live(self) -> bool {
        matches!(self, LinkState::Connecting | LinkState::Connected)
    }

    /// Applies a transport report and says what the owner has to do.
    pub fn on_transport(&mut self, reported: ConnectionState) -> Transition {
        let next = match (*self, reported) {
            (LinkState::Closed | LinkState::Recovering, _) => return Transition::Ignored,
            (LinkState::New | LinkState::Connecting, ConnectionState::Connecting) => {
                LinkState::Connecting
            }
            (_, ConnectionState::Connected) => LinkState::Connected,
            (LinkState::Connecting | LinkState::Connected, ConnectionState::Failed)
            | (LinkState::Connecting | LinkState::Connected, ConnectionState::Disconnected) => {
                *self = LinkState::Recovering;
                return Transition::Lost;
            }
            (_, ConnectionState::Closed) => LinkState::Closed,
            _ => return Transition::Ignored,
        };
        if next == *self {
            return Transition::Ignored;
        }
        *self = next;
        Transition::Moved(next)
    }

    pub fn close(&mut self) {
        *self = LinkState::Closed;
    }
}

/// Progress of the offer/answer exchange on one link.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Idle,
    HaveLocalOffer,
    Stable,
}
