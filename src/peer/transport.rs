use crate::error::NegotiationError;
use crate::peer::media::{LocalTrack, MediaKind};
use crate::peer::state::ConnectionState;
use crate::peer::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Track received from the remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

/// Everything a live link reports back to the negotiator.
///
/// Each event carries the generation of the link that produced it; events from
/// a superseded link are dropped on arrival.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// `None` marks the end of local candidate gathering.
    LocalCandidate {
        generation: u64,
        candidate: Option<IceCandidate>,
    },
    StateChanged {
        generation: u64,
        state: ConnectionState,
    },
    RemoteTrack {
        generation: u64,
        track: RemoteTrack,
    },
    OfferDue {
        generation: u64,
    },
    NegotiationDeadline {
        generation: u64,
    },
}

impl LinkEvent {
    pub fn generation(&self) -> u64 {
        match self {
            LinkEvent::LocalCandidate { generation, .. }
            | LinkEvent::StateChanged { generation, .. }
            | LinkEvent::RemoteTrack { generation, .. }
            | LinkEvent::OfferDue { generation }
            | LinkEvent::NegotiationDeadline { generation } => *generation,
        }
    }
}

/// Sender half handed to a transport, pre-stamped with its link generation.
#[derive(Debug, Clone)]
pub struct LinkEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEventSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_candidate(&self, candidate: Option<IceCandidate>) {
        let _ = self.tx.send(LinkEvent::LocalCandidate {
            generation: self.generation,
            candidate,
        });
    }

    pub fn state_changed(&self, state: ConnectionState) {
        let _ = self.tx.send(LinkEvent::StateChanged {
            generation: self.generation,
            state,
        });
    }

    pub fn remote_track(&self, track: RemoteTrack) {
        let _ = self.tx.send(LinkEvent::RemoteTrack {
            generation: self.generation,
            track,
        });
    }
}

/// One direct peer connection as seen by the negotiator.
///
/// `create_offer` and `create_answer` also apply the result as the local
/// description.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Builds a fresh transport for every peer link.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError>;
}
