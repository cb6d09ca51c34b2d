use crate::peer::media::MediaKind;
use crate::peer::state::{NegotiationPhase, Role};
use thiserror::Error;

/// Failures while opening or driving local capture devices.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("permission denied for {0}")]
    PermissionDenied(MediaKind),

    #[error("no {0} device available")]
    DeviceUnavailable(MediaKind),

    #[error("local track error: {0}")]
    Track(#[from] webrtc::Error),
}

/// Description or candidate rejected while negotiating a peer link.
///
/// These are reported on the negotiator's event channel and never end the
/// match on their own.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("no active peer link")]
    NoPeerLink,

    #[error("cannot {op} while negotiation is {phase:?}")]
    IllegalTransition {
        op: &'static str,
        phase: NegotiationPhase,
    },

    #[error("cannot {op} as {role:?}")]
    WrongRole { op: &'static str, role: Role },

    #[error("transport produced no local description")]
    MissingLocalDescription,

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("transport error: {0}")]
    Transport(#[from] webrtc::Error),

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling channel is closed")]
    Closed,

    #[error("failed to encode signaling event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Top-level error taxonomy surfaced to the presentation layer.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("camera or microphone permission denied ({0})")]
    PermissionDenied(MediaKind),

    #[error("{0} unavailable")]
    DeviceUnavailable(MediaKind),

    #[error("negotiation failure: {0}")]
    NegotiationFailure(#[from] NegotiationError),

    #[error("peer connection lost")]
    PeerLost,

    #[error("signaling relay unreachable: {0}")]
    ChannelUnavailable(String),

    #[error("signaling channel closed")]
    ChannelClosed,

    #[error("chat room is full")]
    RoomFull,

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error("media error: {0}")]
    Media(webrtc::Error),
}

impl From<MediaError> for ChatError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(kind) => ChatError::PermissionDenied(kind),
            MediaError::DeviceUnavailable(kind) => ChatError::DeviceUnavailable(kind),
            MediaError::Track(e) => ChatError::Media(e),
        }
    }
}
