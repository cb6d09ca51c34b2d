pub mod connection;
pub mod ice;
pub mod media;
pub mod negotiator;
pub mod state;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{WebRtcFactory, WebRtcTransport};
pub use media::{
    DeviceAccess, LocalMedia, LocalTrack, MediaController, MediaDevices, MediaGrant, MediaKind,
    SyntheticDevices,
};
pub use negotiator::{LinkOutcome, Negotiator, NegotiatorEvent, NegotiatorOptions};
pub use state::{ConnectionState, LinkState, NegotiationPhase, Role};
pub use transport::{LinkEvent, LinkEventSender, PeerTransport, RemoteTrack, TransportFactory};
pub use types::{IceCandidate, MatchInfo, PeerInfo, SdpKind, ServerConfig, SessionDescription};
