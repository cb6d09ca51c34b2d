use crate::config::AppConfig;
use crate::error::NegotiationError;
use crate::logger::dump_selected_pair;
use crate::peer::media::{LocalTrack, MediaKind};
use crate::peer::state::ConnectionState;
use crate::peer::transport::{LinkEventSender, PeerTransport, RemoteTrack, TransportFactory};
use crate::peer::types::{IceCandidate, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

/// Builds `webrtc` peer connections from the configured ICE servers.
pub struct WebRtcFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcFactory {
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        Self {
            ice_servers: get_user_ice_servers(servers),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        let transport = WebRtcTransport::new(rtc_config(self.ice_servers.clone()), events).await?;
        Ok(Arc::new(transport))
    }
}

/// A single `RTCPeerConnection` wired to report back through a [`LinkEventSender`].
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    sending: Mutex<Vec<MediaKind>>,
    receivers_added: AtomicBool,
}

impl WebRtcTransport {
    pub async fn new(
        config: RTCConfiguration,
        events: LinkEventSender,
    ) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(config).await?);
        let generation = events.generation();

        let ice_events = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => ice_events.local_candidate(Some(IceCandidate::from(init))),
                    Err(e) => warn!("could not serialise local candidate: {e}"),
                },
                // end of gathering
                None => ice_events.local_candidate(None),
            }
            Box::pin(async {})
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!("link {generation} ICE gathering state: {state:?}");
            Box::pin(async {})
        }));

        let state_events = events.clone();
        let pc_stats = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!("link {generation} peer connection state: {st:?}");
            if st == RTCPeerConnectionState::Failed {
                if let Some(pc) = pc_stats.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            state_events.state_changed(ConnectionState::from(st));
            Box::pin(async {})
        }));

        let track_events = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                if let Some(kind) = MediaKind::from_codec(track.kind()) {
                    track_events.remote_track(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    });
                }
                // Keep the receive path draining so interceptors see RTP.
                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {}
                    debug!("remote track {} ended", track.id());
                });
                Box::pin(async {})
            },
        ));

        Ok(Self {
            pc,
            sending: Mutex::new(Vec::new()),
            receivers_added: AtomicBool::new(false),
        })
    }

    /// Adds receive-only transceivers for the kinds we do not send, so the
    /// offer always asks for the peer's camera and microphone.
    async fn ensure_receivers(&self) -> Result<(), NegotiationError> {
        if self.receivers_added.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let missing: Vec<MediaKind> = {
            let sending = self.sending.lock().unwrap_or_else(|e| e.into_inner());
            [MediaKind::Video, MediaKind::Audio]
                .into_iter()
                .filter(|k| !sending.contains(k))
                .collect()
        };
        for kind in missing {
            let codec = match kind {
                MediaKind::Video => RTPCodecType::Video,
                MediaKind::Audio => RTPCodecType::Audio,
            };
            self.pc
                .add_transceiver_from_kind(
                    codec,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }
        Ok(())
    }

    async fn local_description(&self) -> Result<SessionDescription, NegotiationError> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or(NegotiationError::MissingLocalDescription)?;
        SessionDescription::try_from(desc)
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let sender = self.pc.add_track(track.rtc_track()).await?;
        self.sending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(track.kind());

        // RTCP has to be read for NACK and friends to work.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_receivers().await?;
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.local_description().await
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_description().await
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let desc = RTCSessionDescription::try_from(desc)?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await?;
        info!("peer connection closed");
        Ok(())
    }
}

/// Peer connection configuration for the given ICE servers.
fn rtc_config(ice_servers: Vec<RTCIceServer>) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: Vec<ServerConfig>) -> Vec<RTCIceServer> {
    servers
        .into_iter()
        .map(|config| {
            let url = add_ice_url_scheme(&config);

            RTCIceServer {
                urls: vec![url],
                username: config.username.unwrap_or_default(),
                credential: config.credential.unwrap_or_default(),
            }
        })
        .collect()
}
