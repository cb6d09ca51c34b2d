//! Peer connection negotiator.
//!
//! Owns at most one [`PeerLink`] at a time and drives its offer/answer and
//! candidate exchange through the signaling relay. Transport callbacks and
//! timers come back as [`LinkEvent`]s tagged with the link generation; anything
//! tagged with an older generation is dropped.

use crate::config::AppConfig;
use crate::error::{MediaError, NegotiationError};
use crate::logger::dump_candidate;
use crate::peer::ice::{CandidateTally, PendingCandidates};
use crate::peer::media::{MediaController, MediaGrant};
use crate::peer::state::{LinkState, NegotiationPhase, Role, Transition};
use crate::peer::transport::{
    LinkEvent, LinkEventSender, PeerTransport, RemoteTrack, TransportFactory,
};
use crate::peer::types::{IceCandidate, MatchInfo, SessionDescription};
use crate::signaling::{ClientEvent, SignalingHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct NegotiatorOptions {
    pub offer_delay: Duration,
    pub negotiation_timeout: Option<Duration>,
}

impl From<&AppConfig> for NegotiatorOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            offer_delay: config.offer_delay,
            negotiation_timeout: config.negotiation_timeout,
        }
    }
}

/// Progress reports for the presentation layer.
#[derive(Debug)]
pub enum NegotiatorEvent {
    RoleAssigned { role: Role, room_id: String },
    StateChanged(LinkState),
    RemoteTrack(RemoteTrack),
    RemoteStreamCleared,
    Error(NegotiationError),
}

/// Something the owner of the negotiator has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    PeerLost,
}

/// The live connection bound to one match.
pub struct PeerLink {
    generation: u64,
    role: Role,
    room_id: String,
    state: LinkState,
    phase: NegotiationPhase,
    transport: Arc<dyn PeerTransport>,
    pending: PendingCandidates,
    tally: CandidateTally,
    remote_tracks: Vec<RemoteTrack>,
}

impl PeerLink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }
}

pub struct Negotiator {
    factory: Arc<dyn TransportFactory>,
    signaling: SignalingHandle,
    media: MediaController,
    options: NegotiatorOptions,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    updates: mpsc::UnboundedSender<NegotiatorEvent>,
    link: Option<PeerLink>,
    next_generation: u64,
}

impl Negotiator {
    /// Returns the negotiator with the receivers its owner must drain: link
    /// events go back into [`Negotiator::handle_link_event`], negotiator events
    /// go to the presentation layer.
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        signaling: SignalingHandle,
        media: MediaController,
        options: NegotiatorOptions,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<LinkEvent>,
        mpsc::UnboundedReceiver<NegotiatorEvent>,
    ) {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let negotiator = Self {
            factory,
            signaling,
            media,
            options,
            link_tx,
            updates,
            link: None,
            next_generation: 0,
        };
        (negotiator, link_rx, updates_rx)
    }

    pub fn link(&self) -> Option<&PeerLink> {
        self.link.as_ref()
    }

    pub fn link_state(&self) -> Option<LinkState> {
        self.link.as_ref().map(PeerLink::state)
    }

    pub fn role(&self) -> Option<Role> {
        self.link.as_ref().map(PeerLink::role)
    }

    pub fn media(&self) -> &MediaController {
        &self.media
    }

    pub async fn acquire_media(&mut self, video: bool, audio: bool) -> Result<MediaGrant, MediaError> {
        self.media.acquire(video, audio).await?;
        Ok(self.media.grant())
    }

    pub async fn reacquire_media(&mut self) -> Result<MediaGrant, MediaError> {
        self.media.reacquire().await?;
        Ok(self.media.grant())
    }

    /// Local only: the track stays attached and nothing is renegotiated.
    pub fn toggle_camera(&mut self) -> Option<bool> {
        self.media.toggle_camera()
    }

    /// Local only: the track stays attached and nothing is renegotiated.
    pub fn toggle_microphone(&mut self) -> Option<bool> {
        self.media.toggle_microphone()
    }

    /// Replaces any existing link with a fresh one for `m`.
    ///
    /// The previous link is fully closed before the new transport is created.
    pub async fn start_connection(&mut self, m: &MatchInfo) -> Result<Role, NegotiationError> {
        self.close_link().await;

        let role = Role::for_pair(&m.local_id, &m.peer.id);
        self.next_generation += 1;
        let generation = self.next_generation;

        let transport = self
            .factory
            .create(LinkEventSender::new(generation, self.link_tx.clone()))
            .await?;

        if let Some(local) = self.media.local() {
            for track in local.tracks() {
                if let Err(e) = transport.add_track(track).await {
                    warn!("could not attach local {} track: {e}", track.kind());
                    self.report(e);
                }
            }
        }

        info!(
            "peer link {generation} for room {} as {role:?} (peer {})",
            m.room_id, m.peer.id
        );
        self.link = Some(PeerLink {
            generation,
            role,
            room_id: m.room_id.clone(),
            state: LinkState::New.start(),
            phase: NegotiationPhase::Idle,
            transport,
            pending: PendingCandidates::default(),
            tally: CandidateTally::default(),
            remote_tracks: Vec::new(),
        });
        self.notify(NegotiatorEvent::RoleAssigned {
            role,
            room_id: m.room_id.clone(),
        });
        self.notify(NegotiatorEvent::StateChanged(LinkState::Connecting));

        if role == Role::Initiator {
            self.schedule(LinkEvent::OfferDue { generation }, self.options.offer_delay);
        }
        if let Some(limit) = self.options.negotiation_timeout {
            self.schedule(LinkEvent::NegotiationDeadline { generation }, limit);
        }
        Ok(role)
    }

    /// Initiator only, once per link. Failures are reported, not returned.
    pub async fn create_offer(&mut self) {
        if let Err(e) = self.try_create_offer().await {
            warn!("create offer failed: {e}");
            self.report(e);
        }
    }

    /// Explicitly starts another offer round on a negotiated link.
    pub async fn renegotiate(&mut self) {
        let Some(link) = self.link.as_mut() else {
            self.report(NegotiationError::NoPeerLink);
            return;
        };
        if link.role == Role::Initiator && link.phase == NegotiationPhase::Stable {
            link.phase = NegotiationPhase::Idle;
            self.create_offer().await;
        } else {
            let phase = link.phase;
            self.report(NegotiationError::IllegalTransition {
                op: "renegotiate",
                phase,
            });
        }
    }

    async fn try_create_offer(&mut self) -> Result<(), NegotiationError> {
        let link = self.link.as_ref().ok_or(NegotiationError::NoPeerLink)?;
        if link.role != Role::Initiator {
            return Err(NegotiationError::WrongRole {
                op: "create an offer",
                role: link.role,
            });
        }
        if link.phase != NegotiationPhase::Idle || !link.state.is_live() {
            return Err(NegotiationError::IllegalTransition {
                op: "create an offer",
                phase: link.phase,
            });
        }
        let generation = link.generation;
        let transport = link.transport.clone();

        let offer = transport.create_offer().await?;
        let Some(link) = self.live_link_mut(generation) else {
            return Ok(());
        };
        link.phase = NegotiationPhase::HaveLocalOffer;
        debug!("offer ready for link {generation}");
        self.signaling.emit(ClientEvent::CallOffer { offer })?;
        Ok(())
    }

    /// Responder path. Failures are reported, the match carries on.
    pub async fn handle_offer(&mut self, offer: SessionDescription) {
        if let Err(e) = self.try_handle_offer(offer).await {
            warn!("handle offer failed: {e}");
            self.report(e);
        }
    }

    async fn try_handle_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        let Some(link) = self.link.as_ref() else {
            debug!("offer without a peer link, discarding");
            return Ok(());
        };
        if link.role != Role::Responder {
            return Err(NegotiationError::WrongRole {
                op: "accept an offer",
                role: link.role,
            });
        }
        if !link.state.is_live() {
            return Err(NegotiationError::IllegalTransition {
                op: "accept an offer",
                phase: link.phase,
            });
        }
        let generation = link.generation;
        let transport = link.transport.clone();

        transport.set_remote_description(offer).await?;
        let Some(link) = self.live_link_mut(generation) else {
            return Ok(());
        };
        let applied = link.pending.flush(transport.as_ref()).await;
        if applied > 0 {
            debug!("applied {applied} early candidates");
        }

        let answer = transport.create_answer().await?;
        let Some(link) = self.live_link_mut(generation) else {
            return Ok(());
        };
        link.phase = NegotiationPhase::Stable;
        debug!("answer ready for link {generation}");
        self.signaling.emit(ClientEvent::CallAnswer { answer })?;
        Ok(())
    }

    /// Initiator path; a no-op unless an offer is outstanding.
    pub async fn handle_answer(&mut self, answer: SessionDescription) {
        if let Err(e) = self.try_handle_answer(answer).await {
            warn!("handle answer failed: {e}");
            self.report(e);
        }
    }

    async fn try_handle_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        let Some(link) = self.link.as_ref() else {
            debug!("answer without a peer link, discarding");
            return Ok(());
        };
        if link.phase != NegotiationPhase::HaveLocalOffer {
            debug!("answer with no local offer outstanding ({:?}), ignoring", link.phase);
            return Ok(());
        }
        let generation = link.generation;
        let transport = link.transport.clone();

        transport.set_remote_description(answer).await?;
        let Some(link) = self.live_link_mut(generation) else {
            return Ok(());
        };
        link.phase = NegotiationPhase::Stable;
        let applied = link.pending.flush(transport.as_ref()).await;
        if applied > 0 {
            debug!("applied {applied} early candidates");
        }
        Ok(())
    }

    /// Applies a remote candidate, or queues it until the remote description
    /// is known. Rejected candidates are logged and dropped.
    pub async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(link) = self.link.as_mut() else {
            debug!("candidate without a peer link, discarding");
            return;
        };
        if link.state == LinkState::Closed {
            debug!("candidate for closed link {}, discarding", link.generation);
            return;
        }
        let transport = link.transport.clone();
        if !transport.has_remote_description().await {
            link.pending.push(candidate);
            return;
        }
        dump_candidate("REMOTE", &candidate);
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn!("failed to add remote candidate: {e}");
        }
    }

    /// Feeds back one event from a transport or timer.
    pub async fn handle_link_event(&mut self, event: LinkEvent) -> Option<LinkOutcome> {
        let generation = event.generation();
        if self.live_link_mut(generation).is_none() {
            debug!("dropping {event:?} from superseded link");
            return None;
        }

        match event {
            LinkEvent::LocalCandidate {
                candidate: Some(candidate),
                ..
            } => {
                if let Some(link) = self.link.as_mut() {
                    link.tally.record(&candidate);
                }
                dump_candidate("LOCAL", &candidate);
                if let Err(e) = self.signaling.emit(ClientEvent::IceCandidate { candidate }) {
                    self.report(e.into());
                }
                None
            }
            LinkEvent::LocalCandidate {
                candidate: None, ..
            } => {
                if let Some(link) = self.link.as_ref() {
                    link.tally.report();
                }
                None
            }
            LinkEvent::StateChanged { state, .. } => {
                let link = self.link.as_mut()?;
                debug!("link {generation} transport state {state:?}");
                match link.state.on_transport(state) {
                    Transition::Moved(next) => {
                        info!("link {generation} is {next:?}");
                        self.notify(NegotiatorEvent::StateChanged(next));
                        None
                    }
                    Transition::Lost => {
                        warn!("link {generation} lost ({state:?})");
                        self.notify(NegotiatorEvent::StateChanged(LinkState::Recovering));
                        Some(LinkOutcome::PeerLost)
                    }
                    Transition::Ignored => None,
                }
            }
            LinkEvent::RemoteTrack { track, .. } => {
                info!("remote {} track {}", track.kind, track.id);
                if let Some(link) = self.link.as_mut() {
                    link.remote_tracks.push(track.clone());
                }
                self.notify(NegotiatorEvent::RemoteTrack(track));
                None
            }
            LinkEvent::OfferDue { .. } => {
                let link = self.link.as_ref()?;
                if link.role == Role::Initiator && link.phase == NegotiationPhase::Idle {
                    self.create_offer().await;
                } else {
                    debug!("offer already under way for link {generation}");
                }
                None
            }
            LinkEvent::NegotiationDeadline { .. } => {
                let link = self.link.as_mut()?;
                if link.state == LinkState::Connecting {
                    warn!("link {generation} did not connect in time");
                    link.state = LinkState::Recovering;
                    self.notify(NegotiatorEvent::StateChanged(LinkState::Recovering));
                    Some(LinkOutcome::PeerLost)
                } else {
                    None
                }
            }
        }
    }

    /// Releases local media and closes the link. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.media.release();
        self.close_link().await;
    }

    async fn close_link(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        link.state.close();
        link.pending.clear();
        if let Err(e) = link.transport.close().await {
            warn!("closing link {} failed: {e}", link.generation);
        }
        if !link.remote_tracks.is_empty() {
            self.notify(NegotiatorEvent::RemoteStreamCleared);
        }
        self.notify(NegotiatorEvent::StateChanged(LinkState::Closed));
        info!("peer link {} for room {} closed", link.generation, link.room_id);
    }

    /// The current link, if it is still the one with `generation` and not closed.
    fn live_link_mut(&mut self, generation: u64) -> Option<&mut PeerLink> {
        self.link
            .as_mut()
            .filter(|l| l.generation == generation && l.state != LinkState::Closed)
    }

    fn schedule(&self, event: LinkEvent, after: Duration) {
        let tx = self.link_tx.clone();
        tokio::spawn(async move {
            sleep(after).await;
            let _ = tx.send(event);
        });
    }

    fn notify(&self, event: NegotiatorEvent) {
        let _ = self.updates.send(event);
    }

    fn report(&self, err: NegotiationError) {
        self.notify(NegotiatorEvent::Error(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::media::SyntheticDevices;
    use crate::peer::state::ConnectionState;
    use crate::peer::testing::FakeFactory;
    use crate::peer::types::PeerInfo;

    struct Side {
        neg: Negotiator,
        out: mpsc::UnboundedReceiver<ClientEvent>,
        links: mpsc::UnboundedReceiver<LinkEvent>,
        updates: mpsc::UnboundedReceiver<NegotiatorEvent>,
        factory: Arc<FakeFactory>,
        id: String,
    }

    fn quiet() -> NegotiatorOptions {
        NegotiatorOptions {
            offer_delay: Duration::from_secs(3600),
            negotiation_timeout: None,
        }
    }

    fn side(id: &str, options: NegotiatorOptions) -> Side {
        let factory = Arc::new(FakeFactory::default());
        let (signaling, out) = SignalingHandle::channel();
        let media = MediaController::new(Arc::new(SyntheticDevices::default()));
        let (neg, links, updates) = Negotiator::new(factory.clone(), signaling, media, options);
        Side {
            neg,
            out,
            links,
            updates,
            factory,
            id: id.into(),
        }
    }

    fn matched(local: &Side, remote: &Side) -> MatchInfo {
        MatchInfo {
            room_id: "room-1".into(),
            local_id: local.id.clone(),
            peer: PeerInfo {
                id: remote.id.clone(),
                name: "User1".into(),
            },
            icebreaker: None,
        }
    }

    fn candidate(line: &str) -> IceCandidate {
        IceCandidate {
            candidate: line.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn deliver(to: &mut Negotiator, event: ClientEvent) {
        match event {
            ClientEvent::CallOffer { offer } => to.handle_offer(offer).await,
            ClientEvent::CallAnswer { answer } => to.handle_answer(answer).await,
            ClientEvent::IceCandidate { candidate } => to.handle_remote_candidate(candidate).await,
            _ => {}
        }
    }

    /// Relays everything between the two sides until nothing moves.
    async fn pump(a: &mut Side, b: &mut Side) -> Vec<(String, &'static str)> {
        let mut wire = Vec::new();
        loop {
            let mut moved = false;
            while let Ok(ev) = a.links.try_recv() {
                a.neg.handle_link_event(ev).await;
                moved = true;
            }
            while let Ok(ev) = b.links.try_recv() {
                b.neg.handle_link_event(ev).await;
                moved = true;
            }
            while let Ok(ev) = a.out.try_recv() {
                wire.push((a.id.clone(), ev.name()));
                deliver(&mut b.neg, ev).await;
                moved = true;
            }
            while let Ok(ev) = b.out.try_recv() {
                wire.push((b.id.clone(), ev.name()));
                deliver(&mut a.neg, ev).await;
                moved = true;
            }
            if !moved {
                return wire;
            }
        }
    }

    fn drain_errors(updates: &mut mpsc::UnboundedReceiver<NegotiatorEvent>) -> Vec<NegotiationError> {
        let mut errors = Vec::new();
        while let Ok(ev) = updates.try_recv() {
            if let NegotiatorEvent::Error(e) = ev {
                errors.push(e);
            }
        }
        errors
    }

    #[tokio::test]
    async fn lower_id_offers_and_both_connect() {
        let mut a = side("abc123", quiet());
        let mut b = side("xyz789", quiet());

        let ma = matched(&a, &b);
        let mb = matched(&b, &a);
        assert_eq!(a.neg.start_connection(&ma).await.unwrap(), Role::Initiator);
        assert_eq!(b.neg.start_connection(&mb).await.unwrap(), Role::Responder);

        a.neg.create_offer().await;
        let wire = pump(&mut a, &mut b).await;

        assert_eq!(wire[0], ("abc123".to_string(), "call-offer"));
        assert!(wire.contains(&("xyz789".to_string(), "call-answer")));
        assert!(wire.contains(&("abc123".to_string(), "ice-candidate")));
        assert!(wire.contains(&("xyz789".to_string(), "ice-candidate")));
        assert!(!wire.contains(&("xyz789".to_string(), "call-offer")));

        assert_eq!(a.neg.link_state(), Some(LinkState::Connected));
        assert_eq!(b.neg.link_state(), Some(LinkState::Connected));
        assert_eq!(a.neg.link().unwrap().phase(), NegotiationPhase::Stable);
        assert_eq!(b.neg.link().unwrap().phase(), NegotiationPhase::Stable);
        assert!(drain_errors(&mut a.updates).is_empty());
        assert!(drain_errors(&mut b.updates).is_empty());
    }

    #[tokio::test]
    async fn offer_is_sent_at_most_once() {
        let mut a = side("abc123", quiet());
        let b = side("xyz789", quiet());
        a.neg.start_connection(&matched(&a, &b)).await.unwrap();

        a.neg.create_offer().await;
        a.neg.create_offer().await;

        assert_eq!(a.factory.last().unwrap().offers_created(), 1);
        let errors = drain_errors(&mut a.updates);
        assert!(matches!(
            errors.as_slice(),
            [NegotiationError::IllegalTransition { .. }]
        ));
    }

    #[tokio::test]
    async fn responder_refuses_to_offer() {
        let a = side("abc123", quiet());
        let mut b = side("xyz789", quiet());
        b.neg.start_connection(&matched(&b, &a)).await.unwrap();

        b.neg.create_offer().await;

        assert_eq!(b.factory.last().unwrap().offers_created(), 0);
        assert!(b.out.try_recv().is_err());
        let errors = drain_errors(&mut b.updates);
        assert!(matches!(
            errors.as_slice(),
            [NegotiationError::WrongRole {
                role: Role::Responder,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn renegotiation_sends_a_second_offer() {
        let mut a = side("abc123", quiet());
        let mut b = side("xyz789", quiet());
        let (ma, mb) = (matched(&a, &b), matched(&b, &a));
        a.neg.start_connection(&ma).await.unwrap();
        b.neg.start_connection(&mb).await.unwrap();
        a.neg.create_offer().await;
        pump(&mut a, &mut b).await;

        a.neg.renegotiate().await;
        let wire = pump(&mut a, &mut b).await;

        assert_eq!(a.factory.last().unwrap().offers_created(), 2);
        assert_eq!(b.factory.last().unwrap().answers_created(), 2);
        assert!(wire.contains(&("xyz789".to_string(), "call-answer")));
        assert_eq!(a.neg.link().unwrap().phase(), NegotiationPhase::Stable);
    }

    #[tokio::test]
    async fn answer_without_offer_is_ignored() {
        let mut a = side("abc123", quiet());
        let b = side("xyz789", quiet());
        a.neg.start_connection(&matched(&a, &b)).await.unwrap();

        a.neg.handle_answer(SessionDescription::answer("stray")).await;

        assert!(!a.factory.last().unwrap().has_remote_description().await);
        assert!(drain_errors(&mut a.updates).is_empty());
        assert_eq!(a.neg.link().unwrap().phase(), NegotiationPhase::Idle);
    }

    #[tokio::test]
    async fn rejected_offer_is_reported_not_fatal() {
        let a = side("abc123", quiet());
        let mut b = side("xyz789", quiet());
        b.neg.start_connection(&matched(&b, &a)).await.unwrap();
        b.factory.last().unwrap().reject_remote_descriptions();

        b.neg.handle_offer(SessionDescription::offer("o")).await;

        assert!(b.out.try_recv().is_err());
        assert_eq!(b.neg.link_state(), Some(LinkState::Connecting));
        let errors = drain_errors(&mut b.updates);
        assert!(matches!(
            errors.as_slice(),
            [NegotiationError::InvalidDescription(_)]
        ));
    }

    #[tokio::test]
    async fn early_candidate_is_queued_then_applied() {
        let a = side("abc123", quiet());
        let mut b = side("xyz789", quiet());
        b.neg.start_connection(&matched(&b, &a)).await.unwrap();

        b.neg
            .handle_remote_candidate(candidate("candidate:9 1 udp 1 10.0.0.9 9 typ host"))
            .await;
        assert_eq!(b.neg.link().unwrap().pending_candidates(), 1);

        b.neg.handle_offer(SessionDescription::offer("o")).await;

        let transport = b.factory.last().unwrap();
        assert_eq!(b.neg.link().unwrap().pending_candidates(), 0);
        assert_eq!(transport.applied_candidates().len(), 1);
        assert!(drain_errors(&mut b.updates).is_empty());
        assert!(matches!(b.out.try_recv(), Ok(ClientEvent::CallAnswer { .. })));
    }

    #[tokio::test]
    async fn candidate_without_link_is_discarded() {
        let mut a = side("abc123", quiet());
        a.neg.handle_remote_candidate(candidate("c")).await;
        assert!(a.factory.transports().is_empty());
        assert!(drain_errors(&mut a.updates).is_empty());
    }

    #[tokio::test]
    async fn rejected_candidate_is_swallowed() {
        let a = side("abc123", quiet());
        let mut b = side("xyz789", quiet());
        b.neg.start_connection(&matched(&b, &a)).await.unwrap();
        b.neg.handle_offer(SessionDescription::offer("o")).await;
        b.factory.last().unwrap().reject_candidates_containing("bad");

        b.neg.handle_remote_candidate(candidate("bad")).await;

        assert!(drain_errors(&mut b.updates).is_empty());
        assert_eq!(b.neg.link_state(), Some(LinkState::Connecting));
    }

    #[tokio::test]
    async fn new_match_closes_previous_link_first() {
        let mut a = side("abc123", quiet());
        let b = side("xyz789", quiet());
        let c = side("aaa000", quiet());

        a.neg.start_connection(&matched(&a, &b)).await.unwrap();
        let first = a.factory.last().unwrap();
        assert_eq!(a.neg.start_connection(&matched(&a, &c)).await.unwrap(), Role::Responder);

        assert!(first.is_closed());
        assert_eq!(a.factory.prior_closed(), vec![true, true]);
        assert_eq!(a.neg.link().unwrap().generation(), 2);
    }

    #[tokio::test]
    async fn stale_link_events_are_dropped() {
        let mut a = side("abc123", quiet());
        let b = side("xyz789", quiet());
        a.neg.start_connection(&matched(&a, &b)).await.unwrap();
        let first = a.factory.last().unwrap();
        a.neg.start_connection(&matched(&a, &b)).await.unwrap();
        while a.links.try_recv().is_ok() {}

        first.report(ConnectionState::Failed);
        let ev = a.links.try_recv().unwrap();
        assert_eq!(ev.generation(), 1);

        assert_eq!(a.neg.handle_link_event(ev).await, None);
        assert_eq!(a.neg.link_state(), Some(LinkState::Connecting));
    }

    #[tokio::test]
    async fn failure_on_live_link_is_peer_lost() {
        for reported in [ConnectionState::Failed, ConnectionState::Disconnected] {
            let mut a = side("abc123", quiet());
            let b = side("xyz789", quiet());
            a.neg.start_connection(&matched(&a, &b)).await.unwrap();
            let transport = a.factory.last().unwrap();

            transport.report(ConnectionState::Connected);
            let ev = a.links.try_recv().unwrap();
            assert_eq!(a.neg.handle_link_event(ev).await, None);

            transport.report(reported);
            let ev = a.links.try_recv().unwrap();
            assert_eq!(a.neg.handle_link_event(ev).await, Some(LinkOutcome::PeerLost));
            assert_eq!(a.neg.link_state(), Some(LinkState::Recovering));
        }
    }

    #[tokio::test]
    async fn stop_releases_everything_and_is_idempotent() {
        let mut a = side("abc123", quiet());
        let b = side("xyz789", quiet());
        a.neg.acquire_media(true, true).await.unwrap();
        let tracks: Vec<_> = a.neg.media().local().unwrap().tracks().cloned().collect();
        a.neg.start_connection(&matched(&a, &b)).await.unwrap();
        let transport = a.factory.last().unwrap();
        assert_eq!(transport.track_ids().len(), 2);

        a.neg.stop().await;

        assert!(a.neg.link().is_none());
        assert!(transport.is_closed());
        assert!(tracks.iter().all(|t| t.is_stopped()));
        assert_eq!(a.neg.media().grant(), MediaGrant::default());
        while a.updates.try_recv().is_ok() {}

        a.neg.stop().await;
        assert!(a.neg.link().is_none());
        assert!(a.updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn signaling_after_stop_is_ignored() {
        let mut a = side("abc123", quiet());
        let b = side("xyz789", quiet());
        a.neg.start_connection(&matched(&a, &b)).await.unwrap();
        a.neg.stop().await;

        a.neg.handle_offer(SessionDescription::offer("late")).await;
        a.neg.handle_answer(SessionDescription::answer("late")).await;
        a.neg.handle_remote_candidate(candidate("late")).await;

        assert!(a.out.try_recv().is_err());
        assert!(drain_errors(&mut a.updates).is_empty());
    }

    #[tokio::test]
    async fn toggles_never_renegotiate() {
        let mut a = side("abc123", quiet());
        let mut b = side("xyz789", quiet());
        a.neg.acquire_media(true, true).await.unwrap();
        b.neg.acquire_media(true, true).await.unwrap();
        let (ma, mb) = (matched(&a, &b), matched(&b, &a));
        a.neg.start_connection(&ma).await.unwrap();
        b.neg.start_connection(&mb).await.unwrap();
        a.neg.create_offer().await;
        pump(&mut a, &mut b).await;

        assert_eq!(a.neg.toggle_camera(), Some(false));
        assert_eq!(a.neg.toggle_microphone(), Some(false));
        assert_eq!(b.neg.toggle_camera(), Some(false));
        assert_eq!(a.neg.toggle_camera(), Some(true));
        let wire = pump(&mut a, &mut b).await;

        assert!(wire.is_empty());
        assert_eq!(a.factory.last().unwrap().offers_created(), 1);
        assert_eq!(b.factory.last().unwrap().answers_created(), 1);
        assert_eq!(a.neg.link_state(), Some(LinkState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn initiator_offers_after_delay() {
        let options = NegotiatorOptions {
            offer_delay: Duration::from_millis(1000),
            negotiation_timeout: None,
        };
        let mut a = side("abc123", options);
        let b = side("xyz789", options);
        a.neg.start_connection(&matched(&a, &b)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(a.links.try_recv().is_err());

        let ev = a.links.recv().await.unwrap();
        assert!(matches!(ev, LinkEvent::OfferDue { generation: 1 }));
        a.neg.handle_link_event(ev).await;
        assert!(matches!(a.out.try_recv(), Ok(ClientEvent::CallOffer { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_negotiation_is_peer_lost() {
        let options = NegotiatorOptions {
            offer_delay: Duration::from_secs(3600),
            negotiation_timeout: Some(Duration::from_secs(30)),
        };
        let mut a = side("abc123", options);
        let b = side("xyz789", options);
        a.neg.start_connection(&matched(&a, &b)).await.unwrap();

        let ev = a.links.recv().await.unwrap();
        assert!(matches!(ev, LinkEvent::NegotiationDeadline { generation: 1 }));
        assert_eq!(a.neg.handle_link_event(ev).await, Some(LinkOutcome::PeerLost));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_after_connect_is_harmless() {
        let options = NegotiatorOptions {
            offer_delay: Duration::from_secs(3600),
            negotiation_timeout: Some(Duration::from_secs(30)),
        };
        let mut a = side("abc123", options);
        let b = side("xyz789", options);
        a.neg.start_connection(&matched(&a, &b)).await.unwrap();
        a.factory.last().unwrap().report(ConnectionState::Connected);
        let ev = a.links.recv().await.unwrap();
        a.neg.handle_link_event(ev).await;

        let ev = a.links.recv().await.unwrap();
        assert!(matches!(ev, LinkEvent::NegotiationDeadline { .. }));
        assert_eq!(a.neg.handle_link_event(ev).await, None);
        assert_eq!(a.neg.link_state(), Some(LinkState::Connected));
    }
}
