//! In-memory transport used by the unit tests.
//!
//! Descriptions are opaque strings; a fake link reports `connected` once it
//! holds a local and a remote description and has applied at least one remote
//! candidate.

use crate::error::NegotiationError;
use crate::peer::media::LocalTrack;
use crate::peer::state::ConnectionState;
use crate::peer::transport::{LinkEventSender, PeerTransport, TransportFactory};
use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct FakeInner {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    tracks: Vec<String>,
    applied: Vec<IceCandidate>,
    offers: usize,
    answers: usize,
    connected: bool,
    closed: bool,
    reject_candidates: Option<String>,
    reject_remote: bool,
}

pub struct FakeTransport {
    inner: Mutex<FakeInner>,
    events: Option<LinkEventSender>,
}

impl FakeTransport {
    pub fn new(events: LinkEventSender) -> Self {
        Self {
            inner: Mutex::new(FakeInner::default()),
            events: Some(events),
        }
    }

    /// A transport that reports nothing back.
    pub fn detached() -> Self {
        Self {
            inner: Mutex::new(FakeInner::default()),
            events: None,
        }
    }

    pub fn generation(&self) -> Option<u64> {
        self.events.as_ref().map(LinkEventSender::generation)
    }

    pub fn reject_candidates_containing(&self, needle: &str) {
        self.inner.lock().unwrap().reject_candidates = Some(needle.into());
    }

    pub fn reject_remote_descriptions(&self) {
        self.inner.lock().unwrap().reject_remote = true;
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().unwrap().applied.clone()
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().tracks.clone()
    }

    pub fn offers_created(&self) -> usize {
        self.inner.lock().unwrap().offers
    }

    pub fn answers_created(&self) -> usize {
        self.inner.lock().unwrap().answers
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Pushes a transport state report as the real stack would.
    pub fn report(&self, state: ConnectionState) {
        if let Some(events) = &self.events {
            events.state_changed(state);
        }
    }

    fn gather(&self, inner: &FakeInner) {
        let Some(events) = &self.events else {
            return;
        };
        let port = 50_000 + events.generation() * 10 + (inner.offers + inner.answers) as u64;
        events.local_candidate(Some(IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 {port} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        events.local_candidate(None);
        events.state_changed(ConnectionState::Connecting);
    }

    fn maybe_connected(&self, inner: &mut FakeInner) {
        if inner.connected || inner.closed {
            return;
        }
        if inner.local.is_some() && inner.remote.is_some() && !inner.applied.is_empty() {
            inner.connected = true;
            if let Some(events) = &self.events {
                events.state_changed(ConnectionState::Connected);
            }
        }
    }
}

fn closed() -> NegotiationError {
    NegotiationError::InvalidDescription("transport is closed".into())
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        self.inner.lock().unwrap().tracks.push(track.id().to_owned());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(closed());
        }
        inner.offers += 1;
        let offer = SessionDescription::offer(format!("fake-offer-{}", inner.offers));
        inner.local = Some(offer.clone());
        self.gather(&inner);
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(closed());
        }
        if !matches!(inner.remote, Some(SessionDescription { kind: SdpKind::Offer, .. })) {
            return Err(NegotiationError::InvalidDescription(
                "no remote offer to answer".into(),
            ));
        }
        inner.answers += 1;
        let answer = SessionDescription::answer(format!("fake-answer-{}", inner.answers));
        inner.local = Some(answer.clone());
        self.gather(&inner);
        self.maybe_connected(&mut inner);
        Ok(answer)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(closed());
        }
        if inner.reject_remote {
            return Err(NegotiationError::InvalidDescription(
                "remote description rejected".into(),
            ));
        }
        inner.remote = Some(desc);
        self.maybe_connected(&mut inner);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.inner.lock().unwrap().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.remote.is_none() {
            return Err(NegotiationError::InvalidDescription(
                "remote description not set".into(),
            ));
        }
        if let Some(needle) = &inner.reject_candidates {
            if candidate.candidate.contains(needle.as_str()) {
                return Err(NegotiationError::InvalidDescription(
                    "candidate rejected".into(),
                ));
            }
        }
        inner.applied.push(candidate);
        self.maybe_connected(&mut inner);
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.closed {
            inner.closed = true;
            if let Some(events) = &self.events {
                events.state_changed(ConnectionState::Closed);
            }
        }
        Ok(())
    }
}

/// Hands out [`FakeTransport`]s and remembers each of them.
#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<Arc<FakeTransport>>>,
    /// For each creation, whether every earlier transport was already closed.
    prior_closed: Mutex<Vec<bool>>,
}

impl FakeFactory {
    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.created.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Arc<FakeTransport>> {
        self.created.lock().unwrap().last().cloned()
    }

    pub fn prior_closed(&self) -> Vec<bool> {
        self.prior_closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerTransport>, NegotiationError> {
        let mut created = self.created.lock().unwrap();
        let all_closed = created.iter().all(|t| t.is_closed());
        self.prior_closed.lock().unwrap().push(all_closed);
        let transport = Arc::new(FakeTransport::new(events));
        created.push(transport.clone());
        Ok(transport)
    }
}
