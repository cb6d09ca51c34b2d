use crate::logger::dump_candidate;
use crate::peer::transport::PeerTransport;
use crate::peer::types::IceCandidate;
use tracing::{debug, info, warn};

/// Remote candidates that arrived before the remote description.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: Vec<IceCandidate>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: IceCandidate) {
        debug!("remote description not set yet, queuing candidate");
        self.queue.push(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Applies every queued candidate in arrival order.
    ///
    /// A rejected candidate is logged and skipped; the rest are still applied.
    pub async fn flush(&mut self, transport: &dyn PeerTransport) -> usize {
        let candidates: Vec<_> = self.queue.drain(..).collect();
        let mut applied = 0;
        for candidate in candidates {
            dump_candidate("PENDING", &candidate);
            match transport.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => warn!("failed to apply pending candidate: {e}"),
            }
        }
        applied
    }
}

/// Running count of local candidate types, reported once gathering ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateTally {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateTally {
    pub fn record(&mut self, candidate: &IceCandidate) {
        let line = &candidate.candidate;
        if line.contains("typ host") {
            self.host += 1;
        } else if line.contains("typ srflx") {
            self.srflx += 1;
        } else if line.contains("typ relay") {
            self.relay += 1;
        } else {
            self.other += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }

    pub fn report(&self) {
        info!(
            "candidate gathering complete: {} candidates ({} host, {} srflx, {} relay)",
            self.total(),
            self.host,
            self.srflx,
            self.relay
        );
        if self.srflx == 0 && self.relay == 0 {
            warn!("only host candidates gathered, peers behind NAT may not connect");
        }
    }
}
