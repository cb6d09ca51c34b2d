use crate::config::AppConfig;
use crate::peer::types::IceCandidate;
use tracing::{debug, info, Level};
use webrtc::peer_connection::RTCPeerConnection;

/// Installs the global `tracing` subscriber.
///
/// Honours [`crate::config::LOGGING_ENABLED`]; calling it twice is harmless,
/// the second installation attempt is ignored.
pub fn init(config: &AppConfig) {
    let Some(level) = max_level(config) else {
        return;
    };

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

fn max_level(config: &AppConfig) -> Option<Level> {
    if !crate::config::LOGGING_ENABLED {
        return None;
    }
    Some(if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    })
}

/// Trickle candidate as it is forwarded or applied
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index, cand.username_fragment
    );
}

/// Snapshot of the nominated candidate pair, useful right before a link is torn down.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
