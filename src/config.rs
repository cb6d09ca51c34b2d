// Application configuration.
// Release builds log at info unless the user asks for more.

use crate::peer::types::ServerConfig;
use crate::utils::add_ice_url_scheme;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;
use url::Url;

// Set to false to silence the client completely.
pub const LOGGING_ENABLED: bool = true;

pub mod dev {
    #[cfg(debug_assertions)]
    pub const VERBOSE_LOGGING: bool = true;

    #[cfg(not(debug_assertions))]
    pub const VERBOSE_LOGGING: bool = false;
}

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:3001";

const ENV_SERVER_URL: &str = "OMECHAT_SERVER_URL";
const ENV_ICE_SERVERS: &str = "OMECHAT_ICE_SERVERS";
const ENV_NEGOTIATION_TIMEOUT: &str = "OMECHAT_NEGOTIATION_TIMEOUT_SECS";

/// Runtime settings shared by the signaling channel, session and negotiator.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub server_url: String,
    pub ice_servers: Vec<ServerConfig>,
    pub connect_timeout: Duration,
    /// Pause between a peer leaving and the automatic re-queue.
    pub requeue_delay: Duration,
    /// How long a peer typing pulse stays visible without re-affirmation.
    pub typing_window: Duration,
    /// Pause between creating the peer link and the initiator's offer.
    pub offer_delay: Duration,
    /// `None` disables the stall watchdog.
    pub negotiation_timeout: Option<Duration>,
    /// Pause between a match and its conversation starter.
    pub icebreaker_delay: Duration,
    pub verbose: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.into(),
            ice_servers: default_ice_servers(),
            connect_timeout: Duration::from_secs(20),
            requeue_delay: Duration::from_secs(1),
            typing_window: Duration::from_secs(3),
            offer_delay: Duration::from_secs(1),
            negotiation_timeout: Some(Duration::from_secs(30)),
            icebreaker_delay: Duration::from_secs(5),
            verbose: dev::VERBOSE_LOGGING,
        }
    }
}

impl AppConfig {
    /// Defaults overlaid with `OMECHAT_*` environment variables.
    ///
    /// Unparseable values are ignored. The second element describes each
    /// rejected variable so the caller can report it once logging is up.
    pub fn from_env() -> (Self, Vec<String>) {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> (Self, Vec<String>) {
        let mut config = Self::default();
        let mut rejected = Vec::new();

        if let Some(raw) = lookup(ENV_SERVER_URL) {
            match Url::parse(&raw) {
                Ok(_) => config.server_url = raw,
                Err(e) => rejected.push(format!("ignoring {ENV_SERVER_URL}={raw}: {e}")),
            }
        }

        if let Some(raw) = lookup(ENV_ICE_SERVERS) {
            let servers = parse_ice_list(&raw);
            if servers.is_empty() {
                rejected.push(format!("ignoring empty {ENV_ICE_SERVERS}"));
            } else {
                config.ice_servers = servers;
            }
        }

        if let Some(raw) = lookup(ENV_NEGOTIATION_TIMEOUT) {
            match raw.parse::<u64>() {
                Ok(0) => config.negotiation_timeout = None,
                Ok(secs) => config.negotiation_timeout = Some(Duration::from_secs(secs)),
                Err(e) => rejected.push(format!("ignoring {ENV_NEGOTIATION_TIMEOUT}={raw}: {e}")),
            }
        }

        (config, rejected)
    }

    /// Replaces the ICE server list after validating every entry.
    ///
    /// Returns false and keeps the old list if any entry is rejected.
    pub fn set_ice_servers(&mut self, servers: Vec<ServerConfig>) -> bool {
        for server in &servers {
            if let Err(reason) = server.validate() {
                warn!("rejecting ICE server {}: {reason}", server.id);
                return false;
            }
        }
        self.ice_servers = servers
            .into_iter()
            .map(|mut s| {
                s.url = add_ice_url_scheme(&s);
                s
            })
            .collect();
        true
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    ["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"]
        .iter()
        .enumerate()
        .map(|(i, url)| ServerConfig {
            id: format!("default-stun-{i}"),
            r#type: "stun".into(),
            url: (*url).into(),
            username: None,
            credential: None,
        })
        .collect()
}

/// Parses a comma separated list of STUN urls, e.g. `stun.example.org:3478,stun:other:19302`.
fn parse_ice_list(raw: &str) -> Vec<ServerConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(i, url)| {
            let mut server = ServerConfig {
                id: format!("env-{i}"),
                r#type: if url.starts_with("turn:") { "turn" } else { "stun" }.into(),
                url: url.into(),
                username: None,
                credential: None,
            };
            server.url = add_ice_url_scheme(&server);
            server
        })
        .collect()
}
