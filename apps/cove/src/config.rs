use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One STUN or TURN entry handed to every peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }
}

/// Public STUN servers plus the open relay TURN entries.
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    let mut servers: Vec<IceServerConfig> = [
        "stun:stun.l.google.com:19302",
        "stun:stun1.l.google.com:19302",
        "stun:stun2.l.google.com:19302",
        "stun:stun3.l.google.com:19302",
        "stun:stun4.l.google.com:19302",
        "stun:stun.services.mozilla.com",
    ]
    .into_iter()
    .map(IceServerConfig::stun)
    .collect();
    for url in [
        "turn:openrelay.metered.ca:80",
        "turn:openrelay.metered.ca:443",
        "turn:openrelay.metered.ca:443?transport=tcp",
    ] {
        servers.push(IceServerConfig::turn(url, "openrelayproject", "openrelayproject"));
    }
    servers
}

/// Timers that drive a call session.
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub poll_interval: Duration,
    /// How far back the bus starts reading when a session begins.
    pub lookback: Duration,
    pub reconcile_interval: Duration,
    pub reconcile_lookback: Duration,
    pub first_reconcile_delay: Duration,
    /// Offsets from session start at which join is announced.
    pub announce_schedule: Vec<Duration>,
    /// Steady re-announcement once the schedule is exhausted.
    pub presence_interval: Duration,
    pub max_ice_restarts: u32,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            lookback: Duration::from_millis(30_000),
            reconcile_interval: Duration::from_millis(2_000),
            reconcile_lookback: Duration::from_millis(30_000),
            first_reconcile_delay: Duration::from_millis(800),
            announce_schedule: vec![
                Duration::ZERO,
                Duration::from_millis(1_500),
                Duration::from_millis(4_000),
            ],
            presence_interval: Duration::from_millis(20_000),
            max_ice_restarts: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: String,
    pub room: Option<String>,
    pub identity: Option<String>,
    pub call: CallConfig,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://localhost:8080".to_string(),
            room: None,
            identity: None,
            call: CallConfig::default(),
            ice_servers: default_ice_servers(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let call = CallConfig {
            poll_interval: millis_var("COVE_POLL_INTERVAL_MS").unwrap_or(defaults.call.poll_interval),
            lookback: millis_var("COVE_LOOKBACK_MS").unwrap_or(defaults.call.lookback),
            reconcile_interval: millis_var("COVE_RECONCILE_INTERVAL_MS")
                .unwrap_or(defaults.call.reconcile_interval),
            reconcile_lookback: millis_var("COVE_RECONCILE_LOOKBACK_MS")
                .unwrap_or(defaults.call.reconcile_lookback),
            presence_interval: millis_var("COVE_PRESENCE_INTERVAL_MS")
                .unwrap_or(defaults.call.presence_interval),
            max_ice_restarts: env::var("COVE_MAX_ICE_RESTARTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.call.max_ice_restarts),
            ..defaults.call
        };
        // Localhost-only runs skip STUN/TURN entirely.
        let ice_servers = if env::var("COVE_LOCALHOST_ONLY").is_ok() {
            Vec::new()
        } else {
            env::var("COVE_ICE_SERVERS")
                .ok()
                .and_then(|raw| parse_ice_servers(&raw))
                .unwrap_or(defaults.ice_servers)
        };

        Self {
            relay_url: env::var("COVE_RELAY_URL").unwrap_or(defaults.relay_url),
            room: env::var("COVE_ROOM").ok().filter(|v| !v.is_empty()),
            identity: env::var("COVE_IDENTITY").ok().filter(|v| !v.is_empty()),
            call,
            ice_servers,
        }
    }
}

/// JSON array of `{urls, username?, credential?}`; `None` when unusable.
pub fn parse_ice_servers(raw: &str) -> Option<Vec<IceServerConfig>> {
    match serde_json::from_str::<Vec<IceServerConfig>>(raw) {
        Ok(servers) if servers.iter().all(|s| !s.urls.is_empty()) => Some(servers),
        Ok(_) => {
            warn!("COVE_ICE_SERVERS entry without urls; using defaults");
            None
        }
        Err(err) => {
            warn!(error = %err, "invalid COVE_ICE_SERVERS; using defaults");
            None
        }
    }
}

fn millis_var(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn default_ice_list_has_stun_and_turn() {
        let servers = default_ice_servers();
        assert_eq!(servers.len(), 9);
        assert!(servers[0].username.is_none());
        let turn = servers.last().unwrap();
        assert_eq!(turn.urls, vec!["turn:openrelay.metered.ca:443?transport=tcp".to_string()]);
        assert_eq!(turn.credential.as_deref(), Some("openrelayproject"));
    }

    #[test_timeout::timeout]
    fn ice_servers_from_json() {
        let servers = parse_ice_servers(
            r#"[{"urls":["stun:stun.example.org"]},
                {"urls":["turn:turn.example.org:3478"],"username":"u","credential":"p"}]"#,
        )
        .unwrap();
        assert_eq!(servers[0], IceServerConfig::stun("stun:stun.example.org"));
        assert_eq!(servers[1], IceServerConfig::turn("turn:turn.example.org:3478", "u", "p"));

        assert!(parse_ice_servers("not json").is_none());
        assert!(parse_ice_servers(r#"[{"urls":[]}]"#).is_none());
    }

    #[test_timeout::timeout]
    fn call_defaults() {
        let call = CallConfig::default();
        assert_eq!(call.poll_interval, Duration::from_millis(500));
        assert_eq!(call.announce_schedule.len(), 3);
        assert_eq!(call.max_ice_restarts, 1);
    }
}
