use std::env;
use std::str::FromStr;
use std::time::Duration;

use cove_signal::TtlPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" | "mem" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub redis_url: String,
    pub store_backend: StoreBackend,
    /// Accept signals for any well-formed room code, without a `room:{code}` key.
    pub open_rooms: bool,
    pub ttl: TtlPolicy,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ttl = TtlPolicy {
            candidate: secs_var("COVE_TTL_CANDIDATE_SECS").unwrap_or(defaults.ttl.candidate),
            description: secs_var("COVE_TTL_DESCRIPTION_SECS").unwrap_or(defaults.ttl.description),
            presence: secs_var("COVE_TTL_PRESENCE_SECS").unwrap_or(defaults.ttl.presence),
        };

        Self {
            addr: env::var("COVE_RELAY_ADDR").unwrap_or(defaults.addr),
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            store_backend: env::var("COVE_STORE_BACKEND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.store_backend),
            open_rooms: env::var("COVE_OPEN_ROOMS")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.open_rooms),
            ttl,
        }
    }
}

fn secs_var(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            store_backend: StoreBackend::Redis,
            open_rooms: false,
            ttl: TtlPolicy::default(),
        }
    }
}
