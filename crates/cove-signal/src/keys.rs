//! Record-store addressing for rooms and signals.

use std::time::Duration;

use crate::signal::{Signal, SignalKind};

pub const SIGNAL_NAMESPACE: &str = "video";
const BROADCAST: &str = "broadcast";

/// Key whose presence means the room is alive. Written by the room service.
pub fn room_key(room: &str) -> String {
    format!("room:{room}")
}

/// Prefix shared by every signal record of `room`.
pub fn room_signal_prefix(room: &str) -> String {
    format!("{SIGNAL_NAMESPACE}:{room}:")
}

/// `video:{room}:{type}:{sender}:{target|broadcast}:{timestamp}`. The timestamp
/// suffix keeps bursts from one sender (candidates) from overwriting each other.
pub fn signal_key(room: &str, signal: &Signal) -> String {
    format!(
        "{}{}:{}:{}:{}",
        room_signal_prefix(room),
        signal.kind(),
        signal.sender,
        signal.target.as_deref().unwrap_or(BROADCAST),
        signal.timestamp
    )
}

/// Room codes become part of a scan prefix, so they are restricted to
/// characters that can never act as a separator or a glob.
pub fn is_valid_room_code(room: &str) -> bool {
    !room.is_empty()
        && room.len() <= 64
        && room
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Participant identities may not contain the key separator.
pub fn is_valid_identity(identity: &str) -> bool {
    !identity.trim().is_empty() && !identity.contains(':')
}

/// Per-kind record lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub candidate: Duration,
    pub description: Duration,
    pub presence: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            candidate: Duration::from_secs(30),
            description: Duration::from_secs(60),
            presence: Duration::from_secs(90),
        }
    }
}

impl TtlPolicy {
    pub fn for_kind(&self, kind: SignalKind) -> Duration {
        match kind {
            SignalKind::IceCandidate => self.candidate,
            SignalKind::Offer | SignalKind::Answer => self.description,
            SignalKind::Join | SignalKind::Leave => self.presence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{IceCandidate, JoinMarker};

    #[test_timeout::timeout]
    fn key_layout_matches_relay_format() {
        let join = Signal::join("bob", JoinMarker::fresh()).at(42);
        assert_eq!(signal_key("ABC123", &join), "video:ABC123:join:bob:broadcast:42");

        let candidate = Signal::candidate("bob", "amy", IceCandidate::new("c")).at(43);
        assert_eq!(
            signal_key("ABC123", &candidate),
            "video:ABC123:ice-candidate:bob:amy:43"
        );
        assert!(signal_key("ABC123", &candidate).starts_with(&room_signal_prefix("ABC123")));
    }

    #[test_timeout::timeout]
    fn ttl_policy_by_kind() {
        let ttl = TtlPolicy::default();
        assert_eq!(ttl.for_kind(SignalKind::IceCandidate), Duration::from_secs(30));
        assert_eq!(ttl.for_kind(SignalKind::Answer), Duration::from_secs(60));
        assert_eq!(ttl.for_kind(SignalKind::Leave), Duration::from_secs(90));
    }

    #[test_timeout::timeout]
    fn room_codes_reject_separators_and_globs() {
        assert!(is_valid_room_code("XK7-Q2"));
        assert!(!is_valid_room_code(""));
        assert!(!is_valid_room_code("a:b"));
        assert!(!is_valid_room_code("room*"));
        assert!(!is_valid_identity("a:b"));
        assert!(is_valid_identity("0b5e3c"));
    }
}
