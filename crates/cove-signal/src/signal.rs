use std::fmt;

use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The five kinds of negotiation message exchanged through a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Join,
    Offer,
    Answer,
    IceCandidate,
    Leave,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Join => "join",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
            SignalKind::Leave => "leave",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "join" => Some(SignalKind::Join),
            "offer" => Some(SignalKind::Offer),
            "answer" => Some(SignalKind::Answer),
            "ice-candidate" => Some(SignalKind::IceCandidate),
            "leave" => Some(SignalKind::Leave),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as browsers serialise it: `{ "type": "offer", "sdp": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// The `<sess-id>` field of the `o=` line. It stays fixed for the life of
    /// the peer connection that produced the description, across
    /// renegotiations and ICE restarts.
    pub fn session_id(&self) -> Option<&str> {
        self.sdp
            .lines()
            .find_map(|line| line.strip_prefix("o="))
            .and_then(|origin| origin.split_whitespace().nth(1))
    }
}

/// Connection candidate in `RTCIceCandidateInit` JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Opaque per-announcement marker carried by join signals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinMarker {
    #[serde(rename = "joinId", default)]
    pub join_id: String,
}

impl JoinMarker {
    pub fn fresh() -> Self {
        let join_id = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .map(|c| char::from(c).to_ascii_lowercase())
            .take(6)
            .collect();
        Self { join_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Join(JoinMarker),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    Leave,
}

impl SignalPayload {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalPayload::Join(_) => SignalKind::Join,
            SignalPayload::Offer(_) => SignalKind::Offer,
            SignalPayload::Answer(_) => SignalKind::Answer,
            SignalPayload::IceCandidate(_) => SignalKind::IceCandidate,
            SignalPayload::Leave => SignalKind::Leave,
        }
    }
}

/// One addressed, timestamped negotiation message. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireSignal", into = "WireSignal")]
pub struct Signal {
    pub sender: String,
    pub target: Option<String>,
    /// Epoch milliseconds, assigned by the relay on publish.
    pub timestamp: u64,
    pub payload: SignalPayload,
}

impl Signal {
    pub fn new(sender: impl Into<String>, payload: SignalPayload) -> Self {
        Self {
            sender: sender.into(),
            target: None,
            timestamp: 0,
            payload,
        }
    }

    pub fn join(sender: impl Into<String>, marker: JoinMarker) -> Self {
        Self::new(sender, SignalPayload::Join(marker))
    }

    pub fn leave(sender: impl Into<String>) -> Self {
        Self::new(sender, SignalPayload::Leave)
    }

    pub fn offer(
        sender: impl Into<String>,
        target: impl Into<String>,
        description: SessionDescription,
    ) -> Self {
        Self::new(sender, SignalPayload::Offer(description)).to(target)
    }

    pub fn answer(
        sender: impl Into<String>,
        target: impl Into<String>,
        description: SessionDescription,
    ) -> Self {
        Self::new(sender, SignalPayload::Answer(description)).to(target)
    }

    pub fn candidate(
        sender: impl Into<String>,
        target: impl Into<String>,
        candidate: IceCandidate,
    ) -> Self {
        Self::new(sender, SignalPayload::IceCandidate(candidate)).to(target)
    }

    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn kind(&self) -> SignalKind {
        self.payload.kind()
    }

    pub fn is_broadcast(&self) -> bool {
        self.target.is_none()
    }

    /// Whether `local` should act on this signal: never its own loopback, and
    /// never a signal addressed to somebody else.
    pub fn is_addressed_to(&self, local: &str) -> bool {
        if self.sender == local {
            return false;
        }
        match self.target.as_deref() {
            Some(target) => target == local,
            None => true,
        }
    }

    pub fn identity(&self) -> SignalIdentity {
        let nonce = match &self.payload {
            SignalPayload::Join(marker) if !marker.join_id.is_empty() => {
                Some(marker.join_id.clone())
            }
            _ => None,
        };
        SignalIdentity {
            kind: self.kind(),
            sender: self.sender.clone(),
            target: self.target.clone(),
            timestamp: self.timestamp,
            nonce,
        }
    }

    pub fn encode(&self) -> Result<String, SignalDecodeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, SignalDecodeError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_value(value: Value) -> Result<Self, SignalDecodeError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Dedup key for a signal. Join signals additionally carry their announcement
/// nonce because one sender may emit several joins within the same millisecond.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalIdentity {
    pub kind: SignalKind,
    pub sender: String,
    pub target: Option<String>,
    pub timestamp: u64,
    pub nonce: Option<String>,
}

impl fmt::Display for SignalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.kind,
            self.sender,
            self.target.as_deref().unwrap_or("broadcast"),
            self.timestamp
        )?;
        if let Some(nonce) = &self.nonce {
            write!(f, "-{nonce}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SignalDecodeError {
    #[error("signal has no sender")]
    MissingSender,
    #[error("{0} signal carries no payload")]
    MissingPayload(SignalKind),
    #[error("{kind} payload has the wrong shape: {detail}")]
    ShapeMismatch { kind: SignalKind, detail: String },
    #[error("signal json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON shape exchanged with the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireSignal {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub sender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub timestamp: u64,
}

impl TryFrom<WireSignal> for Signal {
    type Error = SignalDecodeError;

    fn try_from(wire: WireSignal) -> Result<Self, Self::Error> {
        if wire.sender.trim().is_empty() {
            return Err(SignalDecodeError::MissingSender);
        }
        let payload = decode_payload(wire.kind, wire.data)?;
        Ok(Signal {
            sender: wire.sender,
            target: wire.target.filter(|target| !target.is_empty()),
            timestamp: wire.timestamp,
            payload,
        })
    }
}

impl From<Signal> for WireSignal {
    fn from(signal: Signal) -> Self {
        let kind = signal.kind();
        let data = match signal.payload {
            SignalPayload::Join(marker) if marker.join_id.is_empty() => None,
            SignalPayload::Join(marker) => serde_json::to_value(marker).ok(),
            SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => {
                serde_json::to_value(desc).ok()
            }
            SignalPayload::IceCandidate(candidate) => serde_json::to_value(candidate).ok(),
            SignalPayload::Leave => None,
        };
        WireSignal {
            kind,
            sender: signal.sender,
            target: signal.target,
            data,
            timestamp: signal.timestamp,
        }
    }
}

fn decode_payload(kind: SignalKind, data: Option<Value>) -> Result<SignalPayload, SignalDecodeError> {
    let mismatch = |err: serde_json::Error| SignalDecodeError::ShapeMismatch {
        kind,
        detail: err.to_string(),
    };
    match kind {
        SignalKind::Join => match data {
            None | Some(Value::Null) => Ok(SignalPayload::Join(JoinMarker::default())),
            Some(value) => serde_json::from_value(value)
                .map(SignalPayload::Join)
                .map_err(mismatch),
        },
        SignalKind::Offer | SignalKind::Answer => {
            let value = data
                .filter(|value| !value.is_null())
                .ok_or(SignalDecodeError::MissingPayload(kind))?;
            let desc: SessionDescription = serde_json::from_value(value).map_err(mismatch)?;
            let expected = if kind == SignalKind::Offer {
                SdpKind::Offer
            } else {
                SdpKind::Answer
            };
            if desc.kind != expected {
                return Err(SignalDecodeError::ShapeMismatch {
                    kind,
                    detail: format!("description type {:?}", desc.kind),
                });
            }
            Ok(if kind == SignalKind::Offer {
                SignalPayload::Offer(desc)
            } else {
                SignalPayload::Answer(desc)
            })
        }
        SignalKind::IceCandidate => {
            let value = data
                .filter(|value| !value.is_null())
                .ok_or(SignalDecodeError::MissingPayload(kind))?;
            serde_json::from_value(value)
                .map(SignalPayload::IceCandidate)
                .map_err(mismatch)
        }
        SignalKind::Leave => Ok(SignalPayload::Leave),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn session_id_comes_from_the_origin_line() {
        let offer = SessionDescription::offer(
            "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
        );
        assert_eq!(offer.session_id(), Some("4611731400430051336"));

        let bare = SessionDescription::answer("v=0\no=alice 42 7 IN IP4 0.0.0.0\n");
        assert_eq!(bare.session_id(), Some("42"));

        assert_eq!(SessionDescription::offer("v=0").session_id(), None);
        assert_eq!(SessionDescription::offer("v=0\r\no=-\r\n").session_id(), None);
    }

    #[test_timeout::timeout]
    fn decodes_browser_offer() {
        let raw = json!({
            "type": "offer",
            "sender": "bob",
            "target": "amy",
            "data": { "type": "offer", "sdp": "v=0" },
            "timestamp": 1_700_000_000_123u64
        });
        let signal = Signal::from_value(raw).expect("decode offer");
        assert_eq!(signal.kind(), SignalKind::Offer);
        assert_eq!(signal.target.as_deref(), Some("amy"));
        assert_eq!(
            signal.payload,
            SignalPayload::Offer(SessionDescription::offer("v=0"))
        );
    }

    #[test_timeout::timeout]
    fn rejects_answer_carrying_offer_description() {
        let raw = json!({
            "type": "answer",
            "sender": "bob",
            "data": { "type": "offer", "sdp": "v=0" },
            "timestamp": 5
        });
        let err = Signal::from_value(raw).unwrap_err();
        assert!(matches!(err, SignalDecodeError::ShapeMismatch { .. }));
    }

    #[test_timeout::timeout]
    fn candidate_requires_payload() {
        let raw = json!({ "type": "ice-candidate", "sender": "bob", "timestamp": 5 });
        let err = Signal::from_value(raw).unwrap_err();
        assert!(matches!(
            err,
            SignalDecodeError::MissingPayload(SignalKind::IceCandidate)
        ));
    }

    #[test_timeout::timeout]
    fn candidate_uses_browser_field_names() {
        let mut candidate = IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host");
        candidate.sdp_mid = Some("0".into());
        candidate.sdp_mline_index = Some(0);
        let encoded = Signal::candidate("amy", "bob", candidate)
            .at(9)
            .encode()
            .expect("encode");
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["data"]["sdpMid"], "0");
        assert_eq!(value["data"]["sdpMLineIndex"], 0);
    }

    #[test_timeout::timeout]
    fn empty_target_means_broadcast() {
        let raw = json!({ "type": "leave", "sender": "bob", "target": "", "timestamp": 1 });
        let signal = Signal::from_value(raw).unwrap();
        assert!(signal.is_broadcast());
    }

    #[test_timeout::timeout]
    fn join_without_marker_decodes() {
        let raw = json!({ "type": "join", "sender": "bob", "timestamp": 1 });
        let signal = Signal::from_value(raw).unwrap();
        assert_eq!(signal.payload, SignalPayload::Join(JoinMarker::default()));
        assert_eq!(signal.identity().nonce, None);
    }

    #[test_timeout::timeout]
    fn identity_nonce_only_for_join() {
        let join_a = Signal::join("bob", JoinMarker { join_id: "a1".into() }).at(10);
        let join_b = Signal::join("bob", JoinMarker { join_id: "b2".into() }).at(10);
        assert_ne!(join_a.identity(), join_b.identity());
        assert_eq!(join_a.identity().to_string(), "join-bob-broadcast-10-a1");

        let offer = Signal::offer("bob", "amy", SessionDescription::offer("x")).at(10);
        assert_eq!(offer.identity().nonce, None);
        assert_eq!(offer.identity().to_string(), "offer-bob-amy-10");
    }

    #[test_timeout::timeout]
    fn addressing_filters_loopback_and_foreign_targets() {
        let broadcast = Signal::leave("bob");
        assert!(broadcast.is_addressed_to("amy"));
        assert!(!broadcast.is_addressed_to("bob"));

        let targeted = Signal::answer("bob", "carl", SessionDescription::answer("x"));
        assert!(targeted.is_addressed_to("carl"));
        assert!(!targeted.is_addressed_to("amy"));
    }

    #[test_timeout::timeout]
    fn fresh_markers_differ() {
        let a = JoinMarker::fresh();
        let b = JoinMarker::fresh();
        assert_eq!(a.join_id.len(), 6);
        assert_ne!(a, b);
    }
}
