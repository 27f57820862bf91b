//! Scripted in-process transport. It records every call made on it and
//! "connects" as soon as both descriptions are in place and signaling is
//! stable, which is all the negotiation logic can observe of a real link.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cove_signal::{IceCandidate, SdpKind, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ConnectionState, IceConnectionState, PeerTransport, RemoteTrack, SignalingState,
    TransportError, TransportEvent, TransportFactory, TransportHandle,
};
use crate::media::{LocalMedia, TrackKind};

/// SDP session ids are unique per transport, like a browser's.
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1_000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

#[derive(Debug, Clone)]
pub struct MockScript {
    /// Local candidates emitted after each local description.
    pub local_candidates: usize,
    /// Delay inside create_offer/create_answer, to widen interleaving windows.
    pub negotiation_delay: Option<Duration>,
    pub auto_connect: bool,
    pub send_tracks: bool,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            local_candidates: 1,
            negotiation_delay: None,
            auto_connect: true,
            send_tracks: true,
        }
    }
}

#[derive(Debug)]
struct MockState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    signaling: SignalingState,
    connection: ConnectionState,
    ice: IceConnectionState,
    calls: Vec<MockCall>,
    /// `<sess-version>` of the last description this side created.
    version: u32,
    candidates_sent: usize,
    tracks_sent: bool,
}

pub struct MockTransport {
    local_id: String,
    peer_id: String,
    script: MockScript,
    stream_id: String,
    session: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new(
        local_id: &str,
        peer_id: &str,
        script: MockScript,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            local_id: local_id.to_string(),
            peer_id: peer_id.to_string(),
            script,
            stream_id: format!("{local_id}-stream"),
            session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            events,
            state: Mutex::new(MockState {
                local: None,
                remote: None,
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                ice: IceConnectionState::New,
                calls: Vec::new(),
                version: 0,
                candidates_sent: 0,
                tracks_sent: false,
            }),
        });
        (transport, rx)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Candidates applied so far, in application order.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// SDP session id stamped on every description this transport creates.
    pub fn session_id(&self) -> String {
        self.session.to_string()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().connection == ConnectionState::Closed
    }

    /// Drives the connection into `state` as if the network had changed.
    pub fn force_state(&self, state: ConnectionState) {
        {
            let mut inner = self.state.lock();
            if inner.connection == ConnectionState::Closed {
                return;
            }
            inner.connection = state;
        }
        let _ = self.events.send(TransportEvent::ConnectionState(state));
    }

    /// Reports an ICE connectivity change without touching the connection state.
    pub fn force_ice_state(&self, state: IceConnectionState) {
        {
            let mut inner = self.state.lock();
            if inner.connection == ConnectionState::Closed {
                return;
            }
            inner.ice = state;
        }
        let _ = self.events.send(TransportEvent::IceConnectionState(state));
    }

    fn sdp(&self, version: u32, extra: &str) -> String {
        format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns={}\r\na=msid-semantic: WMS {}\r\n{}",
            self.session, version, self.local_id, self.stream_id, extra
        )
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.state.lock().signaling == SignalingState::Closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn pause(&self) {
        if let Some(delay) = self.script.negotiation_delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn emit_local_candidates(&self) {
        let batch: Vec<IceCandidate> = {
            let mut inner = self.state.lock();
            let start = inner.candidates_sent;
            inner.candidates_sent += self.script.local_candidates;
            (start..inner.candidates_sent)
                .map(|n| {
                    let mut candidate = IceCandidate::new(format!(
                        "candidate:{}-{} 1 udp 1 127.0.0.1 {}",
                        self.local_id,
                        n,
                        9000 + n
                    ));
                    candidate.sdp_mid = Some("0".into());
                    candidate.sdp_mline_index = Some(0);
                    candidate
                })
                .collect()
        };
        for candidate in batch {
            let _ = self.events.send(TransportEvent::LocalCandidate(candidate));
        }
    }

    /// Connects once both descriptions are set and signaling is stable.
    fn maybe_connect(&self) {
        let send_tracks = {
            let mut inner = self.state.lock();
            let ready = inner.signaling == SignalingState::Stable
                && inner.local.is_some()
                && inner.remote.is_some();
            if !ready || !self.script.auto_connect || inner.connection == ConnectionState::Connected
            {
                return;
            }
            inner.connection = ConnectionState::Connected;
            inner.ice = IceConnectionState::Connected;
            let send_tracks = self.script.send_tracks && !inner.tracks_sent;
            inner.tracks_sent |= send_tracks;
            send_tracks
        };
        let _ = self
            .events
            .send(TransportEvent::ConnectionState(ConnectionState::Connecting));
        let _ = self
            .events
            .send(TransportEvent::IceConnectionState(IceConnectionState::Connected));
        if send_tracks {
            for (kind, suffix) in [(TrackKind::Video, "video"), (TrackKind::Audio, "audio")] {
                let _ = self.events.send(TransportEvent::RemoteTrack(RemoteTrack {
                    id: format!("{}-{suffix}", self.peer_id),
                    stream_id: format!("{}-stream", self.peer_id),
                    kind,
                    rtc: None,
                }));
            }
        }
        let _ = self
            .events
            .send(TransportEvent::ConnectionState(ConnectionState::Connected));
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        self.state.lock().calls.push(MockCall::CreateOffer { ice_restart });
        self.pause().await;
        self.ensure_open()?;
        let version = {
            let mut inner = self.state.lock();
            inner.version += 1;
            inner.version
        };
        let extra = if ice_restart { "a=ice-options:ice-restart\r\n" } else { "" };
        Ok(SessionDescription::offer(self.sdp(version, extra)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.state.lock().calls.push(MockCall::CreateAnswer);
        self.pause().await;
        let mut inner = self.state.lock();
        match inner.signaling {
            SignalingState::HaveRemoteOffer => {
                inner.version += 1;
                Ok(SessionDescription::answer(self.sdp(inner.version, "")))
            }
            SignalingState::Closed => Err(TransportError::Closed),
            other => Err(TransportError::InvalidState(other)),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        {
            let mut inner = self.state.lock();
            inner.calls.push(MockCall::SetLocal(desc.kind));
            let next = match (desc.kind, inner.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpKind::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (_, SignalingState::Closed) => return Err(TransportError::Closed),
                (_, other) => return Err(TransportError::InvalidState(other)),
            };
            inner.signaling = next;
            inner.local = Some(desc);
        }
        self.emit_local_candidates();
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        {
            let mut inner = self.state.lock();
            inner.calls.push(MockCall::SetRemote(desc.kind));
            let next = match (desc.kind, inner.signaling) {
                (SdpKind::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    SignalingState::HaveRemoteOffer
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (_, SignalingState::Closed) => return Err(TransportError::Closed),
                (_, other) => return Err(TransportError::InvalidState(other)),
            };
            inner.signaling = next;
            inner.remote = Some(desc);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut inner = self.state.lock();
        if inner.signaling == SignalingState::Closed {
            return Err(TransportError::Closed);
        }
        if inner.remote.is_none() {
            return Err(TransportError::NoRemoteDescription);
        }
        inner.calls.push(MockCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.state.lock();
        if inner.signaling == SignalingState::Closed {
            return Ok(());
        }
        inner.calls.push(MockCall::Close);
        inner.signaling = SignalingState::Closed;
        inner.connection = ConnectionState::Closed;
        inner.ice = IceConnectionState::Closed;
        Ok(())
    }
}

/// Hands out [`MockTransport`]s and keeps every one it built, per peer, so
/// tests can inspect and drive them.
pub struct MockTransportFactory {
    local_id: String,
    script: MockScript,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new(local_id: impl Into<String>, script: MockScript) -> Self {
        Self {
            local_id: local_id.into(),
            script,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn transports_for(&self, peer_id: &str) -> Vec<Arc<MockTransport>> {
        self.created
            .lock()
            .iter()
            .filter(|t| t.peer_id() == peer_id)
            .cloned()
            .collect()
    }

    pub fn latest(&self, peer_id: &str) -> Option<Arc<MockTransport>> {
        self.transports_for(peer_id).pop()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn open_count(&self) -> usize {
        self.created.lock().iter().filter(|t| !t.is_closed()).count()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(&self, peer_id: &str, _media: &LocalMedia) -> Result<TransportHandle, TransportError> {
        let (transport, events) = MockTransport::new(&self.local_id, peer_id, self.script.clone());
        self.created.lock().push(Arc::clone(&transport));
        Ok(TransportHandle { transport, events })
    }
}
