//! The connection primitive each Peer Entry drives.

pub mod mock;
pub mod rtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cove_signal::{IceCandidate, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::{LocalMedia, TrackKind};

pub use rtc::{RtcTransport, RtcTransportFactory};
pub use mock::{MockCall, MockScript, MockTransport, MockTransportFactory};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error("operation not valid in signaling state {0:?}")]
    InvalidState(SignalingState),
    #[error("no remote description set")]
    NoRemoteDescription,
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }

    /// Failed, closed and disconnected connections need renegotiation.
    pub fn is_broken(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// Lost or failed connectivity, even if the peer connection has not caught up yet.
    pub fn is_broken(&self) -> bool {
        matches!(
            self,
            IceConnectionState::Disconnected | IceConnectionState::Failed | IceConnectionState::Closed
        )
    }
}

/// Media track received from a remote participant.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    /// Readable RTP source when the transport is a real peer connection.
    pub rtc: Option<Arc<webrtc::track::track_remote::TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// The tracks one remote participant is currently sending us.
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Adds or replaces `track`; a track from a new stream id starts a new stream.
    pub fn with_track(mut self, track: RemoteTrack) -> Self {
        if self.id != track.stream_id {
            self.id = track.stream_id.clone();
            self.tracks.clear();
        }
        self.tracks.retain(|existing| existing.id != track.id);
        self.tracks.push(track);
        self
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    IceConnectionState(IceConnectionState),
    RemoteTrack(RemoteTrack),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    /// The remote description currently applied, if any.
    async fn remote_description(&self) -> Option<SessionDescription>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;
    fn ice_connection_state(&self) -> IceConnectionState;
    async fn close(&self) -> Result<(), TransportError>;

    /// Creates an ICE-restart offer and installs it as the local description.
    async fn restart_ice(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.create_offer(true).await?;
        self.set_local_description(offer.clone()).await?;
        Ok(offer)
    }
}

pub struct TransportHandle {
    pub transport: Arc<dyn PeerTransport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Builds a connection to `peer_id` with every track of `media` attached.
    async fn create(&self, peer_id: &str, media: &LocalMedia) -> Result<TransportHandle, TransportError>;
}
