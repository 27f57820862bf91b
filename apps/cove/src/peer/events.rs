use crate::transport::{ConnectionState, RemoteStream};

/// What a running call reports to whoever drives the UI.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A remote track arrived; `stream` holds every track received from the peer so far.
    RemoteStreamAdded { peer_id: String, stream: RemoteStream },
    /// The peer's entry was torn down. Fires at most once per entry.
    RemoteStreamRemoved { peer_id: String },
    ConnectionStateChanged { peer_id: String, state: ConnectionState },
    /// The room no longer exists; every entry has been closed.
    RoomClosed,
}

impl CallEvent {
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            CallEvent::RemoteStreamAdded { peer_id, .. }
            | CallEvent::RemoteStreamRemoved { peer_id }
            | CallEvent::ConnectionStateChanged { peer_id, .. } => Some(peer_id),
            CallEvent::RoomClosed => None,
        }
    }
}
