//! Shared signaling protocol for cove rooms.
//!
//! Both the relay server and the call client depend on this crate: it owns the
//! wire shape of a [`Signal`], how signals are addressed inside the record
//! store, how long each kind of record lives, and the two seams every other
//! component talks through ([`store::SignalStore`] and [`relay::SignalRelay`]).

pub mod clock;
pub mod keys;
pub mod presence;
pub mod relay;
pub mod signal;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use keys::TtlPolicy;
pub use presence::PresenceSnapshot;
pub use relay::{
    FetchResponse, HttpRelay, PublishRequest, PublishResponse, RelayError, RoomExistsResponse,
    SignalRelay, StoreRelay,
};
pub use signal::{
    IceCandidate, JoinMarker, SdpKind, SessionDescription, Signal, SignalDecodeError,
    SignalIdentity, SignalKind, SignalPayload, WireSignal,
};
pub use store::{MemoryStore, SignalStore, StoreError};
