//! Signal Relay: a typed, self-expiring log of signals per room.

mod http;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::keys::{self, TtlPolicy};
use crate::signal::Signal;
use crate::store::{SignalStore, StoreError};

pub use http::{FetchResponse, HttpRelay, PublishRequest, PublishResponse, RoomExistsResponse};

const MAX_STAMP_ATTEMPTS: usize = 32;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("room {0} no longer exists")]
    RoomGone(String),
    #[error("invalid signal: {0}")]
    InvalidSignal(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Stores `signal` for `room` and returns the timestamp the relay assigned.
    async fn publish(&self, room: &str, signal: Signal) -> Result<u64, RelayError>;

    /// Live signals of `room` stamped strictly after `watermark`. A room that
    /// no longer exists yields an empty list, not an error.
    async fn fetch_since(&self, room: &str, watermark: u64) -> Result<Vec<Signal>, RelayError>;

    async fn room_exists(&self, room: &str) -> Result<bool, RelayError>;
}

#[async_trait]
impl<T: SignalRelay + ?Sized> SignalRelay for Arc<T> {
    async fn publish(&self, room: &str, signal: Signal) -> Result<u64, RelayError> {
        (**self).publish(room, signal).await
    }

    async fn fetch_since(&self, room: &str, watermark: u64) -> Result<Vec<Signal>, RelayError> {
        (**self).fetch_since(room, watermark).await
    }

    async fn room_exists(&self, room: &str) -> Result<bool, RelayError> {
        (**self).room_exists(room).await
    }
}

/// Relay backed directly by a [`SignalStore`]. The relay owns timestamping so
/// that stamps are unique per key even when one sender bursts.
pub struct StoreRelay<S> {
    store: S,
    clock: Arc<dyn Clock>,
    ttl: TtlPolicy,
    open_rooms: bool,
    last_stamp: Mutex<u64>,
}

impl<S: SignalStore> StoreRelay<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            ttl: TtlPolicy::default(),
            open_rooms: false,
            last_stamp: Mutex::new(0),
        }
    }

    pub fn with_ttl(mut self, ttl: TtlPolicy) -> Self {
        self.ttl = ttl;
        self
    }

    /// Treat every well-formed room code as existing.
    pub fn with_open_rooms(mut self, open: bool) -> Self {
        self.open_rooms = open;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn ttl(&self) -> TtlPolicy {
        self.ttl
    }

    fn next_stamp(&self) -> u64 {
        let now = self.clock.now_millis();
        let mut last = self.last_stamp.lock();
        let stamp = now.max(*last + 1);
        *last = stamp;
        stamp
    }

    fn note_stamp(&self, stamp: u64) {
        let mut last = self.last_stamp.lock();
        if stamp > *last {
            *last = stamp;
        }
    }

    fn validate(room: &str, signal: &Signal) -> Result<(), RelayError> {
        if !keys::is_valid_room_code(room) {
            return Err(RelayError::InvalidSignal(format!("bad room code {room:?}")));
        }
        if !keys::is_valid_identity(&signal.sender) {
            return Err(RelayError::InvalidSignal(format!(
                "bad sender {:?}",
                signal.sender
            )));
        }
        if let Some(target) = &signal.target {
            if !keys::is_valid_identity(target) {
                return Err(RelayError::InvalidSignal(format!("bad target {target:?}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: SignalStore> SignalRelay for StoreRelay<S> {
    async fn publish(&self, room: &str, mut signal: Signal) -> Result<u64, RelayError> {
        Self::validate(room, &signal)?;
        if !self.room_exists(room).await? {
            return Err(RelayError::RoomGone(room.to_string()));
        }

        let ttl = self.ttl.for_kind(signal.kind());
        let mut stamp = self.next_stamp();
        for _ in 0..MAX_STAMP_ATTEMPTS {
            signal.timestamp = stamp;
            let key = keys::signal_key(room, &signal);
            let value = signal
                .encode()
                .map_err(|err| RelayError::InvalidSignal(err.to_string()))?;
            if self.store.put_if_absent(&key, &value, ttl).await? {
                trace!(room = %room, key = %key, "signal stored");
                return Ok(stamp);
            }
            debug!(room = %room, key = %key, "signal key taken; bumping stamp");
            stamp += 1;
            self.note_stamp(stamp);
        }
        Err(StoreError::Conflict(keys::signal_key(room, &signal)).into())
    }

    async fn fetch_since(&self, room: &str, watermark: u64) -> Result<Vec<Signal>, RelayError> {
        if !keys::is_valid_room_code(room) {
            return Ok(Vec::new());
        }
        let raw = self.store.scan_prefix(&keys::room_signal_prefix(room)).await?;
        let mut signals: Vec<Signal> = raw
            .iter()
            .filter_map(|value| match Signal::decode(value) {
                Ok(signal) => Some(signal),
                Err(err) => {
                    debug!(room = %room, error = %err, "skipping undecodable signal record");
                    None
                }
            })
            .filter(|signal| signal.timestamp > watermark)
            .collect();
        signals.sort_by_key(|signal| signal.timestamp);
        Ok(signals)
    }

    async fn room_exists(&self, room: &str) -> Result<bool, RelayError> {
        if !keys::is_valid_room_code(room) {
            return Ok(false);
        }
        if self.open_rooms {
            return Ok(true);
        }
        Ok(self.store.exists(&keys::room_key(room)).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::signal::{IceCandidate, JoinMarker, SignalKind};
    use crate::store::MemoryStore;

    async fn relay() -> (ManualClock, StoreRelay<Arc<MemoryStore>>) {
        let clock = ManualClock::new(1_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        store
            .put_if_absent(&keys::room_key("ROOM1"), "1", Duration::from_secs(600))
            .await
            .unwrap();
        let relay = StoreRelay::new(store, Arc::new(clock.clone()));
        (clock, relay)
    }

    #[test_timeout::tokio_timeout_test]
    async fn burst_in_one_millisecond_gets_distinct_stamps() {
        let (_clock, relay) = relay().await;
        let mut stamps = Vec::new();
        for n in 0..5 {
            let signal = Signal::candidate("bob", "amy", IceCandidate::new(format!("c{n}")));
            stamps.push(relay.publish("ROOM1", signal).await.unwrap());
        }
        assert_eq!(stamps, (1_000_000..1_000_005).collect::<Vec<_>>());
        let fetched = relay.fetch_since("ROOM1", 0).await.unwrap();
        assert_eq!(fetched.len(), 5);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stamp_bumps_past_foreign_key() {
        let (_clock, relay) = relay().await;
        let taken = Signal::leave("bob").at(1_000_000);
        relay
            .store()
            .put_if_absent(
                &keys::signal_key("ROOM1", &taken),
                &taken.encode().unwrap(),
                Duration::from_secs(90),
            )
            .await
            .unwrap();
        let stamp = relay.publish("ROOM1", Signal::leave("bob")).await.unwrap();
        assert_eq!(stamp, 1_000_001);
    }

    #[test_timeout::tokio_timeout_test]
    async fn publish_requires_live_room() {
        let (_clock, relay) = relay().await;
        let err = relay
            .publish("GHOST", Signal::join("bob", JoinMarker::fresh()))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::RoomGone(room) if room == "GHOST"));

        let open = StoreRelay::new(
            MemoryStore::new(Arc::new(ManualClock::new(5))),
            Arc::new(ManualClock::new(5)),
        )
        .with_open_rooms(true);
        assert!(open.publish("GHOST", Signal::leave("bob")).await.is_ok());
    }

    #[test_timeout::tokio_timeout_test]
    async fn fetch_is_exclusive_sorted_and_tolerates_missing_room() {
        let (clock, relay) = relay().await;
        relay.publish("ROOM1", Signal::join("bob", JoinMarker::fresh())).await.unwrap();
        clock.advance(10);
        let second = relay.publish("ROOM1", Signal::leave("bob")).await.unwrap();

        let all = relay.fetch_since("ROOM1", 0).await.unwrap();
        assert_eq!(
            all.iter().map(Signal::kind).collect::<Vec<_>>(),
            vec![SignalKind::Join, SignalKind::Leave]
        );
        let after = relay.fetch_since("ROOM1", second - 1).await.unwrap();
        assert_eq!(after.len(), 1);
        assert!(relay.fetch_since("ROOM1", second).await.unwrap().is_empty());
        assert!(relay.fetch_since("NOPE", 0).await.unwrap().is_empty());
        assert!(relay.fetch_since("bad:code", 0).await.unwrap().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn records_expire_by_kind() {
        let (clock, relay) = relay().await;
        relay.publish("ROOM1", Signal::join("bob", JoinMarker::fresh())).await.unwrap();
        relay
            .publish("ROOM1", Signal::candidate("bob", "amy", IceCandidate::new("c")))
            .await
            .unwrap();
        clock.advance(31_000);
        let left = relay.fetch_since("ROOM1", 0).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].kind(), SignalKind::Join);
    }

    #[test_timeout::tokio_timeout_test]
    async fn undecodable_records_are_skipped() {
        let (_clock, relay) = relay().await;
        relay
            .store()
            .put_if_absent("video:ROOM1:join:x:broadcast:1", "{not json", Duration::from_secs(5))
            .await
            .unwrap();
        relay.publish("ROOM1", Signal::leave("bob")).await.unwrap();
        assert_eq!(relay.fetch_since("ROOM1", 0).await.unwrap().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejects_separator_in_identity() {
        let (_clock, relay) = relay().await;
        let err = relay.publish("ROOM1", Signal::leave("a:b")).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidSignal(_)));
    }
}
