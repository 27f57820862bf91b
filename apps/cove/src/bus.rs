//! Signal Bus: turns relay polling into ordered, deduplicated dispatch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cove_signal::{Clock, RelayError, Signal, SignalIdentity, SignalRelay};
use tracing::{trace, warn};

/// Receives each distinct signal exactly once, in timestamp order.
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn handle_signal(&self, signal: Signal);
}

pub struct SignalBus {
    relay: Arc<dyn SignalRelay>,
    room: String,
    watermark: u64,
    seen: HashSet<SignalIdentity>,
}

impl SignalBus {
    /// Starts `lookback` in the past so a fresh joiner still sees recent presence.
    pub fn new(
        relay: Arc<dyn SignalRelay>,
        room: impl Into<String>,
        clock: &dyn Clock,
        lookback: Duration,
    ) -> Self {
        let lookback = lookback.as_millis() as u64;
        Self {
            relay,
            room: room.into(),
            watermark: clock.now_millis().saturating_sub(lookback),
            seen: HashSet::new(),
        }
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// Fetches everything stamped at or after the watermark and returns the
    /// signals not dispatched before, oldest first.
    pub async fn poll(&mut self) -> Result<Vec<Signal>, RelayError> {
        // Inclusive: a record stamped in the watermark's millisecond may land
        // after the previous fetch.
        let since = self.watermark.saturating_sub(1);
        let mut signals = self.relay.fetch_since(&self.room, since).await?;
        signals.sort_by_key(|signal| signal.timestamp);

        let mut fresh = Vec::with_capacity(signals.len());
        for signal in signals {
            self.watermark = self.watermark.max(signal.timestamp);
            if self.seen.insert(signal.identity()) {
                fresh.push(signal);
            } else {
                trace!(identity = %signal.identity(), "duplicate signal skipped");
            }
        }
        let watermark = self.watermark;
        self.seen.retain(|identity| identity.timestamp >= watermark);
        Ok(fresh)
    }

    /// One poll tick. Relay failures are logged and retried on the next tick.
    pub async fn poll_and_dispatch(&mut self, handler: &dyn SignalHandler) -> usize {
        let signals = match self.poll().await {
            Ok(signals) => signals,
            Err(err) => {
                warn!(room = %self.room, error = %err, "signal poll failed");
                return 0;
            }
        };
        let count = signals.len();
        for signal in signals {
            handler.handle_signal(signal).await;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cove_signal::{IceCandidate, JoinMarker, ManualClock, SignalKind};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays canned fetch results, ignoring the watermark it is given.
    #[derive(Default)]
    struct CannedRelay {
        batches: Mutex<VecDeque<Result<Vec<Signal>, RelayError>>>,
        requested: Mutex<Vec<u64>>,
    }

    impl CannedRelay {
        fn push(&self, batch: Vec<Signal>) {
            self.batches.lock().push_back(Ok(batch));
        }
    }

    #[async_trait]
    impl SignalRelay for CannedRelay {
        async fn publish(&self, _room: &str, signal: Signal) -> Result<u64, RelayError> {
            Ok(signal.timestamp)
        }

        async fn fetch_since(&self, _room: &str, watermark: u64) -> Result<Vec<Signal>, RelayError> {
            self.requested.lock().push(watermark);
            self.batches.lock().pop_front().unwrap_or(Ok(Vec::new()))
        }

        async fn room_exists(&self, _room: &str) -> Result<bool, RelayError> {
            Ok(true)
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Signal>>);

    #[async_trait]
    impl SignalHandler for Recorder {
        async fn handle_signal(&self, signal: Signal) {
            self.0.lock().push(signal);
        }
    }

    fn candidate(n: u64) -> Signal {
        Signal::candidate("bob", "amy", IceCandidate::new(format!("c{n}"))).at(n)
    }

    fn bus(relay: &Arc<CannedRelay>) -> SignalBus {
        let clock = ManualClock::new(40_000);
        SignalBus::new(relay.clone(), "ROOM1", &clock, Duration::from_secs(30))
    }

    #[test_timeout::tokio_timeout_test]
    async fn watermark_starts_one_lookback_back() {
        let relay = Arc::new(CannedRelay::default());
        let mut bus = bus(&relay);
        assert_eq!(bus.watermark(), 10_000);
        bus.poll().await.unwrap();
        assert_eq!(relay.requested.lock().as_slice(), &[9_999]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn dispatches_in_timestamp_order() {
        let relay = Arc::new(CannedRelay::default());
        relay.push(vec![candidate(10_300), candidate(10_100), candidate(10_200)]);
        let mut bus = bus(&relay);
        let recorder = Recorder::default();

        assert_eq!(bus.poll_and_dispatch(&recorder).await, 3);
        let stamps: Vec<u64> = recorder.0.lock().iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![10_100, 10_200, 10_300]);
        assert_eq!(bus.watermark(), 10_300);
    }

    #[test_timeout::tokio_timeout_test]
    async fn overlapping_polls_dispatch_each_signal_once() {
        let relay = Arc::new(CannedRelay::default());
        relay.push(vec![candidate(10_100), candidate(10_200)]);
        relay.push(vec![candidate(10_200), candidate(10_300)]);
        relay.push(vec![candidate(10_300)]);
        let mut bus = bus(&relay);
        let recorder = Recorder::default();

        bus.poll_and_dispatch(&recorder).await;
        bus.poll_and_dispatch(&recorder).await;
        bus.poll_and_dispatch(&recorder).await;

        let stamps: Vec<u64> = recorder.0.lock().iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![10_100, 10_200, 10_300]);
        assert_eq!(relay.requested.lock().as_slice(), &[9_999, 10_199, 10_299]);
        // Only entries at the watermark are still needed for dedup.
        assert_eq!(bus.seen_len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn joins_in_one_millisecond_stay_distinct() {
        let relay = Arc::new(CannedRelay::default());
        let first = Signal::join("bob", JoinMarker { join_id: "a1".into() }).at(10_500);
        let second = Signal::join("bob", JoinMarker { join_id: "b2".into() }).at(10_500);
        relay.push(vec![first.clone(), second]);
        relay.push(vec![first]);
        let mut bus = bus(&relay);

        let signals = bus.poll().await.unwrap();
        assert_eq!(signals.len(), 2);
        assert!(signals.iter().all(|s| s.kind() == SignalKind::Join));
        assert!(bus.poll().await.unwrap().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn relay_failure_keeps_state() {
        let relay = Arc::new(CannedRelay::default());
        relay
            .batches
            .lock()
            .push_back(Err(RelayError::InvalidSignal("boom".into())));
        relay.push(vec![candidate(10_100)]);
        let mut bus = bus(&relay);
        let recorder = Recorder::default();

        assert_eq!(bus.poll_and_dispatch(&recorder).await, 0);
        assert_eq!(bus.watermark(), 10_000);
        assert_eq!(bus.poll_and_dispatch(&recorder).await, 1);
    }
}
