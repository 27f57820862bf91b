use cove_signal::Clock;
use tokio::time::Instant;

/// Epoch clock that advances with Tokio's timer, so a paused test runtime
/// moves stamps, watermarks and lookbacks together with its sleeps.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin_millis: u64,
    origin: Instant,
}

impl TokioClock {
    pub fn starting_at(origin_millis: u64) -> Self {
        Self {
            origin_millis,
            origin: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> u64 {
        self.origin_millis + self.origin.elapsed().as_millis() as u64
    }
}
