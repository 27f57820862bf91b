//! A running call: the orchestrator plus the loops that feed it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use cove_signal::keys::is_valid_identity;
use cove_signal::{Clock, RelayError, SignalRelay, SystemClock, presence};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bus::SignalBus;
use crate::config::CallConfig;
use crate::media::{LocalMedia, MediaConstraints, MediaDevices, MediaError, SampleDevices};
use crate::peer::{CallEvent, NegotiationError, Orchestrator};
use crate::transport::{TransportError, TransportFactory};

#[derive(Debug, Error)]
pub enum CallError {
    #[error("room {0} does not exist")]
    RoomNotFound(String),
    #[error("invalid participant identity {0:?}")]
    InvalidIdentity(String),
    #[error("media acquisition failed: {0}")]
    Media(#[from] MediaError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("call already ended")]
    Closed,
}

pub struct SessionOptions {
    pub room: String,
    /// Generated when absent.
    pub identity: Option<String>,
    pub relay: Arc<dyn SignalRelay>,
    pub factory: Arc<dyn TransportFactory>,
    pub devices: Arc<dyn MediaDevices>,
    pub constraints: MediaConstraints,
    pub clock: Arc<dyn Clock>,
    pub config: CallConfig,
}

impl SessionOptions {
    pub fn new(
        room: impl Into<String>,
        relay: Arc<dyn SignalRelay>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            room: room.into(),
            identity: None,
            relay,
            factory,
            devices: Arc::new(SampleDevices),
            constraints: MediaConstraints::default(),
            clock: Arc::new(SystemClock),
            config: CallConfig::default(),
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }
}

/// Transient per-session identity, as handed out to anonymous participants.
pub fn generate_identity() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("user-{}", &id[..8])
}

pub struct CallSession {
    orchestrator: Orchestrator,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CallSession {
    /// Joins `opts.room`: checks the room, acquires media, then starts
    /// announcing, polling and reconciling. Events arrive on the returned channel.
    pub async fn start(
        opts: SessionOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CallEvent>), CallError> {
        let SessionOptions {
            room,
            identity,
            relay,
            factory,
            devices,
            constraints,
            clock,
            config,
        } = opts;
        let identity = identity.unwrap_or_else(generate_identity);
        if !is_valid_identity(&identity) {
            return Err(CallError::InvalidIdentity(identity));
        }
        if !relay.room_exists(&room).await? {
            return Err(CallError::RoomNotFound(room));
        }
        let media = devices.acquire(constraints).await.map_err(|err| {
            error!(room = %room, error = %err, "could not acquire local media");
            CallError::Media(err)
        })?;

        let (orchestrator, events) = Orchestrator::new(
            identity,
            room,
            Arc::clone(&relay),
            factory,
            media,
            config.max_ice_restarts,
        );
        info!(room = %orchestrator.room(), identity = %orchestrator.local_id(), "joining call");

        let (stop, _) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(announce_loop(
                orchestrator.clone(),
                config.clone(),
                stop.subscribe(),
            )),
            tokio::spawn(poll_loop(
                orchestrator.clone(),
                SignalBus::new(
                    Arc::clone(&relay),
                    orchestrator.room(),
                    clock.as_ref(),
                    config.lookback,
                ),
                config.poll_interval,
                stop.subscribe(),
            )),
            tokio::spawn(reconcile_loop(
                orchestrator.clone(),
                relay,
                clock,
                config,
                stop.subscribe(),
            )),
        ];

        let session = Self {
            orchestrator,
            stop,
            tasks: Mutex::new(tasks),
        };
        Ok((session, events))
    }

    pub fn local_id(&self) -> &str {
        self.orchestrator.local_id()
    }

    pub fn room(&self) -> &str {
        self.orchestrator.room()
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn media(&self) -> &Arc<LocalMedia> {
        self.orchestrator.media()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.orchestrator.peer_ids()
    }

    pub fn is_active(&self) -> bool {
        !self.orchestrator.is_closed()
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.media().set_video_enabled(enabled);
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.media().set_audio_enabled(enabled);
    }

    /// Calls `peer` directly, replacing any stale entry for it.
    pub async fn call_user(&self, peer: &str) -> Result<(), CallError> {
        if !self.is_active() {
            return Err(CallError::Closed);
        }
        self.orchestrator
            .call_peer(peer)
            .await
            .map_err(|err| match err {
                NegotiationError::Closed => CallError::Closed,
                NegotiationError::Transport(err) => CallError::Transport(err),
            })
    }

    /// Leaves the room. Safe to call more than once, and while negotiation
    /// steps are still running.
    pub async fn end_call(&self) {
        let _ = self.stop.send(true);
        self.orchestrator.shutdown().await;
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
    }

    /// Who is in `room` right now, judged from recent join/leave history.
    pub async fn active_callers(
        relay: &dyn SignalRelay,
        room: &str,
        me: &str,
        lookback: Duration,
        clock: &dyn Clock,
    ) -> Result<BTreeSet<String>, RelayError> {
        let since = clock
            .now_millis()
            .saturating_sub(lookback.as_millis() as u64);
        let signals = relay.fetch_since(room, since).await?;
        Ok(presence::active_participants(&signals, me))
    }
}

/// Sleeps until `deadline`; false if the session stopped first.
async fn wait_until(stop: &mut watch::Receiver<bool>, deadline: Instant) -> bool {
    let woke = tokio::select! {
        _ = tokio::time::sleep_until(deadline) => true,
        _ = stop.wait_for(|stopped| *stopped) => false,
    };
    woke && !*stop.borrow()
}

async fn announce_loop(
    orchestrator: Orchestrator,
    config: CallConfig,
    mut stop: watch::Receiver<bool>,
) {
    let started = Instant::now();
    for offset in &config.announce_schedule {
        if !wait_until(&mut stop, started + *offset).await || orchestrator.is_closed() {
            return;
        }
        orchestrator.announce().await;
    }
    loop {
        if !wait_until(&mut stop, Instant::now() + config.presence_interval).await
            || orchestrator.is_closed()
        {
            return;
        }
        orchestrator.announce().await;
    }
}

async fn poll_loop(
    orchestrator: Orchestrator,
    mut bus: SignalBus,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.wait_for(|stopped| *stopped) => break,
        }
        if orchestrator.is_closed() {
            break;
        }
        bus.poll_and_dispatch(&orchestrator).await;
    }
    debug!(room = %orchestrator.room(), watermark = bus.watermark(), "poll loop stopped");
}

async fn reconcile_loop(
    orchestrator: Orchestrator,
    relay: Arc<dyn SignalRelay>,
    clock: Arc<dyn Clock>,
    config: CallConfig,
    mut stop: watch::Receiver<bool>,
) {
    let mut deadline = Instant::now() + config.first_reconcile_delay;
    loop {
        if !wait_until(&mut stop, deadline).await || orchestrator.is_closed() {
            return;
        }
        deadline = Instant::now() + config.reconcile_interval;

        let room = orchestrator.room();
        match relay.room_exists(room).await {
            Ok(true) => {}
            Ok(false) => {
                info!(room = %room, "room no longer exists");
                orchestrator.close_room().await;
                return;
            }
            Err(err) => {
                warn!(room = %room, error = %err, "room check failed");
                continue;
            }
        }
        let since = clock
            .now_millis()
            .saturating_sub(config.reconcile_lookback.as_millis() as u64);
        match relay.fetch_since(room, since).await {
            Ok(signals) => {
                orchestrator
                    .reconcile(&signals, config.reconcile_lookback)
                    .await
            }
            Err(err) => warn!(room = %room, error = %err, "reconcile fetch failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn generated_identities_are_usable() {
        let a = generate_identity();
        let b = generate_identity();
        assert!(a.starts_with("user-"));
        assert_eq!(a.len(), 13);
        assert!(is_valid_identity(&a));
        assert_ne!(a, b);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn wait_until_reports_deadline_or_stop() {
        let (stop_tx, mut stop) = watch::channel(false);
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(wait_until(&mut stop, deadline).await);

        let waiter = tokio::spawn(async move {
            let far = Instant::now() + Duration::from_secs(3600);
            wait_until(&mut stop, far).await
        });
        stop_tx.send(true).unwrap();
        assert!(!waiter.await.unwrap());
    }
}
