//! Peer Orchestrator: the table of Peer Entries for one local participant and
//! the policy deciding who calls whom.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use cove_signal::{
    presence, IceCandidate, JoinMarker, RelayError, SessionDescription, Signal, SignalPayload,
    SignalRelay,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::connection::{NegotiationError, PeerConnection, StateVerdict};
use super::events::CallEvent;
use crate::bus::SignalHandler;
use crate::media::LocalMedia;
use crate::transport::{TransportEvent, TransportFactory};

struct Inner {
    local_id: String,
    room: String,
    relay: Arc<dyn SignalRelay>,
    factory: Arc<dyn TransportFactory>,
    media: Arc<LocalMedia>,
    max_ice_restarts: u32,
    peers: Mutex<HashMap<String, Arc<PeerConnection>>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<CallEvent>,
}

/// How a freshly built entry claims its peer's slot.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// Always take the slot, displacing whatever holds it.
    Replace,
    /// Back off if a live negotiation already holds the slot.
    IfVacant,
}

enum Installed {
    Fresh { displaced: Option<Arc<PeerConnection>> },
    Lost,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        local_id: impl Into<String>,
        room: impl Into<String>,
        relay: Arc<dyn SignalRelay>,
        factory: Arc<dyn TransportFactory>,
        media: Arc<LocalMedia>,
        max_ice_restarts: u32,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            local_id: local_id.into(),
            room: room.into(),
            relay,
            factory,
            media,
            max_ice_restarts,
            peers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            events,
        });
        (Self { inner }, rx)
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn room(&self) -> &str {
        &self.inner.room
    }

    pub fn media(&self) -> &Arc<LocalMedia> {
        &self.inner.media
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Glare rule: of any two participants, only the greater identity calls.
    pub fn is_initiator_for(&self, peer: &str) -> bool {
        self.inner.local_id.as_str() > peer
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.peers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn entry(&self, peer: &str) -> Option<Arc<PeerConnection>> {
        self.inner.peers.lock().get(peer).cloned()
    }

    /// Negotiating or connected with `peer`, as opposed to merely holding
    /// early candidates or recovering from a failure.
    fn has_live_entry(&self, peer: &str) -> bool {
        self.entry(peer)
            .is_some_and(|entry| entry.is_healthy() && !entry.is_holding_pen())
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Broadcasts presence with a fresh announcement nonce.
    pub async fn announce(&self) {
        if self.is_closed() {
            return;
        }
        self.send(Signal::join(self.local_id(), JoinMarker::fresh())).await;
    }

    pub async fn handle_signal(&self, signal: Signal) {
        if self.is_closed() {
            return;
        }
        if !signal.is_addressed_to(self.local_id()) {
            trace!(kind = %signal.kind(), sender = %signal.sender, "signal not for us");
            return;
        }
        let peer = signal.sender.clone();
        let broadcast = signal.is_broadcast();
        let kind = signal.kind();
        let stamp = signal.timestamp;
        let result = match signal.payload {
            SignalPayload::Join(_) => self.on_join(&peer, broadcast).await,
            SignalPayload::Offer(offer) => self.on_offer(&peer, offer).await,
            SignalPayload::Answer(answer) => self.on_answer(&peer, answer, stamp).await,
            SignalPayload::IceCandidate(candidate) => self.on_candidate(&peer, candidate).await,
            SignalPayload::Leave => {
                debug!(peer = %peer, "peer left");
                self.remove_peer(&peer).await;
                Ok(())
            }
        };
        match result {
            Ok(()) => {}
            Err(NegotiationError::Closed) => {
                debug!(peer = %peer, %kind, "entry closed mid-negotiation");
            }
            Err(err) => warn!(peer = %peer, %kind, error = %err, "signal handling failed"),
        }
    }

    async fn on_join(&self, peer: &str, broadcast: bool) -> Result<(), NegotiationError> {
        if self.has_live_entry(peer) {
            trace!(peer = %peer, "join for a live entry ignored");
            return Ok(());
        }
        if self.is_initiator_for(peer) {
            return self.call_peer(peer).await;
        }
        // Let the caller know we exist without waiting for our next announcement.
        if broadcast {
            debug!(peer = %peer, "waiting to be called; replying with presence");
            self.send(Signal::join(self.local_id(), JoinMarker::fresh()).to(peer))
                .await;
        }
        Ok(())
    }

    async fn on_offer(&self, peer: &str, offer: SessionDescription) -> Result<(), NegotiationError> {
        let existing = self.entry(peer);
        let reusable = match &existing {
            Some(entry) => entry.is_holding_pen() || entry.continues_session(&offer).await,
            None => false,
        };
        let entry = match existing {
            Some(entry) if reusable => entry,
            _ => {
                let entry = self.build_entry(peer).await?;
                match self.install(&entry, Claim::Replace) {
                    Installed::Fresh { displaced } => {
                        if let Some(old) = displaced {
                            self.retire(old).await;
                        }
                    }
                    Installed::Lost => {
                        entry.close().await;
                        return Err(NegotiationError::Closed);
                    }
                }
                entry
            }
        };
        let answer = entry.accept_offer(offer).await?;
        self.send(Signal::answer(self.local_id(), peer, answer)).await;
        Ok(())
    }

    async fn on_answer(
        &self,
        peer: &str,
        answer: SessionDescription,
        stamp: u64,
    ) -> Result<(), NegotiationError> {
        let Some(entry) = self.entry(peer) else {
            debug!(peer = %peer, "answer without an entry ignored");
            return Ok(());
        };
        if entry.predates_offer(stamp) {
            debug!(peer = %peer, stamp, "answer to an earlier offer ignored");
            return Ok(());
        }
        entry.accept_answer(answer).await?;
        Ok(())
    }

    async fn on_candidate(&self, peer: &str, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let entry = match self.entry(peer) {
            Some(entry) => entry,
            None => self.holding_pen(peer).await?,
        };
        entry.add_candidate(candidate).await?;
        Ok(())
    }

    /// Entry that exists only to queue candidates arriving ahead of the offer.
    async fn holding_pen(&self, peer: &str) -> Result<Arc<PeerConnection>, NegotiationError> {
        let entry = self.build_entry(peer).await?;
        let existing = {
            let mut peers = self.inner.peers.lock();
            if self.is_closed() {
                None
            } else {
                match peers.get(peer) {
                    Some(existing) => Some(Arc::clone(existing)),
                    None => {
                        peers.insert(peer.to_string(), Arc::clone(&entry));
                        return Ok(entry);
                    }
                }
            }
        };
        entry.close().await;
        existing.ok_or(NegotiationError::Closed)
    }

    /// Outbound call: a brand-new entry for `peer`, an offer, and the offer sent.
    pub async fn call_peer(&self, peer: &str) -> Result<(), NegotiationError> {
        if self.is_closed() || self.inner.media.is_stopped() {
            return Err(NegotiationError::Closed);
        }
        let entry = self.build_entry(peer).await?;
        match self.install(&entry, Claim::IfVacant) {
            Installed::Fresh { displaced } => {
                if let Some(old) = displaced {
                    debug!(peer = %peer, generation = old.generation(), "replacing stale entry");
                    self.retire(old).await;
                }
            }
            Installed::Lost => {
                entry.close().await;
                debug!(peer = %peer, "another negotiation won the slot");
                return Ok(());
            }
        }
        info!(peer = %peer, generation = entry.generation(), "calling peer");
        let offer = entry.start_offer().await?;
        self.send_offer(&entry, offer).await;
        Ok(())
    }

    async fn build_entry(&self, peer: &str) -> Result<Arc<PeerConnection>, NegotiationError> {
        let handle = self.inner.factory.create(peer, &self.inner.media).await?;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = Arc::new(PeerConnection::new(
            peer,
            generation,
            self.is_initiator_for(peer),
            self.inner.max_ice_restarts,
            handle.transport,
        ));
        spawn_event_pump(Arc::downgrade(&self.inner), Arc::clone(&entry), handle.events);
        Ok(entry)
    }

    fn install(&self, entry: &Arc<PeerConnection>, claim: Claim) -> Installed {
        let mut peers = self.inner.peers.lock();
        if self.is_closed() {
            return Installed::Lost;
        }
        if claim == Claim::IfVacant {
            if let Some(current) = peers.get(entry.peer_id()) {
                if current.is_healthy() && !current.is_holding_pen() {
                    return Installed::Lost;
                }
            }
        }
        let displaced = peers.insert(entry.peer_id().to_string(), Arc::clone(entry));
        Installed::Fresh { displaced }
    }

    fn is_current(&self, entry: &PeerConnection) -> bool {
        self.inner
            .peers
            .lock()
            .get(entry.peer_id())
            .is_some_and(|current| current.generation() == entry.generation())
    }

    /// Closes an entry that was in the table and reports its stream gone, if
    /// it ever had one.
    async fn retire(&self, entry: Arc<PeerConnection>) {
        if entry.close().await && entry.remote_stream().is_some() {
            self.emit(CallEvent::RemoteStreamRemoved {
                peer_id: entry.peer_id().to_string(),
            });
        }
    }

    pub async fn remove_peer(&self, peer: &str) {
        let removed = self.inner.peers.lock().remove(peer);
        if let Some(entry) = removed {
            self.retire(entry).await;
        }
    }

    /// Removes `entry` only if it still owns its peer's slot.
    async fn remove_entry(&self, entry: &Arc<PeerConnection>) {
        let removed = {
            let mut peers = self.inner.peers.lock();
            match peers.get(entry.peer_id()) {
                Some(current) if current.generation() == entry.generation() => {
                    peers.remove(entry.peer_id())
                }
                _ => None,
            }
        };
        match removed {
            Some(entry) => self.retire(entry).await,
            None => {
                entry.close().await;
            }
        }
    }

    async fn on_transport_event(&self, entry: &Arc<PeerConnection>, event: TransportEvent) {
        if !self.is_current(entry) {
            trace!(peer = %entry.peer_id(), generation = entry.generation(), "event from stale entry");
            return;
        }
        let peer = entry.peer_id();
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.send(Signal::candidate(self.local_id(), peer, candidate))
                    .await;
            }
            TransportEvent::ConnectionState(state) => {
                debug!(peer = %peer, %state, "connection state changed");
                self.emit(CallEvent::ConnectionStateChanged {
                    peer_id: peer.to_string(),
                    state,
                });
                match entry.on_connection_state(state) {
                    StateVerdict::Nothing => {}
                    StateVerdict::Restart => {
                        info!(peer = %peer, "connection failed; restarting ice");
                        match entry.restart_ice().await {
                            Ok(offer) => self.send_offer(entry, offer).await,
                            Err(err) => {
                                warn!(peer = %peer, error = %err, "ice restart failed");
                                self.remove_entry(entry).await;
                            }
                        }
                    }
                    StateVerdict::GiveUp => {
                        warn!(peer = %peer, "connection did not recover; dropping entry");
                        self.remove_entry(entry).await;
                    }
                    StateVerdict::Closed => self.remove_entry(entry).await,
                }
            }
            TransportEvent::IceConnectionState(state) => {
                trace!(peer = %peer, ?state, "ice connection state");
                entry.on_ice_state(state);
            }
            TransportEvent::RemoteTrack(track) => {
                debug!(peer = %peer, track = %track.id, kind = ?track.kind, "remote track");
                let stream = entry.add_remote_track(track);
                self.emit(CallEvent::RemoteStreamAdded {
                    peer_id: peer.to_string(),
                    stream,
                });
            }
        }
    }

    /// Repairs the table from `signals`, the last `window` of history: drops
    /// departed peers, dead entries and holding pens nobody followed up on,
    /// and calls active peers nobody is talking to.
    pub async fn reconcile(&self, signals: &[Signal], window: Duration) {
        if self.is_closed() {
            return;
        }
        let presence = presence::snapshot(signals, self.local_id());

        let stale: Vec<String> = self
            .inner
            .peers
            .lock()
            .iter()
            .filter(|(peer, entry)| {
                let abandoned = entry.holding_pen_age().is_some_and(|age| age >= window);
                presence.departed.contains(*peer)
                    || (!presence.active.contains(*peer) && (!entry.is_healthy() || abandoned))
            })
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in stale {
            debug!(peer = %peer, "reconcile: dropping entry");
            self.remove_peer(&peer).await;
        }

        for peer in &presence.active {
            if self.has_live_entry(peer) || !self.is_initiator_for(peer) {
                continue;
            }
            debug!(peer = %peer, "reconcile: active peer without a connection");
            if let Err(err) = self.call_peer(peer).await {
                debug!(peer = %peer, error = %err, "reconcile call failed");
            }
        }
    }

    async fn send_offer(&self, entry: &PeerConnection, offer: SessionDescription) {
        let offer = Signal::offer(self.local_id(), entry.peer_id(), offer);
        if let Some(stamp) = self.send(offer).await {
            entry.record_offer_stamp(stamp);
        }
    }

    /// Publishes `signal`, returning the relay's timestamp for it.
    async fn send(&self, signal: Signal) -> Option<u64> {
        let kind = signal.kind();
        match self.inner.relay.publish(self.room(), signal).await {
            Ok(timestamp) => {
                trace!(%kind, timestamp, "signal published");
                Some(timestamp)
            }
            Err(RelayError::RoomGone(room)) => {
                warn!(room = %room, "room is gone; tearing down");
                self.close_room().await;
                None
            }
            Err(err) => {
                warn!(%kind, error = %err, "signal publish failed");
                None
            }
        }
    }

    /// Ends the call: announces the leave once, then closes every entry and
    /// releases local media. Safe to call repeatedly and concurrently.
    pub async fn shutdown(&self) {
        self.teardown(true).await;
    }

    /// Tears everything down because the room itself expired.
    pub async fn close_room(&self) {
        if self.teardown(false).await {
            self.emit(CallEvent::RoomClosed);
        }
    }

    async fn teardown(&self, announce: bool) -> bool {
        let first = !self.inner.closed.swap(true, Ordering::SeqCst);
        if first && announce {
            let leave = Signal::leave(self.local_id());
            if let Err(err) = self.inner.relay.publish(self.room(), leave).await {
                debug!(error = %err, "leave announcement failed");
            }
        }
        let entries: Vec<Arc<PeerConnection>> = self
            .inner
            .peers
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        for entry in entries {
            self.retire(entry).await;
        }
        if first {
            self.inner.media.stop();
            info!(room = %self.room(), "call ended");
        }
        first
    }
}

#[async_trait]
impl SignalHandler for Orchestrator {
    async fn handle_signal(&self, signal: Signal) {
        Orchestrator::handle_signal(self, signal).await;
    }
}

fn spawn_event_pump(
    inner: Weak<Inner>,
    entry: Arc<PeerConnection>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let mut closed = entry.closed();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = closed.wait_for(|closed| *closed) => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(inner) = inner.upgrade() else {
                break;
            };
            Orchestrator { inner }.on_transport_event(&entry, event).await;
        }
        trace!(peer = %entry.peer_id(), generation = entry.generation(), "event pump stopped");
    });
}
