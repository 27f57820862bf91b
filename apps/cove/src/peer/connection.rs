//! Connection State Machine: one per remote participant.

use std::sync::Arc;
use std::time::Duration;

use cove_signal::{IceCandidate, SessionDescription};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::transport::{
    ConnectionState, IceConnectionState, PeerTransport, RemoteStream, RemoteTrack, SignalingState, TransportError,
};

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("peer entry closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    New,
    Offering,
    PendingAnswer,
    Answering,
    PendingConnect,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerOutcome {
    Applied,
    /// Local side was not waiting for an answer; stale or duplicate.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Queued,
}

/// What the owner should do after a transport connection-state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateVerdict {
    Nothing,
    /// Send an ICE-restart offer.
    Restart,
    /// Recovery exhausted or impossible from this side; drop the entry.
    GiveUp,
    Closed,
}

struct EntryState {
    phase: PeerPhase,
    pending_candidates: Vec<IceCandidate>,
    remote_applied: bool,
    connection: ConnectionState,
    ice: IceConnectionState,
    remote_stream: Option<RemoteStream>,
    restart_attempts: u32,
    /// Relay timestamp of the last offer we published.
    offer_stamp: Option<u64>,
}

/// Peer Entry: the transport toward one participant plus everything the
/// negotiation needs to remember about it.
pub struct PeerConnection {
    peer_id: String,
    generation: u64,
    initiator: bool,
    max_restarts: u32,
    transport: Arc<dyn PeerTransport>,
    created: Instant,
    state: Mutex<EntryState>,
    closed_tx: watch::Sender<bool>,
}

impl PeerConnection {
    pub fn new(
        peer_id: impl Into<String>,
        generation: u64,
        initiator: bool,
        max_restarts: u32,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            peer_id: peer_id.into(),
            generation,
            initiator,
            max_restarts,
            transport,
            created: Instant::now(),
            state: Mutex::new(EntryState {
                phase: PeerPhase::New,
                pending_candidates: Vec::new(),
                remote_applied: false,
                connection: ConnectionState::New,
                ice: IceConnectionState::New,
                remote_stream: None,
                restart_attempts: 0,
                offer_stamp: None,
            }),
            closed_tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn phase(&self) -> PeerPhase {
        self.state.lock().phase
    }

    pub fn pending_candidates(&self) -> usize {
        self.state.lock().pending_candidates.len()
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.state.lock().remote_stream.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == PeerPhase::Closed
    }

    /// Resolves once the entry is closed.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Created ahead of any description, only to hold early candidates.
    pub fn is_holding_pen(&self) -> bool {
        self.phase() == PeerPhase::New
    }

    /// How long a holding pen has waited for its offer; `None` once negotiating.
    pub fn holding_pen_age(&self) -> Option<Duration> {
        self.is_holding_pen().then(|| self.created.elapsed())
    }

    /// Negotiating or connected, and neither the connection nor ICE is
    /// reporting trouble.
    pub fn is_healthy(&self) -> bool {
        let state = self.state.lock();
        !matches!(state.phase, PeerPhase::Failed | PeerPhase::Closed)
            && !state.connection.is_broken()
            && !state.ice.is_broken()
    }

    /// An answerer whose previous exchange completed can take a new offer
    /// from the same peer (an ICE restart) without being rebuilt.
    pub fn accepts_renegotiation(&self) -> bool {
        let phase = self.phase();
        !self.initiator
            && matches!(
                phase,
                PeerPhase::PendingConnect | PeerPhase::Connected | PeerPhase::Failed
            )
            && self.transport.signaling_state() == SignalingState::Stable
    }

    /// Whether `offer` renegotiates the session already applied here. An
    /// offer from a rebuilt remote connection carries a different `o=`
    /// session id and needs a fresh entry.
    pub async fn continues_session(&self, offer: &SessionDescription) -> bool {
        if !self.accepts_renegotiation() {
            return false;
        }
        let Some(current) = self.transport.remote_description().await else {
            return false;
        };
        match (current.session_id(), offer.session_id()) {
            (Some(current), Some(incoming)) => current == incoming,
            _ => false,
        }
    }

    pub fn record_offer_stamp(&self, stamp: u64) {
        self.state.lock().offer_stamp = Some(stamp);
    }

    /// An answer published before our current offer answers an older one.
    pub fn predates_offer(&self, stamp: u64) -> bool {
        self.state
            .lock()
            .offer_stamp
            .is_some_and(|offered| stamp < offered)
    }

    fn enter(&self, phase: PeerPhase) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        if state.phase == PeerPhase::Closed {
            return Err(NegotiationError::Closed);
        }
        state.phase = phase;
        Ok(())
    }

    /// Moves from `from` to `to` only if nothing else changed the phase meanwhile.
    fn advance(&self, from: PeerPhase, to: PeerPhase) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        match state.phase {
            PeerPhase::Closed => Err(NegotiationError::Closed),
            phase if phase == from => {
                state.phase = to;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }

    /// Offering: create an offer, install it locally, hand it back for sending.
    pub async fn start_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.enter(PeerPhase::Offering)?;
        let offer = self.transport.create_offer(false).await?;
        self.ensure_open()?;
        self.transport.set_local_description(offer.clone()).await?;
        self.advance(PeerPhase::Offering, PeerPhase::PendingAnswer)?;
        debug!(peer = %self.peer_id, generation = self.generation, "offer ready");
        Ok(offer)
    }

    /// Recovery offer with fresh ICE credentials over the existing transport.
    pub async fn restart_ice(&self) -> Result<SessionDescription, NegotiationError> {
        self.enter(PeerPhase::Offering)?;
        let offer = self.transport.restart_ice().await?;
        self.advance(PeerPhase::Offering, PeerPhase::PendingAnswer)?;
        debug!(peer = %self.peer_id, generation = self.generation, "ice restart offer ready");
        Ok(offer)
    }

    /// Answering: apply the remote offer, flush queued candidates, answer.
    pub async fn accept_offer(&self, offer: SessionDescription) -> Result<SessionDescription, NegotiationError> {
        self.enter(PeerPhase::Answering)?;
        self.transport.set_remote_description(offer).await?;
        self.flush_candidates().await?;
        let answer = self.transport.create_answer().await?;
        self.ensure_open()?;
        self.transport.set_local_description(answer.clone()).await?;
        self.advance(PeerPhase::Answering, PeerPhase::PendingConnect)?;
        debug!(peer = %self.peer_id, "answer ready");
        Ok(answer)
    }

    /// Applies an answer only while the local offer is still outstanding.
    pub async fn accept_answer(&self, answer: SessionDescription) -> Result<AnswerOutcome, NegotiationError> {
        self.ensure_open()?;
        let signaling = self.transport.signaling_state();
        if signaling != SignalingState::HaveLocalOffer {
            debug!(peer = %self.peer_id, ?signaling, "ignoring answer outside have-local-offer");
            return Ok(AnswerOutcome::Ignored);
        }
        self.transport.set_remote_description(answer).await?;
        self.flush_candidates().await?;
        self.advance(PeerPhase::PendingAnswer, PeerPhase::PendingConnect)?;
        Ok(AnswerOutcome::Applied)
    }

    /// Applies `candidate` now if the remote description is known, otherwise
    /// queues it behind the ones already waiting.
    pub async fn add_candidate(&self, candidate: IceCandidate) -> Result<CandidateOutcome, NegotiationError> {
        {
            let mut state = self.state.lock();
            if state.phase == PeerPhase::Closed {
                return Err(NegotiationError::Closed);
            }
            if !state.remote_applied {
                state.pending_candidates.push(candidate);
                trace!(
                    peer = %self.peer_id,
                    queued = state.pending_candidates.len(),
                    "candidate queued until remote description"
                );
                return Ok(CandidateOutcome::Queued);
            }
        }
        self.transport.add_ice_candidate(candidate).await?;
        Ok(CandidateOutcome::Applied)
    }

    /// Drains the queue in arrival order. Candidates that arrive while this
    /// runs join the back of the queue; the flag flips only once it is empty.
    async fn flush_candidates(&self) -> Result<(), NegotiationError> {
        loop {
            let next = {
                let mut state = self.state.lock();
                if state.phase == PeerPhase::Closed {
                    return Err(NegotiationError::Closed);
                }
                if state.pending_candidates.is_empty() {
                    state.remote_applied = true;
                    None
                } else {
                    Some(state.pending_candidates.remove(0))
                }
            };
            let Some(candidate) = next else {
                return Ok(());
            };
            if let Err(err) = self.transport.add_ice_candidate(candidate).await {
                warn!(peer = %self.peer_id, error = %err, "queued candidate rejected");
            }
        }
    }

    pub fn on_connection_state(&self, connection: ConnectionState) -> StateVerdict {
        let mut state = self.state.lock();
        if state.phase == PeerPhase::Closed {
            return StateVerdict::Nothing;
        }
        state.connection = connection;
        match connection {
            ConnectionState::Connected => {
                state.phase = PeerPhase::Connected;
                state.restart_attempts = 0;
                StateVerdict::Nothing
            }
            ConnectionState::Failed => {
                state.phase = PeerPhase::Failed;
                if state.restart_attempts >= self.max_restarts {
                    return StateVerdict::GiveUp;
                }
                state.restart_attempts += 1;
                if self.initiator {
                    StateVerdict::Restart
                } else {
                    // The initiating side sends the restart offer.
                    StateVerdict::Nothing
                }
            }
            ConnectionState::Closed => StateVerdict::Closed,
            _ => StateVerdict::Nothing,
        }
    }

    pub fn on_ice_state(&self, ice: IceConnectionState) {
        let mut state = self.state.lock();
        if state.phase != PeerPhase::Closed {
            state.ice = ice;
        }
    }

    /// Records a remote track and returns the updated stream.
    pub fn add_remote_track(&self, track: RemoteTrack) -> RemoteStream {
        let mut state = self.state.lock();
        let stream = state.remote_stream.take().unwrap_or_default().with_track(track);
        state.remote_stream = Some(stream.clone());
        stream
    }

    /// Closes the entry. Returns `true` only for the call that actually closed it.
    pub async fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.phase == PeerPhase::Closed {
                return false;
            }
            state.phase = PeerPhase::Closed;
            state.pending_candidates.clear();
        }
        let _ = self.closed_tx.send(true);
        if let Err(err) = self.transport.close().await {
            debug!(peer = %self.peer_id, error = %err, "transport close failed");
        }
        true
    }
}
