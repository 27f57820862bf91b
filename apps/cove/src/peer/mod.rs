//! Per-peer negotiation and the table that owns it.

mod connection;
mod events;
mod orchestrator;

pub use connection::{
    AnswerOutcome, CandidateOutcome, NegotiationError, PeerConnection, PeerPhase, StateVerdict,
};
pub use events::CallEvent;
pub use orchestrator::Orchestrator;
