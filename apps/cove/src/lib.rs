pub mod bus;
pub mod cli;
pub mod clock;
pub mod config;
pub mod media;
pub mod peer;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use peer::{CallEvent, Orchestrator};
pub use session::{CallError, CallSession, SessionOptions};
