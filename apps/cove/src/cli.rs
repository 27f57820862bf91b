use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cove_signal::{HttpRelay, SignalRelay, SystemClock};
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::media::MediaConstraints;
use crate::peer::CallEvent;
use crate::session::{CallSession, SessionOptions};
use crate::transport::RtcTransportFactory;

#[derive(Parser, Debug)]
#[command(name = "cove")]
#[command(about = "Join ephemeral cove rooms as a peer-to-peer call participant")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a room's call and stay until Ctrl-C
    Call(CallArgs),

    /// List the participants currently in a room's call
    Who(RoomArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RoomArgs {
    /// Relay base URL
    #[arg(long, env = "COVE_RELAY_URL", default_value = "http://localhost:8080")]
    pub relay: String,

    /// Room code
    #[arg(long, env = "COVE_ROOM")]
    pub room: String,
}

#[derive(Args, Debug, Clone)]
pub struct CallArgs {
    #[command(flatten)]
    pub room: RoomArgs,

    /// Participant identity; generated when omitted
    #[arg(long, env = "COVE_IDENTITY")]
    pub identity: Option<String>,

    /// Join without sending video
    #[arg(long)]
    pub no_video: bool,

    /// Join without sending audio
    #[arg(long)]
    pub no_audio: bool,
}

impl CallArgs {
    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            video: !self.no_video,
            audio: !self.no_audio,
        }
    }
}

pub async fn run_call(args: CallArgs, config: ClientConfig) -> Result<()> {
    let relay: Arc<dyn SignalRelay> = Arc::new(HttpRelay::new(args.room.relay.clone()));
    let factory = Arc::new(RtcTransportFactory::new(&config.ice_servers)?);
    let mut options = SessionOptions::new(args.room.room.clone(), relay, factory)
        .with_constraints(args.constraints())
        .with_config(config.call);
    if let Some(identity) = args.identity.clone().or(config.identity) {
        options = options.with_identity(identity);
    }

    let (session, mut events) = CallSession::start(options)
        .await
        .with_context(|| format!("failed to join room {}", args.room.room))?;
    info!(identity = %session.local_id(), room = %session.room(), "in call; Ctrl-C to leave");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(CallEvent::RoomClosed) | None => {
                    warn!("room closed");
                    break;
                }
                Some(CallEvent::RemoteStreamAdded { peer_id, stream }) => {
                    info!(peer = %peer_id, tracks = stream.tracks.len(), "remote stream");
                }
                Some(CallEvent::RemoteStreamRemoved { peer_id }) => {
                    info!(peer = %peer_id, "peer gone");
                }
                Some(CallEvent::ConnectionStateChanged { peer_id, state }) => {
                    info!(peer = %peer_id, %state, "connection");
                }
            },
        }
    }
    session.end_call().await;
    Ok(())
}

pub async fn run_who(args: RoomArgs, config: &ClientConfig) -> Result<()> {
    let relay = HttpRelay::new(args.relay.clone());
    let callers = CallSession::active_callers(
        &relay,
        &args.room,
        "",
        config.call.reconcile_lookback,
        &SystemClock,
    )
    .await?;
    if callers.is_empty() {
        println!("nobody is in the call");
    }
    for caller in callers {
        println!("{caller}");
    }
    Ok(())
}
