use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use cove_signal::{presence, Clock, HttpRelay, SignalRelay, SystemClock};
use tracing::{debug, warn};

use crate::config::{Config, StoreBackend};

#[derive(Parser, Debug)]
#[command(name = "cove-relay")]
#[command(about = "Cove signal relay and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay server (default when no command is given)
    Serve(ServeArgs),

    /// Inspect a room through a running relay
    Debug {
        /// Relay base URL
        #[arg(short, long, default_value = "http://localhost:8080")]
        url: String,

        /// Room code to inspect
        #[arg(short, long)]
        room: String,

        #[command(subcommand)]
        command: DebugCommands,
    },
}

#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// Listen address, overrides COVE_RELAY_ADDR
    #[arg(long)]
    pub addr: Option<String>,

    /// Keep signals in process memory instead of Redis
    #[arg(long)]
    pub memory: bool,

    /// Accept signals for rooms without a room record
    #[arg(long)]
    pub open_rooms: bool,
}

impl ServeArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(addr) = &self.addr {
            config.addr = addr.clone();
        }
        if self.memory {
            config.store_backend = StoreBackend::Memory;
        }
        if self.open_rooms {
            config.open_rooms = true;
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum DebugCommands {
    /// Print every live signal newer than `since` as JSON lines
    Signals {
        /// Epoch milliseconds; defaults to the full retained history
        #[arg(long)]
        since: Option<u64>,
    },

    /// Show who is present according to recent join/leave signals
    Presence {
        #[arg(long, default_value_t = 30)]
        lookback_secs: u64,
    },
}

pub async fn run_debug_client(url: String, room: String, command: DebugCommands) -> Result<()> {
    debug!(url = %url, room = %room, "debug client connecting");
    let relay = HttpRelay::new(url);
    if !relay.room_exists(&room).await? {
        warn!(room = %room, "room does not exist; showing whatever signals remain");
    }

    match command {
        DebugCommands::Signals { since } => {
            let signals = relay.fetch_since(&room, since.unwrap_or(0)).await?;
            for signal in &signals {
                println!("{}", signal.encode()?);
            }
            debug!(count = signals.len(), "signals listed");
        }
        DebugCommands::Presence { lookback_secs } => {
            let since = SystemClock
                .now_millis()
                .saturating_sub(lookback_secs.saturating_mul(1_000));
            let signals = relay.fetch_since(&room, since).await?;
            let snapshot = presence::snapshot(&signals, "");
            println!("active ({}):", snapshot.active.len());
            for peer in &snapshot.active {
                println!("  {peer}");
            }
            println!("departed ({}):", snapshot.departed.len());
            for peer in &snapshot.departed {
                println!("  {peer}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn no_command_means_serve() {
        let cli = Cli::try_parse_from(["cove-relay"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test_timeout::timeout]
    fn serve_flags_override_config() {
        let cli = Cli::try_parse_from(["cove-relay", "serve", "--addr", "127.0.0.1:9", "--memory"])
            .unwrap();
        let Some(Commands::Serve(args)) = cli.command else {
            panic!("expected serve");
        };
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.addr, "127.0.0.1:9");
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert!(!config.open_rooms);
    }

    #[test_timeout::timeout]
    fn debug_presence_parses() {
        let cli = Cli::try_parse_from([
            "cove-relay", "debug", "--room", "ROOM1", "presence", "--lookback-secs", "10",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Debug { url, room, command }) => {
                assert_eq!(url, "http://localhost:8080");
                assert_eq!(room, "ROOM1");
                assert!(matches!(command, DebugCommands::Presence { lookback_secs: 10 }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
