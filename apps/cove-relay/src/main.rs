use clap::Parser;
use tracing::error;

use cove_relay::{
    cli::{self, Cli, Commands, ServeArgs},
    config::Config,
    server,
    telemetry::{init_tracing, DEFAULT_LOG_FILTER},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(DEFAULT_LOG_FILTER);
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Debug { url, room, command }) => {
            if let Err(err) = cli::run_debug_client(url, room, command).await {
                error!(error = %err, "debug client failed");
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Commands::Serve(args)) => run_server(args).await,
        None => run_server(ServeArgs::default()).await,
    }
}

async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = Config::from_env();
    args.apply(&mut config);
    server::serve(config).await
}
