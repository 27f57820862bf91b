use clap::Parser;

use cove_client_core::{
    cli::{self, Cli, Commands},
    config::ClientConfig,
    telemetry::{DEFAULT_LOG_FILTER, init_tracing},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(DEFAULT_LOG_FILTER);
    let cli = Cli::parse();
    let config = ClientConfig::from_env();

    match cli.command {
        Commands::Call(args) => cli::run_call(args, config).await,
        Commands::Who(args) => cli::run_who(args, &config).await,
    }
}
