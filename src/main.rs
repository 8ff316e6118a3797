use clap::Parser;
use podshaper::cli::{commands, Cli};
use std::process;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("Starting podshaper v{}", podshaper::VERSION);

    if let Err(e) = commands::handle_command(cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
