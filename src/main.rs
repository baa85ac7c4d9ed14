//! pbr-keeper - policy-based routing keeper for Linux routers.

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use pbr_keeper::cli::{Cli, Commands};
use pbr_keeper::commands;
use pbr_keeper::signal::cancel_on_signal;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    let config = cli.config.as_path();
    let json = cli.json;
    match cli.command {
        Commands::Apply { dry_run, watch } => {
            commands::apply::run(config, dry_run, watch, json, cancel).await
        }
        Commands::Teardown => commands::teardown::run(config).await,
        Commands::Download => commands::download::run(config, json, cancel).await,
        Commands::Lists => commands::lists::run(config, json).await,
        Commands::SelfCheck { repair } => {
            commands::self_check::run(config, repair, json, cancel).await
        }
        Commands::CheckRouting { host } => {
            commands::check_routing::run(config, &host, json, cancel).await
        }
        Commands::Probe { kind, host } => {
            commands::probe::run(config, kind, &host, json, cancel).await
        }
        Commands::Interfaces => commands::interfaces::run(config, json).await,
    }
}
