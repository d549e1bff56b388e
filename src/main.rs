use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use pdfqa::cli::commands::{
    handle_config, handle_ingest, handle_search, handle_serve, handle_status,
};
use pdfqa::cli::{Cli, Commands};
use pdfqa::models::Config;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    let json = cli.json;

    tokio::select! {
        result = run_command(cli.command, config, json) => {
            result?;
        }
        _ = shutdown_signal() => {
            eprintln!("\nReceived shutdown signal, cleaning up...");
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }
    }

    Ok(())
}

async fn run_command(command: Commands, config: Config, json: bool) -> Result<()> {
    match command {
        Commands::Serve => {
            handle_serve(config).await?;
        }
        Commands::Ingest(args) => {
            handle_ingest(args, config, json).await?;
        }
        Commands::Search(args) => {
            handle_search(args, config, json).await?;
        }
        Commands::Status => {
            handle_status(config, json).await?;
        }
        Commands::Config(command) => {
            handle_config(command, config, json).await?;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
