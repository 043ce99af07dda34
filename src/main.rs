//! # LanBeam CLI Application
//!
//! Main entry point for the LanBeam LAN file-sharing utility. Sets up
//! logging, parses command line arguments, and dispatches to the matching
//! command handler.

use anyhow::Result;
use clap::Parser;
use colored::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod config;
mod crypto;
mod discovery;
mod framing;
mod monitor;
mod peers;
mod transfer;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lanbeam=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = match cli.command {
        Commands::Init => cli::init().await,
        Commands::Daemon => cli::run_daemon().await,
        Commands::Send {
            peer,
            files,
            message,
        } => cli::send_files(peer, files, message).await,
        Commands::Peers { wait } => cli::show_peers(wait).await,
    } {
        eprintln!("{} {}", "Error:".red().bold(), e.to_string().red());
        std::process::exit(1);
    }
    Ok(())
}
