//! # Command Line Interface
//!
//! Argument parsing and command implementations for the LanBeam binary.
//!
//! ## Commands
//!
//! - `init` - Write the default configuration and generate the transfer key
//! - `daemon` - Run peer discovery and the file-receive server until Ctrl-C
//! - `send` - Send one or more files to a peer
//! - `peers` - Listen for beacons briefly and print discovered peers

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::crypto::TransferKey;
use crate::discovery::DiscoveryService;
use crate::monitor::MetricsSampler;
use crate::peers::PeerRegistry;
use crate::transfer::{FileClient, FileServer, TransferStatus};

/// Command-line interface structure for LanBeam.
#[derive(Parser)]
#[command(name = "lanbeam")]
#[command(about = "Serverless LAN peer discovery and encrypted file transfer")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands for LanBeam.
#[derive(Subcommand)]
pub enum Commands {
    /// Initialize LanBeam configuration and generate the transfer key
    Init,

    /// Run discovery and the file-receive server until interrupted
    Daemon,

    /// Send one or more files to a peer
    Send {
        /// Target peer's IP address
        peer: String,
        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Optional text message, delivered with the first file
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Listen for beacons and print the peers heard from
    Peers {
        /// Seconds to listen before printing
        #[arg(short, long, default_value_t = 6)]
        wait: u64,
    },
}

/// Initialize configuration and key material.
pub async fn init() -> Result<()> {
    let config = Config::init()?;
    info!("Configuration written to {}", config.config_path().display());

    TransferKey::load_or_generate(&config.key_path())?;

    println!("{} LanBeam initialized", "OK".green().bold());
    println!("Config:   {}", config.config_path().display());
    println!("Key file: {}", config.key_path().display());
    println!("Receive:  {}", config.receive_dir.display());
    Ok(())
}

/// Run discovery + file server until Ctrl-C.
pub async fn run_daemon() -> Result<()> {
    let config = Config::load_or_init()?;
    let key = TransferKey::load_or_generate(&config.key_path())?;

    let registry = Arc::new(PeerRegistry::new(
        config.peer_stale_timeout(),
        config.peer_dead_timeout(),
    ));

    let sampler = Arc::new(MetricsSampler::new());
    let discovery = DiscoveryService::new(&config, registry.clone(), Some(sampler.provider()));
    discovery.start().await?;

    let server = FileServer::new(&config, key).with_observers(
        None,
        Some(Arc::new(|record| {
            match record.status {
                TransferStatus::Complete => println!(
                    "{} received {} from {} ({} bytes)",
                    "OK".green().bold(),
                    record.filename,
                    record.peer_ip,
                    record.bytes_transferred
                ),
                _ => println!(
                    "{} transfer of {} from {}: {}",
                    "FAILED".red().bold(),
                    record.filename,
                    record.peer_ip,
                    record.error.as_deref().unwrap_or("unknown error")
                ),
            }
        })),
    );
    server.start().await?;

    println!(
        "LanBeam daemon running (discovery :{}, transfer :{}). Press Ctrl-C to stop.",
        config.discovery_port, config.transfer_port
    );

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");

    discovery.shutdown().await;
    server.shutdown().await;
    Ok(())
}

/// Send files to a peer and report per-file results.
pub async fn send_files(peer: String, files: Vec<PathBuf>, message: Option<String>) -> Result<()> {
    let config = Config::load_or_init()?;
    let key = TransferKey::load_or_generate(&config.key_path())?;

    let client = FileClient::new(&config, key);
    let handles = client.send_many(&peer, &files, message);
    for handle in handles {
        let _ = handle.await;
    }

    let records = client.transfers();
    if records.is_empty() {
        anyhow::bail!("no transfer started; do the files exist?");
    }

    let mut failed = 0;
    for record in &records {
        match record.status {
            TransferStatus::Complete => println!(
                "{} {} ({} bytes, {:.2} MB/s)",
                "sent".green(),
                record.filename,
                record.bytes_transferred,
                record.speed_mbps()
            ),
            _ => {
                failed += 1;
                println!(
                    "{} {}: {}",
                    "failed".red(),
                    record.filename,
                    record.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} transfer(s) failed", records.len());
    }
    Ok(())
}

/// Listen for beacons for `wait` seconds and print what was heard.
pub async fn show_peers(wait: u64) -> Result<()> {
    let config = Config::load_or_init()?;
    let registry = Arc::new(PeerRegistry::new(
        config.peer_stale_timeout(),
        config.peer_dead_timeout(),
    ));

    let discovery = DiscoveryService::new(&config, registry.clone(), None);
    discovery.start().await?;

    println!("Listening for peers for {}s...", wait);
    tokio::time::sleep(Duration::from_secs(wait)).await;
    discovery.shutdown().await;

    let peers = registry.list();
    if peers.is_empty() {
        println!("No peers discovered.");
        return Ok(());
    }

    println!(
        "{:<20} {:<16} {:>6} {:>8} {:>8}",
        "HOSTNAME", "IP", "PORT", "STATUS", "AGE"
    );
    for peer in peers {
        println!(
            "{:<20} {:<16} {:>6} {:>8} {:>7.1}s",
            peer.hostname,
            peer.ip,
            peer.port,
            format!("{:?}", peer.status).to_lowercase(),
            peer.age().as_secs_f64()
        );
    }
    Ok(())
}
