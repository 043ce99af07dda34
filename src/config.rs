//! # Configuration Management
//!
//! TOML-based configuration for LanBeam: discovery and transfer ports,
//! heartbeat/liveness timing, chunking and framing limits, and the paths for
//! the receive directory and the persisted transfer key.
//!
//! The configuration lives in a platform-appropriate directory (e.g.
//! `~/.config/lanbeam/` on Linux), overridable via `LANBEAM_CONFIG_DIR` for
//! tests and unusual deployments.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// UDP port beacons are broadcast to and received on.
pub const DEFAULT_DISCOVERY_PORT: u16 = 37020;

/// TCP port the file server listens on.
pub const DEFAULT_TRANSFER_PORT: u16 = 5000;

/// Subnet broadcast address for discovery beacons.
pub const BROADCAST_ADDR: &str = "255.255.255.255";

/// Per-chunk plaintext size for file streaming: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Main configuration structure for a LanBeam node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery_port: u16,
    pub transfer_port: u16,
    /// Seconds between heartbeat beacons.
    pub broadcast_interval_secs: u64,
    /// Seconds without a beacon before a peer is marked stale.
    pub peer_stale_secs: u64,
    /// Seconds without a beacon before a peer is removed.
    pub peer_dead_secs: u64,
    /// Timeout for the discovery service's lightweight last-seen tracker.
    pub peer_timeout_secs: u64,
    /// Plaintext bytes per encrypted transfer chunk.
    pub chunk_size: usize,
    /// Maximum accepted frame payload in bytes.
    pub max_frame_len: usize,
    /// Outbound TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// TCP listen backlog for the file server.
    pub transfer_backlog: u32,
    /// Directory received files are written into.
    pub receive_dir: PathBuf,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
            broadcast_interval_secs: 2,
            peer_stale_secs: 6,
            peer_dead_secs: 10,
            peer_timeout_secs: 10,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_len: crate::framing::MAX_FRAME_LEN,
            connect_timeout_secs: 30,
            transfer_backlog: 5,
            receive_dir: default_receive_dir(),
            config_file_path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Create a fresh configuration with defaults and persist it.
    pub fn init() -> Result<Self> {
        let config_dir = Self::config_dir()?;
        std::fs::create_dir_all(&config_dir)?;

        let mut config = Self::default();
        config.config_file_path = config_dir.join("config.toml");
        config.save()?;
        Ok(config)
    }

    /// Load the persisted configuration.
    pub fn load() -> Result<Self> {
        let config_file = Self::config_dir()?.join("config.toml");

        if !config_file.exists() {
            anyhow::bail!("LanBeam not initialized. Run 'lanbeam init' first.");
        }

        let content = std::fs::read_to_string(&config_file)?;
        let mut config: Config = toml::from_str(&content)?;
        config.config_file_path = config_file;
        Ok(config)
    }

    /// Load the persisted configuration, or fall back to (and persist)
    /// defaults on first run.
    pub fn load_or_init() -> Result<Self> {
        if Self::config_dir()?.join("config.toml").exists() {
            Self::load()
        } else {
            Self::init()
        }
    }

    pub fn save(&self) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.config_file_path, content)?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    /// Path of the persisted transfer key.
    pub fn key_path(&self) -> PathBuf {
        self.config_file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
            .join("transfer.key")
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }

    pub fn peer_stale_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_stale_secs)
    }

    pub fn peer_dead_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_dead_secs)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("LANBEAM_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("lanbeam");
        Ok(config_dir)
    }
}

fn default_receive_dir() -> PathBuf {
    dirs::download_dir()
        .map(|d| d.join("lanbeam"))
        .unwrap_or_else(|| PathBuf::from("received_files"))
}

/// This machine's hostname, as announced in beacons.
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// This machine's LAN IP address, used for self-beacon suppression.
/// Falls back to loopback when no interface can be resolved.
pub fn local_ip() -> String {
    local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
