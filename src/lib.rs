//! # LanBeam
//!
//! Serverless LAN file sharing: nodes on a local network discover each other
//! through UDP heartbeat beacons and exchange files over an encrypted,
//! framed, integrity-checked TCP protocol. No central server, no pairing
//! ceremony; any node holding the shared transfer key participates.
//!
//! ## Core Modules
//!
//! - [`cli`] - Command-line interface and command implementations
//! - [`config`] - Configuration management and node identity
//! - [`crypto`] - Transfer-key and passphrase encryption backends
//! - [`framing`] - Length-prefixed message framing for stream sockets
//! - [`peers`] - Thread-safe peer registry with liveness tracking
//! - [`discovery`] - UDP broadcast/listen heartbeat service
//! - [`transfer`] - Encrypted file transfer server and client
//! - [`monitor`] - Local resource metrics embedded in beacons
//!
//! ## Quick Start
//!
//! ```bash
//! # First run: write config and generate the transfer key
//! lanbeam init
//!
//! # Receive files and announce presence
//! lanbeam daemon
//!
//! # From another node sharing the same key file
//! lanbeam send 192.168.1.20 photo.jpg --message "holiday pics"
//! ```

pub mod cli;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod framing;
pub mod monitor;
pub mod peers;
pub mod transfer;

pub use config::Config;
pub use crypto::TransferKey;
pub use discovery::DiscoveryService;
pub use peers::PeerRegistry;
pub use transfer::{FileClient, FileServer};
