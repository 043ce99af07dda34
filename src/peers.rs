//! # Peer Registry
//!
//! In-memory table of peers discovered on the local network, with a
//! heartbeat-driven liveness state machine: a peer is ONLINE while beacons
//! keep arriving, turns STALE once unseen past the stale threshold, and is
//! removed entirely past the dead threshold.
//!
//! The registry is the only state shared between the discovery loops and
//! external readers. All access goes through one internal mutex, and callers
//! only ever receive cloned snapshots, never live references.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Callback fired after any registry mutation (add/refresh/stale/remove).
/// Carries no payload; consumers re-query the registry. May be invoked from
/// any task and must not block.
pub type PeerChangeFn = Arc<dyn Fn() + Send + Sync>;

/// Liveness states for a discovered peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Stale,
}

/// Lightweight system metrics snapshot carried inside a beacon.
///
/// The discovery layer does not interpret these fields; it only stores the
/// most recent snapshot per peer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerMetrics {
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub ram_percent: f64,
    #[serde(default)]
    pub disk_read_bytes: u64,
    #[serde(default)]
    pub disk_write_bytes: u64,
    #[serde(default)]
    pub net_sent_bytes: u64,
    #[serde(default)]
    pub net_recv_bytes: u64,
}

/// One discovered remote node. IP address is the unique key.
#[derive(Clone, Debug)]
pub struct Peer {
    pub hostname: String,
    pub ip: String,
    pub port: u16,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub status: PeerStatus,
    pub metrics: PeerMetrics,
}

impl Peer {
    /// Time since the last beacon from this peer.
    pub fn age(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

/// Thread-safe map of IP address to [`Peer`].
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, Peer>>,
    stale_timeout: Duration,
    dead_timeout: Duration,
    on_change: Option<PeerChangeFn>,
}

impl PeerRegistry {
    pub fn new(stale_timeout: Duration, dead_timeout: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            stale_timeout,
            dead_timeout,
            on_change: None,
        }
    }

    /// Attach a change-notification callback.
    pub fn with_observer(mut self, on_change: PeerChangeFn) -> Self {
        self.on_change = Some(on_change);
        self
    }

    /// Register or refresh a peer from a received beacon.
    ///
    /// Unknown IPs insert a new ONLINE peer; known IPs refresh `last_seen`,
    /// reset the status to ONLINE, and overwrite the metrics snapshot when
    /// one was supplied. The change notification fires after the lock is
    /// released.
    pub fn update(&self, hostname: &str, ip: &str, port: u16, metrics: Option<PeerMetrics>) {
        let now = Instant::now();
        {
            let mut peers = self.peers.lock();
            match peers.get_mut(ip) {
                Some(peer) => {
                    peer.last_seen = now;
                    peer.status = PeerStatus::Online;
                    if let Some(m) = metrics {
                        peer.metrics = m;
                    }
                }
                None => {
                    info!("Discovered new peer: {} ({})", hostname, ip);
                    peers.insert(
                        ip.to_string(),
                        Peer {
                            hostname: hostname.to_string(),
                            ip: ip.to_string(),
                            port,
                            first_seen: now,
                            last_seen: now,
                            status: PeerStatus::Online,
                            metrics: metrics.unwrap_or_default(),
                        },
                    );
                }
            }
        }
        self.notify();
    }

    /// Mark stale peers and remove dead ones.
    ///
    /// Fires one change notification per sweep if anything changed.
    pub fn sweep(&self) {
        let mut changed = false;
        {
            let mut peers = self.peers.lock();
            let mut dead = Vec::new();

            for (ip, peer) in peers.iter_mut() {
                let age = peer.age();
                if age > self.dead_timeout {
                    dead.push(ip.clone());
                } else if age > self.stale_timeout && peer.status == PeerStatus::Online {
                    peer.status = PeerStatus::Stale;
                    changed = true;
                    info!("Peer stale: {} ({})", peer.hostname, ip);
                }
            }

            for ip in dead {
                if let Some(removed) = peers.remove(&ip) {
                    changed = true;
                    info!("Peer removed: {} ({})", removed.hostname, ip);
                }
            }
        }

        if changed {
            self.notify();
        }
    }

    /// Snapshot of all known peers.
    pub fn list(&self) -> Vec<Peer> {
        self.peers.lock().values().cloned().collect()
    }

    /// Snapshot of a single peer by IP.
    pub fn get(&self, ip: &str) -> Option<Peer> {
        self.peers.lock().get(ip).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    fn notify(&self) {
        if let Some(cb) = &self.on_change {
            cb();
        }
    }
}
