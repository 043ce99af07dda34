//! # Peer Discovery Service
//!
//! Heartbeat-based presence over UDP broadcast. Two concurrent loops share
//! the [`PeerRegistry`]:
//!
//! - **Broadcaster**: every interval (default 2s) emits a JSON beacon with
//!   this node's hostname, IP, transfer port, timestamp, and an optional
//!   metrics snapshot, then sweeps the registry.
//! - **Listener**: binds the discovery UDP port and folds received beacons
//!   into the registry, ignoring our own broadcasts and malformed datagrams.
//!
//! Both loops watch a shared [`CancellationToken`] so `shutdown()` stops the
//! service within roughly one poll interval. Send failures never stop the
//! broadcaster; decode failures never stop the listener.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{self, Config, BROADCAST_ADDR};
use crate::peers::{PeerMetrics, PeerRegistry};

/// Injected metrics provider. Returning `None` (on failure or absence of a
/// sampler) simply omits the metrics field from the next beacon.
pub type MetricsFn = Arc<dyn Fn() -> Option<PeerMetrics> + Send + Sync>;

/// One heartbeat datagram, JSON-encoded on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Beacon {
    #[serde(default = "unknown_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
    /// Sender's clock at emission, Unix seconds.
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PeerMetrics>,
}

fn unknown_hostname() -> String {
    "unknown".to_string()
}

/// UDP broadcaster + listener pair maintaining the peer registry.
pub struct DiscoveryService {
    registry: Arc<PeerRegistry>,
    metrics_fn: Option<MetricsFn>,
    discovery_port: u16,
    transfer_port: u16,
    interval: Duration,
    peer_timeout: Duration,
    hostname: String,
    local_ip: String,
    /// Lightweight `{ip -> last seen}` tracker, independent of the registry.
    active: Arc<Mutex<HashMap<String, Instant>>>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    pub fn new(config: &Config, registry: Arc<PeerRegistry>, metrics_fn: Option<MetricsFn>) -> Self {
        Self {
            registry,
            metrics_fn,
            discovery_port: config.discovery_port,
            transfer_port: config.transfer_port,
            interval: config.broadcast_interval(),
            peer_timeout: config.peer_timeout(),
            hostname: config::local_hostname(),
            local_ip: config::local_ip(),
            active: Arc::new(Mutex::new(HashMap::new())),
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind both sockets and spawn the broadcaster and listener loops.
    pub async fn start(&self) -> Result<()> {
        let listen_sock = UdpSocket::bind(("0.0.0.0", self.discovery_port))
            .await
            .with_context(|| format!("cannot bind UDP listener on port {}", self.discovery_port))?;

        let send_sock = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .context("cannot bind UDP broadcast socket")?;
        send_sock.set_broadcast(true)?;

        info!("Peer discovery started on UDP port {}", self.discovery_port);

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Self::broadcast_loop(
            send_sock,
            self.build_beacon_template(),
            self.metrics_fn.clone(),
            self.registry.clone(),
            self.active.clone(),
            self.discovery_port,
            self.interval,
            self.peer_timeout,
            self.token.clone(),
        )));
        tasks.push(tokio::spawn(Self::listen_loop(
            listen_sock,
            self.registry.clone(),
            self.active.clone(),
            self.local_ip.clone(),
            self.transfer_port,
            self.token.clone(),
        )));
        Ok(())
    }

    /// Stop both loops and wait for them to exit. Idempotent.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Peer discovery stopped");
    }

    /// Copy of the lightweight `{ip -> last seen}` tracker.
    pub fn active_peers(&self) -> HashMap<String, Instant> {
        self.active.lock().clone()
    }

    /// The IP this node announces (and suppresses on receive).
    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    fn build_beacon_template(&self) -> Beacon {
        Beacon {
            hostname: self.hostname.clone(),
            ip: self.local_ip.clone(),
            port: self.transfer_port,
            timestamp: 0.0,
            metrics: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn broadcast_loop(
        sock: UdpSocket,
        template: Beacon,
        metrics_fn: Option<MetricsFn>,
        registry: Arc<PeerRegistry>,
        active: Arc<Mutex<HashMap<String, Instant>>>,
        port: u16,
        interval: Duration,
        peer_timeout: Duration,
        token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let mut beacon = template.clone();
                    beacon.timestamp = unix_now();
                    beacon.metrics = metrics_fn.as_ref().and_then(|f| f());

                    match serde_json::to_vec(&beacon) {
                        Ok(payload) => {
                            if let Err(e) = sock
                                .send_to(&payload, (BROADCAST_ADDR, port))
                                .await
                            {
                                debug!("Broadcast send error: {}", e);
                            }
                        }
                        Err(e) => warn!("Failed to encode beacon: {}", e),
                    }

                    sweep_tracker(&active, peer_timeout);
                    registry.sweep();
                }
            }
        }
    }

    async fn listen_loop(
        sock: UdpSocket,
        registry: Arc<PeerRegistry>,
        active: Arc<Mutex<HashMap<String, Instant>>>,
        local_ip: String,
        default_transfer_port: u16,
        token: CancellationToken,
    ) {
        let mut buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                result = sock.recv_from(&mut buf) => match result {
                    Ok((len, addr)) => handle_datagram(
                        &buf[..len],
                        addr,
                        &registry,
                        &active,
                        &local_ip,
                        default_transfer_port,
                    ),
                    Err(e) => debug!("Listen error: {}", e),
                },
            }
        }
    }
}

fn handle_datagram(
    data: &[u8],
    addr: SocketAddr,
    registry: &PeerRegistry,
    active: &Mutex<HashMap<String, Instant>>,
    local_ip: &str,
    default_transfer_port: u16,
) {
    let beacon: Beacon = match serde_json::from_slice(data) {
        Ok(b) => b,
        Err(e) => {
            debug!("Discarding malformed beacon from {}: {}", addr, e);
            return;
        }
    };

    // Ignore our own broadcasts.
    if beacon.ip == local_ip {
        return;
    }

    let peer_ip = if beacon.ip.is_empty() {
        addr.ip().to_string()
    } else {
        beacon.ip.clone()
    };
    let port = if beacon.port == 0 {
        default_transfer_port
    } else {
        beacon.port
    };

    active.lock().insert(peer_ip.clone(), Instant::now());
    registry.update(&beacon.hostname, &peer_ip, port, beacon.metrics);
}

fn sweep_tracker(active: &Mutex<HashMap<String, Instant>>, peer_timeout: Duration) {
    active.lock().retain(|ip, last_seen| {
        let keep = last_seen.elapsed() <= peer_timeout;
        if !keep {
            info!("Peer auto-removed (timeout): {}", ip);
        }
        keep
    });
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
