//! # Local Resource Metrics
//!
//! `sysinfo`-backed sampler implementing the discovery service's metrics
//! provider contract: each call returns a fresh [`PeerMetrics`] snapshot for
//! embedding in the next outgoing beacon, or `None` when sampling is not
//! possible. Fields the platform exposes no counter for are reported as zero;
//! receivers treat the snapshot as opaque either way.

use parking_lot::Mutex;
use std::sync::Arc;
use sysinfo::{Networks, System};

use crate::discovery::MetricsFn;
use crate::peers::PeerMetrics;

/// Stateful sampler. CPU load is computed from the delta between successive
/// refreshes, so the first snapshot after startup reads as 0%.
pub struct MetricsSampler {
    inner: Mutex<Inner>,
}

struct Inner {
    sys: System,
    networks: Networks,
}

impl MetricsSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();

        Self {
            inner: Mutex::new(Inner {
                sys,
                networks: Networks::new_with_refreshed_list(),
            }),
        }
    }

    /// Take one snapshot of the local machine.
    pub fn snapshot(&self) -> PeerMetrics {
        let mut inner = self.inner.lock();
        inner.sys.refresh_cpu();
        inner.sys.refresh_memory();
        inner.networks.refresh();

        let cpu_percent = f64::from(inner.sys.global_cpu_info().cpu_usage());

        let total_mem = inner.sys.total_memory();
        let ram_percent = if total_mem == 0 {
            0.0
        } else {
            inner.sys.used_memory() as f64 / total_mem as f64 * 100.0
        };

        let mut net_sent_bytes = 0u64;
        let mut net_recv_bytes = 0u64;
        for (_name, data) in inner.networks.iter() {
            net_sent_bytes = net_sent_bytes.saturating_add(data.total_transmitted());
            net_recv_bytes = net_recv_bytes.saturating_add(data.total_received());
        }

        PeerMetrics {
            cpu_percent,
            ram_percent,
            // sysinfo exposes no machine-wide disk I/O counters.
            disk_read_bytes: 0,
            disk_write_bytes: 0,
            net_sent_bytes,
            net_recv_bytes,
        }
    }

    /// Wrap the sampler into the closure shape the discovery service takes.
    pub fn provider(self: &Arc<Self>) -> MetricsFn {
        let sampler = self.clone();
        Arc::new(move || Some(sampler.snapshot()))
    }
}

impl Default for MetricsSampler {
    fn default() -> Self {
        Self::new()
    }
}
