//! Process-wide transport metrics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::LazyLock;

use arq_core::Stats;

/// Counters aggregated across every connection in the process.
#[derive(Debug, Default)]
pub struct GlobalMetrics {
    pub connections_created: AtomicU64,
    pub active_connections: AtomicUsize,
    pub total_bytes_sent: AtomicU64,
    pub total_bytes_received: AtomicU64,
    pub total_packets_sent: AtomicU64,
    pub total_packets_received: AtomicU64,
    pub total_retransmissions: AtomicU64,
}

impl GlobalMetrics {
    pub fn connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self, final_stats: &Stats) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.total_bytes_sent
            .fetch_add(final_stats.bytes_sent, Ordering::Relaxed);
        self.total_bytes_received
            .fetch_add(final_stats.bytes_received, Ordering::Relaxed);
        self.total_packets_sent
            .fetch_add(final_stats.packets_sent, Ordering::Relaxed);
        self.total_packets_received
            .fetch_add(final_stats.packets_received, Ordering::Relaxed);
        self.total_retransmissions
            .fetch_add(final_stats.retransmissions, Ordering::Relaxed);
    }

    /// Plain-value snapshot for reporting.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
            total_bytes_received: self.total_bytes_received.load(Ordering::Relaxed),
            total_packets_sent: self.total_packets_sent.load(Ordering::Relaxed),
            total_packets_received: self.total_packets_received.load(Ordering::Relaxed),
            total_retransmissions: self.total_retransmissions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`GlobalMetrics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub connections_created: u64,
    pub active_connections: usize,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_packets_sent: u64,
    pub total_packets_received: u64,
    pub total_retransmissions: u64,
}

static GLOBAL: LazyLock<GlobalMetrics> = LazyLock::new(GlobalMetrics::default);

/// The process-wide metrics instance.
pub fn global() -> &'static GlobalMetrics {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_counters_balance() {
        let metrics = GlobalMetrics::default();
        metrics.connection_created();
        metrics.connection_created();
        assert_eq!(metrics.snapshot().active_connections, 2);

        let stats = Stats {
            bytes_sent: 10,
            packets_sent: 2,
            ..Stats::default()
        };
        metrics.connection_closed(&stats);
        let snap = metrics.snapshot();
        assert_eq!(snap.active_connections, 1);
        assert_eq!(snap.total_bytes_sent, 10);
        assert_eq!(snap.total_packets_sent, 2);
    }
}
