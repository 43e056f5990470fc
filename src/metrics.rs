use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Why a connection registration or delivery was rejected.
#[derive(Debug, Clone, Copy)]
pub enum RejectReason {
    AuthRevoked,
    HeartbeatTimeout,
    RateLimited,
    QueueFull,
}

/// Process-wide gateway counters, updated with relaxed atomics.
///
/// Constructed once at startup alongside the gateway; an embedding HTTP
/// layer serves [`MetricsSnapshot`] from its metrics endpoint.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub active_connections: AtomicU64,
    pub rejected_auth: AtomicU64,
    pub rejected_heartbeat: AtomicU64,
    pub rejected_rate_limit: AtomicU64,
    pub rejected_queue_full: AtomicU64,
    pub broadcasts_sent: AtomicU64,
    pub broadcasts_failed: AtomicU64,
    pub bus_reconnects: AtomicU64,
    pub events_dropped: AtomicU64,
    pub events_malformed: AtomicU64,
    pub dead_letters: AtomicU64,
    pub drop_rate_alerts: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        // Saturating: unregister is idempotent, the counter must not wrap
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn rejected(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::AuthRevoked => &self.rejected_auth,
            RejectReason::HeartbeatTimeout => &self.rejected_heartbeat,
            RejectReason::RateLimited => &self.rejected_rate_limit,
            RejectReason::QueueFull => &self.rejected_queue_full,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast_result(&self, sent: u64, failed: u64) {
        self.broadcasts_sent.fetch_add(sent, Ordering::Relaxed);
        self.broadcasts_failed.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_auth: self.rejected_auth.load(Ordering::Relaxed),
            rejected_heartbeat: self.rejected_heartbeat.load(Ordering::Relaxed),
            rejected_rate_limit: self.rejected_rate_limit.load(Ordering::Relaxed),
            rejected_queue_full: self.rejected_queue_full.load(Ordering::Relaxed),
            broadcasts_sent: self.broadcasts_sent.load(Ordering::Relaxed),
            broadcasts_failed: self.broadcasts_failed.load(Ordering::Relaxed),
            bus_reconnects: self.bus_reconnects.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            events_malformed: self.events_malformed.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            drop_rate_alerts: self.drop_rate_alerts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters, serializable for the metrics
/// endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub active_connections: u64,
    pub rejected_auth: u64,
    pub rejected_heartbeat: u64,
    pub rejected_rate_limit: u64,
    pub rejected_queue_full: u64,
    pub broadcasts_sent: u64,
    pub broadcasts_failed: u64,
    pub bus_reconnects: u64,
    pub events_dropped: u64,
    pub events_malformed: u64,
    pub dead_letters: u64,
    pub drop_rate_alerts: u64,
}

/// Health report for the health endpoint: breaker state plus ingress lag.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub breaker_state: String,
    /// Entries delivered to the consumer group but not yet acknowledged
    pub ingress_pending: u64,
    pub active_connections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_counter_never_underflows() {
        let m = GatewayMetrics::new();
        m.connection_closed();
        assert_eq!(m.snapshot().active_connections, 0);
        m.connection_opened();
        m.connection_closed();
        m.connection_closed();
        assert_eq!(m.snapshot().active_connections, 0);
    }

    #[test]
    fn rejects_count_by_reason() {
        let m = GatewayMetrics::new();
        m.rejected(RejectReason::AuthRevoked);
        m.rejected(RejectReason::QueueFull);
        m.rejected(RejectReason::QueueFull);
        let snap = m.snapshot();
        assert_eq!(snap.rejected_auth, 1);
        assert_eq!(snap.rejected_queue_full, 2);
        assert_eq!(snap.rejected_heartbeat, 0);
    }
}
