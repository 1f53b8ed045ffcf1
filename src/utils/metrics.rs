//! Observability and Metrics
//!
//! Atomic counters for the datagram transport, the reliable event layer and the
//! session state machines. Every path that drops a datagram or a session without
//! telling the caller bumps one of these, so silent failures stay visible.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Global metrics collector for protocol operations
#[derive(Debug)]
pub struct Metrics {
    /// Datagrams handed to the socket
    pub datagrams_sent: AtomicU64,
    /// Datagrams read from the socket
    pub datagrams_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Datagrams that could not be unframed
    pub decode_failures: AtomicU64,
    /// Datagrams that failed decryption and were parsed as plaintext
    pub decrypt_fallbacks: AtomicU64,
    /// Messages dropped because the sender has no session
    pub unknown_peer_drops: AtomicU64,
    /// Outbound messages sealed for a peer key
    pub encryptions: AtomicU64,
    /// Outbound messages that could not be sealed
    pub encryption_failures: AtomicU64,
    /// Application events assigned an id and sent
    pub events_sent: AtomicU64,
    /// Application events handed to a listener
    pub events_delivered: AtomicU64,
    /// Event receipts ignored as duplicates
    pub events_duplicate: AtomicU64,
    /// Event retransmissions after a missed confirmation
    pub retransmissions: AtomicU64,
    /// Total sessions accepted
    pub connections_total: AtomicU64,
    /// Currently active sessions
    pub connections_active: AtomicU64,
    /// Connect requests answered with a rejection
    pub connections_rejected: AtomicU64,
    /// Sessions torn down by the liveness countdown
    pub timeouts: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            datagrams_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            decrypt_fallbacks: AtomicU64::new(0),
            unknown_peer_drops: AtomicU64::new(0),
            encryptions: AtomicU64::new(0),
            encryption_failures: AtomicU64::new(0),
            events_sent: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            events_duplicate: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a datagram sent
    pub fn datagram_sent(&self, byte_count: u64) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a datagram received
    pub fn datagram_received(&self, byte_count: u64) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrypt_fallback(&self) {
        self.decrypt_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_peer_drop(&self) {
        self.unknown_peer_drops.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sealed outbound message
    pub fn encryption(&self) {
        self.encryptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn encryption_failure(&self) {
        self.encryption_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_sent(&self) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_duplicate(&self) {
        self.events_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch of retransmitted events
    pub fn retransmissions(&self, count: u64) {
        self.retransmissions.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a new session
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a session closed
    pub fn connection_closed(&self) {
        // saturate rather than wrap if a close is reported twice
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            decrypt_fallbacks: self.decrypt_fallbacks.load(Ordering::Relaxed),
            unknown_peer_drops: self.unknown_peer_drops.load(Ordering::Relaxed),
            encryptions: self.encryptions.load(Ordering::Relaxed),
            encryption_failures: self.encryption_failures.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_duplicate: self.events_duplicate.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            datagrams_sent = s.datagrams_sent,
            datagrams_received = s.datagrams_received,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            decode_failures = s.decode_failures,
            decrypt_fallbacks = s.decrypt_fallbacks,
            unknown_peer_drops = s.unknown_peer_drops,
            encryptions = s.encryptions,
            encryption_failures = s.encryption_failures,
            events_sent = s.events_sent,
            events_delivered = s.events_delivered,
            events_duplicate = s.events_duplicate,
            retransmissions = s.retransmissions,
            connections_total = s.connections_total,
            connections_active = s.connections_active,
            connections_rejected = s.connections_rejected,
            timeouts = s.timeouts,
            uptime_seconds = s.uptime_seconds,
            "Protocol metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub decode_failures: u64,
    pub decrypt_fallbacks: u64,
    pub unknown_peer_drops: u64,
    pub encryptions: u64,
    pub encryption_failures: u64,
    pub events_sent: u64,
    pub events_delivered: u64,
    pub events_duplicate: u64,
    pub retransmissions: u64,
    pub connections_total: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub timeouts: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}
