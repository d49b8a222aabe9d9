//! Message center counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the message center and its connections.
#[derive(Debug, Default)]
pub struct MessagingStats {
    sent: AtomicU64,
    received: AtomicU64,
    rerouted: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    connections_created: AtomicU64,
    connections_dead: AtomicU64,
}

/// Point in time copy of [`MessagingStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessagingStatsSnapshot {
    /// Frames written to gateways.
    pub sent: u64,
    /// Messages decoded from gateways.
    pub received: u64,
    /// Messages routed again after their connection failed.
    pub rerouted: u64,
    /// Requests answered locally with a rejection.
    pub rejected: u64,
    /// One-way messages and responses discarded because they could not be routed.
    pub dropped: u64,
    /// Gateway connections created.
    pub connections_created: u64,
    /// Gateway connections declared dead.
    pub connections_dead: u64,
}

impl MessagingStats {
    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rerouted(&self) {
        self.rerouted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_dead(&self) {
        self.connections_dead.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the current counter values.
    pub fn snapshot(&self) -> MessagingStatsSnapshot {
        MessagingStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            rerouted: self.rerouted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_dead: self.connections_dead.load(Ordering::Relaxed),
        }
    }
}
