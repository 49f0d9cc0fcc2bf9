use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Server-wide counters. Observational only; nothing gates on them.
#[derive(Debug, Default)]
pub struct ServerStats {
    logged_in: AtomicUsize,
    connections: AtomicUsize,
    requests: AtomicU64,
    logouts: AtomicU64,
    events_sent: AtomicU64,
    confirms_received: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub logged_in: usize,
    pub connections: usize,
    pub requests: u64,
    pub logouts: u64,
    pub events_sent: u64,
    pub confirms_received: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_logged_in(&self) {
        self.logged_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_logged_in(&self) {
        // Saturating: a gauge must never wrap below zero.
        let _ = self
            .logged_in
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn incr_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_logouts(&self) {
        self.logouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_events_sent(&self) {
        self.events_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_confirms_received(&self) {
        self.confirms_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            logged_in: self.logged_in.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            logouts: self.logouts.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            confirms_received: self.confirms_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_never_underflow() {
        let stats = ServerStats::new();
        stats.decr_logged_in();
        stats.connection_closed();
        assert_eq!(stats.snapshot().logged_in, 0);
        assert_eq!(stats.connections(), 0);

        stats.incr_logged_in();
        stats.incr_logged_in();
        stats.decr_logged_in();
        assert_eq!(stats.snapshot().logged_in, 1);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let stats = ServerStats::new();
        stats.incr_requests();
        stats.incr_events_sent();
        stats.incr_events_sent();
        stats.incr_confirms_received();
        stats.incr_logouts();

        let snap = stats.snapshot();
        assert_eq!(snap.requests, 1);
        assert_eq!(snap.events_sent, 2);
        assert_eq!(snap.confirms_received, 1);
        assert_eq!(snap.logouts, 1);
    }
}
