//! Server metrics for observability
//!
//! Runtime counters for monitoring sync-service health; snapshotted by
//! the `/metrics` and `/health` endpoints.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently active WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,
    /// Connections reclaimed by the inactivity sweep
    pub evicted_connections: AtomicU64,

    // Message metrics
    /// Frames received from clients
    pub messages_received: AtomicU64,
    /// Frames sent to clients
    pub messages_sent: AtomicU64,
    /// Fan-out messages dropped because a recipient was backpressured
    pub messages_dropped: AtomicU64,

    // Sync metrics
    pub syncs_started: AtomicU64,
    pub syncs_completed: AtomicU64,
    pub syncs_failed: AtomicU64,
    /// Requests rejected because a sync was already in progress
    pub syncs_rejected: AtomicU64,

    // Broadcast metrics
    pub broadcasts_delivered: AtomicU64,

    // Error metrics
    pub protocol_errors: AtomicU64,
    pub storage_errors: AtomicU64,
    pub websocket_errors: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self { start_time: Some(Instant::now()), ..Default::default() }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_evicted(&self) {
        self.evicted_connections.fetch_add(1, Ordering::Relaxed);
    }

    // Message tracking
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Sync tracking
    pub fn sync_started(&self) {
        self.syncs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sync_completed(&self) {
        self.syncs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sync_failed(&self) {
        self.syncs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sync_rejected(&self) {
        self.syncs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast_delivered(&self) {
        self.broadcasts_delivered.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn websocket_error(&self) {
        self.websocket_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                evicted: self.evicted_connections.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                sent: self.messages_sent.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
            },
            syncs: SyncMetrics {
                started: self.syncs_started.load(Ordering::Relaxed),
                completed: self.syncs_completed.load(Ordering::Relaxed),
                failed: self.syncs_failed.load(Ordering::Relaxed),
                rejected: self.syncs_rejected.load(Ordering::Relaxed),
            },
            broadcasts: BroadcastMetrics {
                delivered: self.broadcasts_delivered.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                protocol: self.protocol_errors.load(Ordering::Relaxed),
                storage: self.storage_errors.load(Ordering::Relaxed),
                websocket: self.websocket_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub syncs: SyncMetrics,
    pub broadcasts: BroadcastMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
    pub evicted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub sent: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMetrics {
    pub delivered: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub protocol: u64,
    pub storage: u64,
    pub websocket: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = ServerMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);

        metrics.connection_closed();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_sync_tracking() {
        let metrics = ServerMetrics::new();

        metrics.sync_started();
        metrics.sync_completed();
        metrics.sync_started();
        metrics.sync_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.syncs.started, 2);
        assert_eq!(snapshot.syncs.completed, 1);
        assert_eq!(snapshot.syncs.rejected, 1);
        assert_eq!(snapshot.syncs.failed, 0);
    }

    #[test]
    fn test_snapshot() {
        let metrics = ServerMetrics::new();
        metrics.connection_opened();
        metrics.message_sent();
        metrics.broadcast_delivered();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.active, 1);
        assert_eq!(snapshot.messages.sent, 1);
        assert_eq!(snapshot.broadcasts.delivered, 1);
    }
}
