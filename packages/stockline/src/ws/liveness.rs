//! Liveness Monitor
//!
//! Two background activities with no synchronous caller: per-connection
//! heartbeat emission and a periodic sweep that reclaims connections
//! with no recent activity. Both are owned, cancellable tasks tied to
//! the service lifecycle — started with it, stopped by `shutdown()` —
//! and their bodies are plain functions so tests drive them without
//! wall-clock timers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LivenessConfig;
use crate::metrics::ServerMetrics;

use super::protocol::{Heartbeat, Payload};
use super::registry::{ConnectionRegistry, Outbound};

pub struct LivenessMonitor {
    cancel: CancellationToken,
    heartbeat: JoinHandle<()>,
    sweep: JoinHandle<()>,
}

impl LivenessMonitor {
    /// Start both timers against the registry.
    pub fn spawn(
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<ServerMetrics>,
        config: LivenessConfig,
    ) -> Self {
        let cancel = CancellationToken::new();

        let heartbeat = {
            let registry = registry.clone();
            let cancel = cancel.clone();
            let period = config.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                // The immediate first tick would heartbeat connections
                // that just said hello; skip it.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => emit_heartbeats(&registry).await,
                    }
                }
                debug!("heartbeat task stopped");
            })
        };

        let sweep = {
            let cancel = cancel.clone();
            let period = config.sweep_interval;
            let idle_timeout = config.idle_timeout;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            sweep_idle_connections(&registry, &metrics, idle_timeout).await;
                        }
                    }
                }
                debug!("inactivity sweep stopped");
            })
        };

        Self { cancel, heartbeat, sweep }
    }

    /// Stop both timers and wait for them to wind down.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.heartbeat.await;
        let _ = self.sweep.await;
    }
}

/// Queue a HEARTBEAT for every open connection.
///
/// `try_send`, never `send`: a backpressured client misses a beat
/// instead of stalling the loop, and a closed one is already mid
/// teardown — normal close handling cleans it up, there is no separate
/// heartbeat error path. The connection's activity clock is touched by
/// the writer when the beat actually reaches the socket.
pub(crate) async fn emit_heartbeats(registry: &ConnectionRegistry) {
    for conn in registry.all().await {
        let beat = Payload::Heartbeat(Heartbeat { timestamp: Utc::now() });
        if conn.try_send(Outbound::new(beat)).is_err() {
            debug!(connection_id = %conn.id, "heartbeat not queued (connection closing or backpressured)");
        }
    }
}

/// Force-close and deregister every connection idle past `idle_timeout`.
/// Returns how many were evicted.
pub(crate) async fn sweep_idle_connections(
    registry: &ConnectionRegistry,
    metrics: &ServerMetrics,
    idle_timeout: Duration,
) -> usize {
    let mut evicted = 0;
    for conn in registry.all().await {
        let idle = conn.state.idle_for();
        if idle > idle_timeout {
            warn!(
                connection_id = %conn.id,
                idle_secs = idle.as_secs(),
                "closing connection: inactivity timeout"
            );
            conn.state.close();
            registry.remove(&conn.id).await;
            metrics.connection_evicted();
            evicted += 1;
        }
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn quiet_connection(
        registry: &ConnectionRegistry,
    ) -> (super::super::registry::ConnectionHandle, mpsc::Receiver<Outbound>) {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = registry.register(tx).await;
        let _greeting = rx.recv().await.expect("greeting");
        (handle, rx)
    }

    #[tokio::test]
    async fn heartbeats_reach_every_connection() {
        let registry = ConnectionRegistry::new();
        let (_a, mut rx_a) = quiet_connection(&registry).await;
        let (_b, mut rx_b) = quiet_connection(&registry).await;

        emit_heartbeats(&registry).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let msg = rx.recv().await.unwrap();
            assert!(matches!(msg.payload, Payload::Heartbeat(_)));
        }
    }

    #[tokio::test]
    async fn heartbeat_skips_closed_connection_without_failing() {
        let registry = ConnectionRegistry::new();
        let (_gone, rx_gone) = quiet_connection(&registry).await;
        let (_alive, mut rx_alive) = quiet_connection(&registry).await;
        drop(rx_gone);

        emit_heartbeats(&registry).await;

        assert!(matches!(rx_alive.recv().await.unwrap().payload, Payload::Heartbeat(_)));
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_connections() {
        let registry = ConnectionRegistry::new();
        let metrics = ServerMetrics::new();
        let (idle, _rx_idle) = quiet_connection(&registry).await;
        let (fresh, _rx_fresh) = quiet_connection(&registry).await;

        let eleven_minutes_ago = Utc::now().timestamp_millis() - 11 * 60 * 1000;
        idle.state.set_last_activity_ms(eleven_minutes_ago);

        let evicted =
            sweep_idle_connections(&registry, &metrics, Duration::from_secs(600)).await;

        assert_eq!(evicted, 1);
        assert!(registry.get(&idle.id).await.is_none());
        assert!(idle.state.cancel_token().is_cancelled());
        assert!(registry.get(&fresh.id).await.is_some());
        assert_eq!(metrics.snapshot().connections.evicted, 1);
    }

    #[tokio::test]
    async fn sends_after_eviction_are_noops() {
        let registry = ConnectionRegistry::new();
        let metrics = ServerMetrics::new();
        let (idle, rx) = quiet_connection(&registry).await;
        idle.state.set_last_activity_ms(0);
        drop(rx);

        sweep_idle_connections(&registry, &metrics, Duration::from_secs(600)).await;

        // The connection no longer appears in registry snapshots, so
        // fan-out never sees it; direct sends just report closure.
        assert!(registry.all().await.is_empty());
        assert!(idle.send(Payload::Heartbeat(Heartbeat { timestamp: Utc::now() })).await.is_err());
    }

    #[tokio::test]
    async fn monitor_spawn_and_shutdown() {
        let registry = Arc::new(ConnectionRegistry::new());
        let metrics = Arc::new(ServerMetrics::new());
        let (_conn, mut rx) = quiet_connection(&registry).await;

        let monitor = LivenessMonitor::spawn(
            registry.clone(),
            metrics,
            LivenessConfig {
                heartbeat_interval: Duration::from_millis(10),
                sweep_interval: Duration::from_millis(10),
                idle_timeout: Duration::from_secs(600),
            },
        );

        let beat = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("heartbeat within interval")
            .unwrap();
        assert!(matches!(beat.payload, Payload::Heartbeat(_)));

        // Shutdown resolves promptly once the token is cancelled.
        tokio::time::timeout(Duration::from_secs(2), monitor.shutdown())
            .await
            .expect("shutdown completes");
    }
}
