//! Connection Registry
//!
//! The single authoritative map from connection id to live connection
//! state. Every other component — dispatcher, orchestrator, broadcast
//! router, liveness monitor — reaches connections only through here;
//! there is no ambient global client map.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::protocol::{Capabilities, ConnectionInfo, Payload, SERVER_FEATURES};

/// One message queued for a connection's writer task.
#[derive(Debug)]
pub struct Outbound {
    pub payload: Payload,
    /// Connection that caused this message, for broadcast stamping.
    pub origin: Option<String>,
}

impl Outbound {
    pub fn new(payload: Payload) -> Self {
        Self { payload, origin: None }
    }

    pub fn with_origin(payload: Payload, origin: &str) -> Self {
        Self { payload, origin: Some(origin.to_string()) }
    }
}

/// Mutable per-connection state shared by the reader, writer,
/// dispatcher, and liveness monitor.
#[derive(Debug)]
pub struct ConnectionState {
    capabilities: RwLock<Capabilities>,
    /// Unix millis of the last inbound frame or heartbeat send.
    last_activity_ms: AtomicI64,
    /// Serializes SYNC_REQUEST handling only; broadcasts and heartbeats
    /// still flow while a sync is streaming.
    sync_in_progress: AtomicBool,
    /// Cancelled to force-close the connection (liveness eviction).
    cancel: CancellationToken,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            capabilities: RwLock::new(Capabilities::default()),
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            sync_in_progress: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.last_activity_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let idle_ms = Utc::now().timestamp_millis() - self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(idle_ms.max(0) as u64)
    }

    pub async fn capabilities(&self) -> Capabilities {
        self.capabilities.read().await.clone()
    }

    pub async fn set_capabilities(&self, caps: Capabilities) {
        *self.capabilities.write().await = caps;
    }

    /// Claim the sync slot. Returns false if a sync is already running
    /// on this connection.
    pub fn begin_sync(&self) -> bool {
        self.sync_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_sync(&self) {
        self.sync_in_progress.store(false, Ordering::Release);
    }

    pub fn sync_in_progress(&self) -> bool {
        self.sync_in_progress.load(Ordering::Acquire)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Force-close this connection; the transport tasks observe the
    /// token and tear the socket down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity_ms(&self, ms: i64) {
        self.last_activity_ms.store(ms, Ordering::Relaxed);
    }
}

/// Enough to reach a connection without holding the registry lock.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: String,
    pub outbound: mpsc::Sender<Outbound>,
    pub state: Arc<ConnectionState>,
}

impl ConnectionHandle {
    /// Queue a message, waiting for writer capacity. An error means the
    /// connection is gone — callers abort their send loop, nothing else.
    pub async fn send(&self, payload: Payload) -> Result<(), mpsc::error::SendError<Outbound>> {
        self.outbound.send(Outbound::new(payload)).await
    }

    /// Queue without waiting; used by registry-wide fan-out so one
    /// backpressured connection cannot stall the rest.
    pub fn try_send(&self, outbound: Outbound) -> Result<(), mpsc::error::TrySendError<Outbound>> {
        self.outbound.try_send(outbound)
    }
}

/// Redacted per-connection view for operational introspection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub id: String,
    pub last_activity: DateTime<Utc>,
    pub capabilities: Capabilities,
    pub sync_in_progress: bool,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new connection: assign a fresh id (never reused), apply
    /// default capabilities, and queue the CONNECTION_INFO greeting.
    ///
    /// The greeting is queued before the handle is published, so it is
    /// always the first frame — sequence number 0 — on the wire.
    pub async fn register(&self, outbound: mpsc::Sender<Outbound>) -> ConnectionHandle {
        let id = Uuid::new_v4().to_string();
        let handle = ConnectionHandle {
            id: id.clone(),
            outbound,
            state: Arc::new(ConnectionState::new()),
        };

        let info = Payload::ConnectionInfo(ConnectionInfo {
            connection_id: id.clone(),
            server_time: Utc::now(),
            features: SERVER_FEATURES.iter().map(|f| f.to_string()).collect(),
        });
        let _ = handle.outbound.send(Outbound::new(info)).await;

        self.connections.write().await.insert(id, handle.clone());
        debug!(connection_id = %handle.id, "connection registered");
        handle
    }

    pub async fn get(&self, id: &str) -> Option<ConnectionHandle> {
        self.connections.read().await.get(id).cloned()
    }

    /// Deregister and release. Idempotent: removing an unknown id is a
    /// no-op, not an error.
    pub async fn remove(&self, id: &str) -> bool {
        match self.connections.write().await.remove(id) {
            Some(handle) => {
                handle.state.close();
                debug!(connection_id = %id, "connection removed");
                true
            }
            None => false,
        }
    }

    /// Snapshot of every live connection. Safe to iterate while other
    /// tasks register or remove; a connection closing mid-iteration
    /// surfaces as a failed send, never an invalidated iterator.
    pub async fn all(&self) -> Vec<ConnectionHandle> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn summaries(&self) -> Vec<ClientSummary> {
        let mut summaries = Vec::new();
        for handle in self.all().await {
            summaries.push(ClientSummary {
                id: handle.id.clone(),
                last_activity: handle.state.last_activity(),
                capabilities: handle.state.capabilities().await,
                sync_in_progress: handle.state.sync_in_progress(),
            });
        }
        summaries
    }
}
