//! Real-time sync core.
//!
//! One WebSocket endpoint keeps every running client instance consistent
//! with the shared dataset:
//! - a typed message protocol with per-recipient payload compression
//! - a registry of live connections and their negotiated capabilities
//! - full-dataset sync streamed from the storage collaborator
//! - data-change broadcast with origin exclusion
//! - heartbeats and stale-connection reclamation

mod broadcast;
mod compress;
mod dispatch;
mod handler;
mod liveness;
pub mod protocol;
mod registry;
mod sync;

pub use handler::sync_ws_handler;
pub use liveness::LivenessMonitor;
pub use registry::{ClientSummary, ConnectionRegistry};

use std::sync::Arc;

use serde_json::Value;

use stockline_store::{ChangeAction, SyncStore};

use crate::config::SyncConfig;
use crate::metrics::ServerMetrics;

use protocol::DataChange;

/// Handle to the sync core, shared by the transport layer and the rest
/// of the application.
pub struct SyncService {
    registry: Arc<ConnectionRegistry>,
    pub(crate) store: Arc<dyn SyncStore>,
    pub(crate) metrics: Arc<ServerMetrics>,
    pub(crate) config: SyncConfig,
}

impl SyncService {
    pub fn new(store: Arc<dyn SyncStore>, metrics: Arc<ServerMetrics>, config: SyncConfig) -> Self {
        Self { registry: Arc::new(ConnectionRegistry::new()), store, metrics, config }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Broadcast a mutation performed outside any connection (batch
    /// jobs, other services). The caller already wrote storage, so
    /// nothing is applied here, and with no origin to exclude every
    /// connection receives the event.
    pub async fn notify_data_change(&self, entity: &str, action: ChangeAction, data: Value) {
        let event = DataChange {
            entity: entity.to_string(),
            action,
            data: Some(data),
            id: None,
            success: None,
        };
        broadcast::broadcast_data_change(&self.registry, &self.metrics, event, None).await;
    }

    /// Number of currently connected sync clients.
    pub async fn client_count(&self) -> usize {
        self.registry.len().await
    }

    /// Redacted per-client summaries for operational visibility.
    pub async fn client_summaries(&self) -> Vec<ClientSummary> {
        self.registry.summaries().await
    }
}
