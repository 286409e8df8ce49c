//! Shared inbound-message dispatcher.
//!
//! Every decoded frame lands here, so the transport handler stays thin
//! and the protocol behavior is unit-testable over plain channels.

use std::sync::Arc;

use tracing::{debug, warn};

use stockline_store::SyncStore;

use crate::config::SyncConfig;
use crate::metrics::ServerMetrics;

use super::broadcast;
use super::protocol::{self, Payload, SyncError};
use super::registry::{ConnectionHandle, ConnectionRegistry};
use super::sync;

/// Per-connection context shared between the transport layer and the
/// dispatcher.
pub(crate) struct ConnectionContext {
    pub handle: ConnectionHandle,
    pub registry: Arc<ConnectionRegistry>,
    pub store: Arc<dyn SyncStore>,
    pub metrics: Arc<ServerMetrics>,
    pub config: SyncConfig,
}

/// Handle one inbound text frame.
///
/// Protocol failures are answered with SYNC_ERROR and the connection
/// stays open; nothing in here can take down another connection's
/// handling.
pub(crate) async fn dispatch_client_message(ctx: &Arc<ConnectionContext>, text: &str) {
    ctx.handle.state.touch();
    ctx.metrics.message_received();

    let payload = match protocol::decode_frame(text).and_then(|frame| frame.typed_payload()) {
        Ok(payload) => payload,
        Err(err) => {
            ctx.metrics.protocol_error();
            warn!(connection_id = %ctx.handle.id, error = %err, "rejecting inbound frame");
            let _ = ctx
                .handle
                .send(Payload::SyncError(SyncError::new(err.error_code(), err.to_string())))
                .await;
            return;
        }
    };

    match payload {
        Payload::Capabilities(caps) => {
            debug!(
                connection_id = %ctx.handle.id,
                supports_compression = caps.supports_compression,
                is_electron_host = caps.is_electron_host,
                "capabilities declared"
            );
            ctx.handle.state.set_capabilities(caps.clone()).await;
            // Echo the applied state back as the acknowledgment.
            let _ = ctx.handle.send(Payload::Capabilities(caps)).await;
        }
        Payload::SyncRequest(req) => {
            // The sync slot is claimed before spawning so two rapid
            // requests cannot race past each other: the second is
            // rejected here, in arrival order.
            if !ctx.handle.state.begin_sync() {
                ctx.metrics.sync_rejected();
                warn!(connection_id = %ctx.handle.id, "sync already in progress, rejecting request");
                let _ = ctx
                    .handle
                    .send(Payload::SyncError(SyncError::new(
                        "sync_in_progress",
                        "a sync is already being served on this connection",
                    )))
                    .await;
                return;
            }
            let ctx = ctx.clone();
            tokio::spawn(async move {
                sync::stream_datasets(&ctx, req).await;
            });
        }
        Payload::DataChange(change) => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                broadcast::handle_data_change(&ctx, change).await;
            });
        }
        Payload::Heartbeat(_) => {
            // Client-initiated heartbeats count as activity only.
        }
        other => {
            ctx.metrics.protocol_error();
            let _ = ctx
                .handle
                .send(Payload::SyncError(SyncError::new(
                    "unexpected_kind",
                    format!("{:?} is not a client message", other.kind()),
                )))
                .await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ws::protocol::{Capabilities, MessageKind};
    use crate::ws::registry::Outbound;
    use std::sync::Arc;
    use stockline_store::MemoryStore;
    use tokio::sync::mpsc;

    /// Register one connection on a fresh registry and wrap it in a
    /// dispatch context. The CONNECTION_INFO greeting is drained so
    /// tests start from a quiet channel.
    pub(crate) async fn make_test_ctx(
        store: Arc<dyn SyncStore>,
    ) -> (Arc<ConnectionContext>, mpsc::Receiver<Outbound>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::channel(64);
        let handle = registry.register(tx).await;
        let greeting = rx.recv().await.expect("greeting");
        assert!(matches!(greeting.payload, Payload::ConnectionInfo(_)));

        let ctx = Arc::new(ConnectionContext {
            handle,
            registry,
            store,
            metrics: Arc::new(ServerMetrics::new()),
            config: SyncConfig {
                dataset_pacing: std::time::Duration::from_millis(0),
                ..SyncConfig::default()
            },
        });
        (ctx, rx)
    }

    async fn recv_payload(rx: &mut mpsc::Receiver<Outbound>) -> Payload {
        tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("channel open")
            .payload
    }

    #[tokio::test]
    async fn malformed_frame_answered_with_sync_error() {
        let (ctx, mut rx) = make_test_ctx(Arc::new(MemoryStore::new())).await;

        dispatch_client_message(&ctx, "{{{{").await;

        match recv_payload(&mut rx).await {
            Payload::SyncError(err) => assert_eq!(err.error, "malformed_frame"),
            other => panic!("expected SyncError, got {:?}", other.kind()),
        }
        // The connection is still registered and usable.
        assert!(ctx.registry.get(&ctx.handle.id).await.is_some());
    }

    #[tokio::test]
    async fn unknown_kind_answered_with_sync_error() {
        let (ctx, mut rx) = make_test_ctx(Arc::new(MemoryStore::new())).await;

        let frame = r#"{"kind":"REPLICATE","payload":{},"issuedAt":"2026-08-06T10:00:00Z"}"#;
        dispatch_client_message(&ctx, frame).await;

        match recv_payload(&mut rx).await {
            Payload::SyncError(err) => assert_eq!(err.error, "unknown_kind"),
            other => panic!("expected SyncError, got {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn server_only_kind_from_client_rejected() {
        let (ctx, mut rx) = make_test_ctx(Arc::new(MemoryStore::new())).await;

        let frame = r#"{"kind":"CONNECTION_INFO","payload":{"connectionId":"x","serverTime":"2026-08-06T10:00:00Z","features":[]},"issuedAt":"2026-08-06T10:00:00Z"}"#;
        dispatch_client_message(&ctx, frame).await;

        match recv_payload(&mut rx).await {
            Payload::SyncError(err) => assert_eq!(err.error, "unexpected_kind"),
            other => panic!("expected SyncError, got {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn capabilities_update_is_idempotent_and_acked() {
        let (ctx, mut rx) = make_test_ctx(Arc::new(MemoryStore::new())).await;

        let frame = r#"{"kind":"CAPABILITIES","payload":{"supportsCompression":true},"issuedAt":"2026-08-06T10:00:00Z"}"#;
        dispatch_client_message(&ctx, frame).await;
        dispatch_client_message(&ctx, frame).await;

        for _ in 0..2 {
            match recv_payload(&mut rx).await {
                Payload::Capabilities(caps) => assert!(caps.supports_compression),
                other => panic!("expected Capabilities ack, got {:?}", other.kind()),
            }
        }

        let caps = ctx.handle.state.capabilities().await;
        assert_eq!(caps, Capabilities { supports_compression: true, ..Default::default() });
        // No side effects beyond the acks.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn inbound_heartbeat_touches_activity_only() {
        let (ctx, mut rx) = make_test_ctx(Arc::new(MemoryStore::new())).await;

        let frame =
            r#"{"kind":"HEARTBEAT","payload":{"timestamp":"2026-08-06T10:00:00Z"},"issuedAt":"2026-08-06T10:00:00Z"}"#;
        dispatch_client_message(&ctx, frame).await;

        assert!(rx.try_recv().is_err());
        assert!(ctx.handle.state.idle_for().as_secs() < 5);
    }

    #[tokio::test]
    async fn sync_request_streams_and_completes() {
        let (ctx, mut rx) = make_test_ctx(Arc::new(MemoryStore::with_sample_data())).await;

        let frame = r#"{"kind":"SYNC_REQUEST","payload":{"datasets":["inventory"]},"issuedAt":"2026-08-06T10:00:00Z"}"#;
        dispatch_client_message(&ctx, frame).await;

        match recv_payload(&mut rx).await {
            Payload::SyncResponse(resp) => {
                assert_eq!(resp.dataset, "inventory");
                assert!(resp.complete);
            }
            other => panic!("expected SyncResponse, got {:?}", other.kind()),
        }
        match recv_payload(&mut rx).await {
            Payload::SyncComplete(done) => assert_eq!(done.datasets, vec!["inventory"]),
            other => panic!("expected SyncComplete, got {:?}", other.kind()),
        }
        assert!(!ctx.handle.state.sync_in_progress());
    }

    #[tokio::test]
    async fn overlapping_sync_request_rejected_in_arrival_order() {
        let (ctx, mut rx) = make_test_ctx(Arc::new(MemoryStore::with_sample_data())).await;
        // Hold the slot as if a sync stream were mid-flight.
        assert!(ctx.handle.state.begin_sync());

        let frame = r#"{"kind":"SYNC_REQUEST","payload":{},"issuedAt":"2026-08-06T10:00:00Z"}"#;
        dispatch_client_message(&ctx, frame).await;

        match recv_payload(&mut rx).await {
            Payload::SyncError(err) => assert_eq!(err.error, "sync_in_progress"),
            other => panic!("expected SyncError, got {:?}", other.kind()),
        }
        // The slot still belongs to the first sync.
        assert!(ctx.handle.state.sync_in_progress());
        assert_eq!(ctx.metrics.snapshot().syncs.rejected, 1);
    }

    #[tokio::test]
    async fn data_change_acked_to_origin() {
        let store = Arc::new(MemoryStore::with_sample_data());
        let (ctx, mut rx) = make_test_ctx(store.clone()).await;

        let frame = r#"{"kind":"DATA_CHANGE","payload":{"entity":"inventory","action":"update","id":"inv-1","data":{"quantity":3}},"issuedAt":"2026-08-06T10:00:00Z"}"#;
        dispatch_client_message(&ctx, frame).await;

        match recv_payload(&mut rx).await {
            Payload::DataChange(ack) => {
                assert_eq!(ack.success, Some(true));
                assert_eq!(ack.id, Some(serde_json::json!("inv-1")));
                assert_eq!(ack.entity, "inventory");
            }
            other => panic!("expected DataChange ack, got {:?}", other.kind()),
        }

        let rows = store.fetch_dataset("inventory").await.unwrap().unwrap();
        let row = rows.iter().find(|r| r["id"] == "inv-1").unwrap();
        assert_eq!(row["quantity"], 3);
    }

    #[test]
    fn kind_debug_names_are_stable() {
        // The unexpected_kind error message leans on Debug formatting.
        assert_eq!(format!("{:?}", MessageKind::ConnectionInfo), "ConnectionInfo");
    }
}
