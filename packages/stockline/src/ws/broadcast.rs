//! Broadcast Router
//!
//! Propagates a data-change event to every connection except its
//! origin. The mutation itself runs exactly once against the storage
//! collaborator before anyone hears about it; fan-out only ever
//! delivers messages.

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::metrics::ServerMetrics;

use super::dispatch::ConnectionContext;
use super::protocol::{DataChange, Payload, SyncError};
use super::registry::{ConnectionRegistry, Outbound};

/// Handle an inbound DATA_CHANGE from a connection: apply the mutation
/// once, acknowledge the origin, fan the event out to everyone else.
pub(crate) async fn handle_data_change(ctx: &ConnectionContext, change: DataChange) {
    let applied = match ctx
        .store
        .apply_change(&change.entity, change.action, change.id.as_ref(), change.data.as_ref())
        .await
    {
        Ok(applied) => applied,
        Err(err) => {
            ctx.metrics.storage_error();
            warn!(
                connection_id = %ctx.handle.id,
                entity = %change.entity,
                action = change.action.as_str(),
                error = %err,
                "data change rejected by store"
            );
            let _ = ctx
                .handle
                .send(Payload::SyncError(SyncError::new(err.error_code(), err.to_string())))
                .await;
            return;
        }
    };

    // The origin is excluded from the broadcast below; this ack is how
    // it learns its write succeeded.
    let ack = Payload::DataChange(DataChange {
        entity: change.entity.clone(),
        action: change.action,
        data: None,
        id: applied.id.clone(),
        success: Some(true),
    });
    let _ = ctx.handle.send(ack).await;

    let event = DataChange {
        entity: change.entity,
        action: change.action,
        // Broadcast what the store actually persisted, falling back to
        // the request data for stores that echo nothing.
        data: applied.data.or(change.data),
        id: applied.id,
        success: None,
    };
    broadcast_data_change(&ctx.registry, &ctx.metrics, event, Some(&ctx.handle.id)).await;
}

/// Fan a DATA_CHANGE out to every open connection except `origin`.
///
/// Each recipient is attempted independently: a closed connection is
/// skipped, a backpressured one drops this event rather than stalling
/// the rest of the fleet.
pub(crate) async fn broadcast_data_change(
    registry: &ConnectionRegistry,
    metrics: &ServerMetrics,
    event: DataChange,
    origin: Option<&str>,
) {
    for conn in registry.all().await {
        if origin == Some(conn.id.as_str()) {
            continue;
        }
        let outbound = match origin {
            Some(origin) => Outbound::with_origin(Payload::DataChange(event.clone()), origin),
            None => Outbound::new(Payload::DataChange(event.clone())),
        };
        match conn.try_send(outbound) {
            Ok(()) => metrics.broadcast_delivered(),
            Err(TrySendError::Full(_)) => {
                metrics.message_dropped();
                warn!(connection_id = %conn.id, "recipient backpressured, dropping broadcast");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %conn.id, "recipient closing, skipping broadcast");
            }
        }
    }
}
