//! Sync Orchestrator
//!
//! Serves one SYNC_REQUEST as an ordered stream: one SYNC_RESPONSE per
//! requested dataset, then a single SYNC_COMPLETE listing exactly what
//! was sent. Reads go straight to the storage collaborator — nothing is
//! cached here, so there is never a second copy to reconcile.

use chrono::Utc;
use tracing::{debug, warn};

use stockline_store::DATASETS;

use super::dispatch::ConnectionContext;
use super::protocol::{Payload, SyncComplete, SyncError, SyncRequest, SyncResponse};
use super::registry::ConnectionState;

/// Clears `sync_in_progress` on every exit path.
struct SyncGuard<'a>(&'a ConnectionState);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.end_sync();
    }
}

/// Stream the requested datasets to the connection.
///
/// The caller (dispatcher) has already claimed the sync slot; it is
/// released by the guard no matter how this returns.
pub(crate) async fn stream_datasets(ctx: &ConnectionContext, req: SyncRequest) {
    let _guard = SyncGuard(&ctx.handle.state);
    ctx.metrics.sync_started();

    let requested: Vec<String> = match req.datasets {
        Some(names) if !names.is_empty() => names,
        _ => DATASETS.iter().map(|d| d.to_string()).collect(),
    };

    // One timestamp for the whole operation: every response and the
    // completion frame describe the same snapshot instant.
    let snapshot_at = Utc::now();
    let mut sent = Vec::with_capacity(requested.len());

    for (i, name) in requested.iter().enumerate() {
        if i > 0 {
            // Pacing between datasets so a slow client is not saturated.
            tokio::time::sleep(ctx.config.dataset_pacing).await;
        }

        match ctx.store.fetch_dataset(name).await {
            Ok(Some(rows)) => {
                let count = rows.len();
                let response = Payload::SyncResponse(SyncResponse {
                    dataset: name.clone(),
                    data: rows,
                    snapshot_at,
                    count,
                    complete: true,
                });
                if ctx.handle.send(response).await.is_err() {
                    // Connection closed under us — stop computing work
                    // for a dead recipient.
                    debug!(connection_id = %ctx.handle.id, dataset = %name, "connection closed mid-sync, aborting");
                    ctx.metrics.sync_failed();
                    return;
                }
                sent.push(name.clone());
            }
            Ok(None) => {
                warn!(connection_id = %ctx.handle.id, dataset = %name, "unknown dataset requested, skipping");
            }
            Err(err) => {
                warn!(connection_id = %ctx.handle.id, dataset = %name, error = %err, "storage failure mid-sync");
                ctx.metrics.sync_failed();
                let _ = ctx
                    .handle
                    .send(Payload::SyncError(SyncError::new(err.error_code(), err.to_string())))
                    .await;
                return;
            }
        }
    }

    let complete = Payload::SyncComplete(SyncComplete { snapshot_at, datasets: sent });
    if ctx.handle.send(complete).await.is_ok() {
        ctx.metrics.sync_completed();
    } else {
        ctx.metrics.sync_failed();
    }
}
