//! WebSocket Handler
//!
//! Transport glue between axum's `/sync` upgrade and the sync core:
//! one reader loop and one writer task per connection, joined with
//! `tokio::select!`. The writer owns the sequence counter and the
//! per-recipient compression decision; the reader feeds the shared
//! dispatcher.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::metrics::ServerMetrics;
use crate::server::AppState;

use super::dispatch::{ConnectionContext, dispatch_client_message};
use super::protocol::{self, Payload, SyncError};
use super::registry::{ConnectionState, Outbound};

/// WebSocket close code for "going away" — used on liveness eviction.
const CLOSE_GOING_AWAY: u16 = 1001;

pub async fn sync_ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_sync_socket(state, socket))
}

pub(crate) async fn handle_sync_socket(state: AppState, socket: WebSocket) {
    let service = state.sync.clone();
    service.metrics.connection_opened();

    let (ws_sender, ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Outbound>(service.config.outbound_buffer);
    let handle = service.registry().register(tx).await;
    let connection_id = handle.id.clone();
    info!(connection_id = %connection_id, "sync client connected");

    let ctx = Arc::new(ConnectionContext {
        handle: handle.clone(),
        registry: service.registry().clone(),
        store: service.store.clone(),
        metrics: service.metrics.clone(),
        config: service.config.clone(),
    });

    let writer = run_connection_writer(
        ws_sender,
        rx,
        handle.state.clone(),
        service.config.compression_threshold,
        service.metrics.clone(),
    );
    let reader = run_connection_reader(ws_receiver, ctx);

    tokio::select! {
        _ = writer => debug!(connection_id = %connection_id, "writer task ended"),
        _ = reader => debug!(connection_id = %connection_id, "reader task ended"),
    }

    service.registry().remove(&connection_id).await;
    service.metrics.connection_closed();
    info!(connection_id = %connection_id, "sync client disconnected");
}

/// Drain the outbound queue onto the socket.
///
/// The sequence counter lives here and nowhere else: one writer per
/// connection makes the 0,1,2,… contract hold by construction.
async fn run_connection_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    state: Arc<ConnectionState>,
    compression_threshold: usize,
    metrics: Arc<ServerMetrics>,
) {
    let cancel = state.cancel_token();
    let mut next_seq: u64 = 0;

    loop {
        let outbound = tokio::select! {
            _ = cancel.cancelled() => {
                // Liveness eviction: close with the documented reason.
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_GOING_AWAY,
                        reason: "inactivity timeout".into(),
                    })))
                    .await;
                break;
            }
            maybe = rx.recv() => match maybe {
                Some(outbound) => outbound,
                None => break,
            },
        };

        let caps = state.capabilities().await;
        let frame = match protocol::encode_server_frame(
            &outbound.payload,
            next_seq,
            outbound.origin.as_deref(),
            &caps,
            compression_threshold,
        ) {
            Ok(text) => text,
            Err(err) => {
                // Nothing went out, so the counter does not advance and
                // the sequence stays gap-free.
                error!(error = %err, "failed to encode outbound frame, skipping");
                continue;
            }
        };

        if sink.send(Message::Text(frame.into())).await.is_err() {
            // Transport gone; the reader side observes the close too.
            break;
        }
        next_seq += 1;
        metrics.message_sent();

        if matches!(outbound.payload, Payload::Heartbeat(_)) {
            // A delivered heartbeat counts as activity on this connection.
            state.touch();
        }
    }
}

/// Pump inbound frames into the dispatcher until close or error.
///
/// Forced eviction is the writer's job: it owns the socket sink and
/// must get the close frame out. Once the writer exits, the handler's
/// select tears this loop down with it.
async fn run_connection_reader(mut stream: SplitStream<WebSocket>, ctx: Arc<ConnectionContext>) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => dispatch_client_message(&ctx, &text).await,
            Ok(Message::Binary(_)) => {
                ctx.metrics.protocol_error();
                let err = protocol::ProtocolError::BinaryFrame;
                let _ = ctx
                    .handle
                    .send(Payload::SyncError(SyncError::new(err.error_code(), err.to_string())))
                    .await;
            }
            Ok(Message::Close(_)) => {
                debug!(connection_id = %ctx.handle.id, "client closed connection");
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => ctx.handle.state.touch(),
            Err(err) => {
                debug!(connection_id = %ctx.handle.id, error = %err, "websocket error");
                ctx.metrics.websocket_error();
                break;
            }
        }
    }
}
