//! Router assembly and server startup.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{error, info};
use uuid::Uuid;

use stockline_store::SyncStore;

use crate::config::{FileConfig, LivenessConfig, SyncConfig};
use crate::handlers;
use crate::metrics::ServerMetrics;
use crate::ws::{self, LivenessMonitor, SyncService};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<SyncService>,
    pub metrics: Arc<ServerMetrics>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/sync", get(ws::sync_ws_handler))
        .route("/sync/clients", get(handlers::clients_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// A running sync server: bound listener, shared state, and the owned
/// liveness timers.
pub struct SyncServer {
    pub addr: SocketAddr,
    pub state: AppState,
    liveness: LivenessMonitor,
    accept_task: JoinHandle<()>,
}

impl SyncServer {
    /// Bind `addr` (port 0 picks a free port) and start serving.
    pub async fn start(
        addr: SocketAddr,
        store: Arc<dyn SyncStore>,
        config: FileConfig,
    ) -> Result<Self> {
        let metrics = Arc::new(ServerMetrics::new());
        let service = Arc::new(SyncService::new(
            store,
            metrics.clone(),
            SyncConfig::from_file(&config.sync),
        ));
        let liveness = LivenessMonitor::spawn(
            service.registry().clone(),
            metrics.clone(),
            LivenessConfig::from_file(&config.liveness),
        );

        let state = AppState { sync: service, metrics };
        let router = build_router(state.clone());

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let addr = listener.local_addr().context("listener has no local address")?;
        info!("sync server listening on {addr}");

        let accept_task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                error!("server error: {err}");
            }
        });

        Ok(Self { addr, state, liveness, accept_task })
    }

    /// Run until the accept loop exits.
    pub async fn serve(self) -> Result<()> {
        let result = self.accept_task.await;
        self.liveness.shutdown().await;
        result.context("accept loop panicked")
    }

    /// Stop the liveness timers and the accept loop.
    pub async fn shutdown(self) {
        self.liveness.shutdown().await;
        self.accept_task.abort();
        let _ = self.accept_task.await;
    }
}
