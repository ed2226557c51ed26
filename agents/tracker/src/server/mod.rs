//! HTTP and WebSocket surface of the tracker.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use eyre::Result;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, info_span, instrument::Instrumented, Instrument};

use crossflow_base::{CoreMetrics, StatusEventBus};
use crossflow_core::{ChainRegistry, FlowStore};

use crate::queue::JobQueue;

pub use http::*;
pub use ws::ws_handler;

mod http;
mod ws;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    /// Flow store.
    pub store: Arc<dyn FlowStore>,
    /// Status fan-out for WebSocket subscribers.
    pub bus: Arc<StatusEventBus>,
    /// Chain registry for request validation.
    pub registry: Arc<ChainRegistry>,
    /// Job queue, for enqueueing and job-state lookups.
    pub queue: JobQueue,
    /// Prometheus instruments.
    pub metrics: Arc<CoreMetrics>,
}

/// Assemble the full router.
pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    let api = Router::new()
        .route("/track/flow", post(track_flow))
        .route("/flow/by-hash/:chain/:hash", get(flow_by_hash))
        .route("/flow/:id", get(get_flow))
        .route("/flow/:id/status", get(get_flow_status))
        .route("/flow/:id/logs", get(get_flow_logs))
        .route("/flow/:id/job", get(get_flow_jobs))
        .route("/flow/:id/stage", post(post_client_stage));

    Router::new()
        .nest("/api", api)
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/ws", get(ws_handler))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Bind and serve the API.
pub fn serve(
    state: AppState,
    host: String,
    port: u16,
    cors_origins: Vec<String>,
) -> Instrumented<JoinHandle<Result<()>>> {
    let span = info_span!("api_server", port);
    tokio::spawn(async move {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| eyre::eyre!("invalid listen address: {e}"))?;
        info!(%addr, "starting api server");
        let app = router(state, &cors_origins);
        axum::Server::bind(&addr)
            .serve(app.into_make_service())
            .await?;
        Ok(())
    })
    .instrument(span)
}
