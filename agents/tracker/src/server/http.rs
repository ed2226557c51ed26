use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crossflow_core::{
    ChainKey, ChainProgress, ChainStatus, ChainType, Flow, FlowParams, FlowType, NewFlow,
    NewStatusLog, Stage, StageSource, StatusEvents, StatusLogRow, StatusUpdate, StoreError,
};

use crate::queue::{JobRecord, PollJob};
use crate::server::AppState;

/// API error mapped onto status codes with field-level validation detail.
#[derive(Debug)]
pub enum ApiError {
    /// 400 with per-field messages.
    Validation(HashMap<String, String>),
    /// 404.
    NotFound(&'static str),
    /// 500.
    Internal(String),
}

impl ApiError {
    /// Single-field validation failure.
    pub fn field(field: &str, message: &str) -> Self {
        let mut fields = HashMap::new();
        fields.insert(field.to_owned(), message.to_owned());
        ApiError::Validation(fields)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound("flow not found"),
            StoreError::Backend(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(fields) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "validation", "fields": fields })),
            )
                .into_response(),
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": message })),
            )
                .into_response(),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "internal api error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal" })),
                )
                    .into_response()
            }
        }
    }
}

/// Body of `POST /api/track/flow`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackFlowRequest {
    /// Deposit or payment.
    pub flow_type: FlowType,
    /// Chain id the flow starts on.
    pub initial_chain: String,
    /// Chain id the flow ends on.
    pub destination_chain: String,
    /// Declared type of the initiating chain; validated against the registry.
    pub chain_type: Option<ChainType>,
    /// Initiating tx hash; registration is idempotent on it.
    pub tx_hash: Option<String>,
    /// Free-form matching parameters.
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    /// Pre-seeded chain progress.
    #[serde(default)]
    pub chain_progress: Option<ChainProgress>,
}

/// `POST /api/track/flow` — register a flow and enqueue its polling job.
/// Registration is idempotent on the initiating tx hash: re-registration
/// returns the existing flow and enqueues nothing.
pub async fn track_flow(
    State(state): State<AppState>,
    Json(body): Json<TrackFlowRequest>,
) -> Result<Json<Flow>, ApiError> {
    let Some(initial_conf) = state.registry.get(&body.initial_chain) else {
        return Err(ApiError::field("initialChain", "unknown chain"));
    };
    if !state.registry.contains(&body.destination_chain) {
        return Err(ApiError::field("destinationChain", "unknown chain"));
    }
    if let Some(declared) = body.chain_type {
        if declared != initial_conf.chain_type {
            return Err(ApiError::field(
                "chainType",
                "does not match the registered chain",
            ));
        }
    }
    if let Some(hash) = &body.tx_hash {
        if hash.is_empty() {
            return Err(ApiError::field("txHash", "must not be empty"));
        }
    }

    let outcome = state
        .store
        .create_flow(NewFlow {
            flow_type: body.flow_type,
            initial_chain: body.initial_chain,
            destination_chain: body.destination_chain,
            tx_hash: body.tx_hash,
            metadata: body.metadata.unwrap_or_default(),
            chain_progress: body.chain_progress,
        })
        .await?;

    let created = outcome.is_created();
    let flow = outcome.into_flow();
    if created {
        state.metrics.flows_created.inc();
        state.queue.enqueue(PollJob {
            id: format!("flow-{}-{}", flow.id, Utc::now().timestamp_millis()),
            flow_id: flow.id,
            flow_type: flow.flow_type,
            params: FlowParams::derive(&flow),
            attempts: 0,
            not_before: Instant::now(),
        });
        info!(flow_id = %flow.id, flow_type = flow.flow_type.as_str(), "flow registered");
    } else {
        debug!(flow_id = %flow.id, "idempotent re-registration");
    }
    Ok(Json(flow))
}

/// `GET /api/flow/:id` — the full flow record.
pub async fn get_flow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Flow>, ApiError> {
    let flow = state
        .store
        .flow(id)
        .await?
        .ok_or(ApiError::NotFound("flow not found"))?;
    Ok(Json(flow))
}

/// Reduced status view of a flow.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStatusResponse {
    /// Flow id.
    pub id: Uuid,
    /// Overall status.
    pub status: crossflow_core::FlowStatus,
    /// Per-chain progress.
    pub chain_progress: ChainProgress,
}

/// `GET /api/flow/:id/status`.
pub async fn get_flow_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<FlowStatusResponse>, ApiError> {
    let flow = state
        .store
        .flow(id)
        .await?
        .ok_or(ApiError::NotFound("flow not found"))?;
    Ok(Json(FlowStatusResponse {
        id: flow.id,
        status: flow.status,
        chain_progress: flow.chain_progress,
    }))
}

/// `GET /api/flow/:id/logs` — status log rows, ascending.
pub async fn get_flow_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<StatusLogRow>>, ApiError> {
    if state.store.flow(id).await?.is_none() {
        return Err(ApiError::NotFound("flow not found"));
    }
    Ok(Json(state.store.status_logs(id).await?))
}

/// `GET /api/flow/:id/job` — worker job states for the flow.
pub async fn get_flow_jobs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<JobRecord>>, ApiError> {
    if state.store.flow(id).await?.is_none() {
        return Err(ApiError::NotFound("flow not found"));
    }
    Ok(Json(state.queue.jobs_for_flow(id)))
}

/// Body of `POST /api/flow/:id/stage`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStageRequest {
    /// Chain key the stage belongs to.
    pub chain: String,
    /// Stage symbol.
    pub stage: String,
    /// Stage status; defaults to confirmed.
    pub status: Option<ChainStatus>,
    /// Optional message.
    pub message: Option<String>,
    /// Optional tx hash.
    pub tx_hash: Option<String>,
    /// When the stage occurred; defaults to now.
    pub occurred_at: Option<DateTime<Utc>>,
    /// Free-form extra data.
    pub metadata: Option<Map<String, Value>>,
    /// `gasless` routes the stage to the auxiliary list.
    pub kind: Option<String>,
    /// Reported source; defaults to client.
    pub source: Option<StageSource>,
}

/// `POST /api/flow/:id/stage` — append a client-sourced stage entry.
pub async fn post_client_stage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ClientStageRequest>,
) -> Result<StatusCode, ApiError> {
    let chain: ChainKey = body
        .chain
        .parse()
        .map_err(|_| ApiError::field("chain", "must be one of evm, noble, namada"))?;
    if body.stage.is_empty() {
        return Err(ApiError::field("stage", "must not be empty"));
    }

    let stage = Stage {
        stage: body.stage,
        status: body.status.unwrap_or(ChainStatus::Confirmed),
        message: body.message,
        tx_hash: body.tx_hash,
        occurred_at: body.occurred_at.unwrap_or_else(Utc::now),
        source: body.source.unwrap_or(StageSource::Client),
        metadata: body.metadata,
    };
    let gasless = body.kind.as_deref() == Some("gasless");

    state
        .store
        .append_client_stage(id, chain, stage.clone(), gasless)
        .await?;
    state
        .store
        .append_status_log(NewStatusLog::for_stage(id, chain, &stage))
        .await?;
    state
        .bus
        .publish(StatusUpdate::from_stage(id, chain, &stage));

    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/flow/by-hash/:chain/:hash` — lookup by any chain-specific tx
/// hash, terminal flows included.
pub async fn flow_by_hash(
    State(state): State<AppState>,
    Path((chain, hash)): Path<(String, String)>,
) -> Result<Json<Flow>, ApiError> {
    let chain: ChainKey = chain
        .parse()
        .map_err(|_| ApiError::field("chain", "must be one of evm, noble, namada"))?;
    let flow = state
        .store
        .flow_by_any_hash(chain, &hash)
        .await?
        .ok_or(ApiError::NotFound("flow not found"))?;
    Ok(Json(flow))
}

/// `GET /health`.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics_text(State(state): State<AppState>) -> Response {
    match state.metrics.gather() {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use crossflow_base::{CoreMetrics, StatusEventBus};
    use crossflow_core::{ChainConf, ChainRegistry, ChainType, FlowStatus};
    use crossflow_test::MemoryFlowStore;

    use crate::queue::JobQueue;
    use crate::server::{router, AppState};

    use super::*;

    const TX_HASH: &str = "0xd8294b1c510caa839db96ca7a9992c3e53ed082b1e9467a8311a0747435d3759";

    fn chain_conf(chain_type: ChainType) -> ChainConf {
        ChainConf {
            chain_type,
            network: "testnet".into(),
            display_name: "test".into(),
            rpc_urls: vec!["http://localhost:26657".into()],
            explorer: None,
            contracts: None,
            gasless: None,
        }
    }

    fn setup_test_server() -> (SocketAddr, AppState) {
        let mut registry = ChainRegistry::default();
        registry
            .0
            .insert("sepolia".into(), chain_conf(ChainType::Evm));
        registry
            .0
            .insert("noble-testnet".into(), chain_conf(ChainType::Tendermint));
        registry
            .0
            .insert("namada-testnet".into(), chain_conf(ChainType::Tendermint));

        let state = AppState {
            store: Arc::new(MemoryFlowStore::new()),
            bus: Arc::new(StatusEventBus::new()),
            registry: Arc::new(registry),
            queue: JobQueue::new(),
            metrics: Arc::new(CoreMetrics::new().unwrap()),
        };

        let app = router(state.clone(), &[]);
        let server =
            axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);

        (addr, state)
    }

    fn deposit_body() -> Value {
        json!({
            "flowType": "deposit",
            "initialChain": "sepolia",
            "destinationChain": "namada-testnet",
            "txHash": TX_HASH,
            "metadata": {
                "forwardingAddress": "noble1cugfxuln9k2zsvey7yuaeckr7avfzffd7d44jp",
                "namadaReceiver": "tnam1qprxs9n5afscskramwajyrdjw5a64lwweudc0l78",
                "expectedAmountUusdc": "100000uusdc",
            },
        })
    }

    #[tokio::test]
    async fn track_flow_is_idempotent_on_tx_hash() {
        let (addr, state) = setup_test_server();
        let client = reqwest::Client::new();
        let url = format!("http://{addr}/api/track/flow");

        let first: Value = client
            .post(&url)
            .json(&deposit_body())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let second: Value = client
            .post(&url)
            .json(&deposit_body())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(first["id"], second["id"]);

        // Exactly one worker job was enqueued for the flow.
        let flow_id: Uuid = first["id"].as_str().unwrap().parse().unwrap();
        assert_eq!(state.queue.jobs_for_flow(flow_id).len(), 1);
    }

    #[tokio::test]
    async fn unknown_chain_is_a_field_level_400() {
        let (addr, _state) = setup_test_server();
        let mut body = deposit_body();
        body["initialChain"] = json!("made-up-chain");

        let response = reqwest::Client::new()
            .post(format!("http://{addr}/api/track/flow"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        let detail: Value = response.json().await.unwrap();
        assert_eq!(detail["error"], "validation");
        assert!(detail["fields"]["initialChain"].is_string());
    }

    #[tokio::test]
    async fn unknown_flow_is_404() {
        let (addr, _state) = setup_test_server();
        let response = reqwest::get(format!("http://{addr}/api/flow/{}", Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn client_stage_routes_gasless_to_auxiliary_list() {
        let (addr, state) = setup_test_server();
        let client = reqwest::Client::new();
        let created: Value = client
            .post(format!("http://{addr}/api/track/flow"))
            .json(&deposit_body())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let flow_id: Uuid = created["id"].as_str().unwrap().parse().unwrap();

        let response = client
            .post(format!("http://{addr}/api/flow/{flow_id}/stage"))
            .json(&json!({
                "chain": "evm",
                "stage": "gasless_approval_submitted",
                "kind": "gasless",
                "txHash": "0xfeed",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

        let flow = state.store.flow(flow_id).await.unwrap().unwrap();
        let evm = flow.chain_progress.get(ChainKey::Evm).unwrap();
        assert_eq!(evm.gasless_stages.len(), 1);
        assert_eq!(evm.gasless_stages[0].stage, "gasless_approval_submitted");
        assert_eq!(evm.gasless_stages[0].source, StageSource::Client);
        assert!(evm.stages.is_empty());

        // The client stage also landed in the status log.
        let logs = state.store.status_logs(flow_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].stage, "gasless_approval_submitted");
    }

    #[tokio::test]
    async fn by_hash_lookup_includes_terminal_flows() {
        let (addr, state) = setup_test_server();
        let client = reqwest::Client::new();
        let created: Value = client
            .post(format!("http://{addr}/api/track/flow"))
            .json(&deposit_body())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let flow_id: Uuid = created["id"].as_str().unwrap().parse().unwrap();

        state
            .store
            .set_status_if_pending(flow_id, FlowStatus::Completed, None)
            .await
            .unwrap();

        let found: Value = client
            .get(format!("http://{addr}/api/flow/by-hash/evm/{TX_HASH}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(found["id"].as_str().unwrap(), flow_id.to_string());
        assert_eq!(found["status"], "completed");
    }

    #[tokio::test]
    async fn status_view_is_reduced() {
        let (addr, _state) = setup_test_server();
        let client = reqwest::Client::new();
        let created: Value = client
            .post(format!("http://{addr}/api/track/flow"))
            .json(&deposit_body())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let flow_id = created["id"].as_str().unwrap();

        let status: Value = client
            .get(format!("http://{addr}/api/flow/{flow_id}/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["id"].as_str().unwrap(), flow_id);
        assert_eq!(status["status"], "pending");
        assert!(status["chainProgress"]["noble"].is_object());
        assert!(status.get("metadata").is_none());
    }

    #[tokio::test]
    async fn health_endpoint_answers() {
        let (addr, _state) = setup_test_server();
        let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }
}
