use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;
use url::Url;

use crossflow_core::{
    with_retry, BlockResults, ChainResult, ChainRpcError, RetryPolicy, TendermintProvider,
    TxLookup, TxSearch,
};

/// Client for the Tendermint RPC-over-HTTP surface (`/status`,
/// `/block_results`, `/tx`, `/tx_search`).
///
/// Responses arrive in JSON-RPC envelopes even on GET; errors for
/// not-yet-available heights are translated to `None` rather than failures so
/// the scanning layer can wait for the tip instead of tripping its retry
/// budget.
#[derive(Debug)]
pub struct TendermintRpcClient {
    client: reqwest::Client,
    base: Url,
    policy: RetryPolicy,
}

#[derive(Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Deserialize)]
struct StatusResult {
    sync_info: SyncInfo,
}

#[derive(Deserialize)]
struct SyncInfo {
    latest_block_height: String,
}

impl TendermintRpcClient {
    /// Default per-request timeout.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Build a client for one endpoint.
    pub fn new(base: Url) -> ChainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ChainRpcError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base,
            policy: RetryPolicy::default(),
        })
    }

    /// Override the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn get<R: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ChainResult<R> {
        match self.get_raw(path, query).await? {
            RpcOutcome::Result(value) => {
                serde_json::from_value(value).map_err(ChainRpcError::invalid)
            }
            RpcOutcome::HeightUnavailable => Err(ChainRpcError::InvalidResponse(
                "unexpected height-unavailable answer".into(),
            )),
        }
    }

    async fn get_raw(&self, path: &str, query: &[(&str, String)]) -> ChainResult<RpcOutcome> {
        with_retry(self.policy, || self.get_once(path, query)).await
    }

    async fn get_once(&self, path: &str, query: &[(&str, String)]) -> ChainResult<RpcOutcome> {
        let mut url = self
            .base
            .join(path)
            .map_err(|e| ChainRpcError::InvalidResponse(e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        // Tendermint answers RPC-level errors (including queries beyond the
        // tip) with a 500 carrying a JSON envelope; parse before classifying.
        let envelope: RpcEnvelope = match response.json().await {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(ChainRpcError::HttpStatus(status.as_u16()))
            }
            Err(err) => return Err(classify_reqwest(err)),
        };

        if let Some(err) = envelope.error {
            if is_height_unavailable(&err) {
                return Ok(RpcOutcome::HeightUnavailable);
            }
            return Err(ChainRpcError::Rpc {
                code: err.code,
                message: format!("{}: {}", err.message, err.data.unwrap_or_default()),
            });
        }
        if !status.is_success() {
            return Err(ChainRpcError::HttpStatus(status.as_u16()));
        }
        envelope
            .result
            .map(RpcOutcome::Result)
            .ok_or_else(|| ChainRpcError::InvalidResponse("missing result".into()))
    }
}

enum RpcOutcome {
    Result(Value),
    HeightUnavailable,
}

fn is_height_unavailable(err: &RpcErrorBody) -> bool {
    let detail = err.data.as_deref().unwrap_or("");
    detail.contains("must be less than or equal to the current blockchain height")
        || err.message.contains("must be less than or equal")
}

fn classify_reqwest(err: reqwest::Error) -> ChainRpcError {
    if err.is_timeout() {
        ChainRpcError::Timeout
    } else if let Some(status) = err.status() {
        ChainRpcError::HttpStatus(status.as_u16())
    } else {
        ChainRpcError::Transport(err.to_string())
    }
}

#[async_trait]
impl TendermintProvider for TendermintRpcClient {
    #[instrument(level = "debug", skip(self), fields(url = %self.base))]
    async fn latest_block_height(&self) -> ChainResult<u64> {
        let status: StatusResult = self.get("status", &[]).await?;
        status
            .sync_info
            .latest_block_height
            .parse()
            .map_err(ChainRpcError::invalid)
    }

    #[instrument(level = "debug", skip(self))]
    async fn block_results(&self, height: u64) -> ChainResult<Option<BlockResults>> {
        let outcome = self
            .get_raw("block_results", &[("height", height.to_string())])
            .await?;
        match outcome {
            RpcOutcome::Result(value) => {
                let block = serde_json::from_value(value).map_err(ChainRpcError::invalid)?;
                Ok(Some(block))
            }
            RpcOutcome::HeightUnavailable => Ok(None),
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn transaction(&self, hash: &str) -> ChainResult<Option<TxLookup>> {
        let hex = hash.trim_start_matches("0x");
        let outcome = self
            .get_raw("tx", &[("hash", format!("0x{hex}")), ("prove", "false".into())])
            .await;
        match outcome {
            Ok(RpcOutcome::Result(value)) => {
                let tx = serde_json::from_value(value).map_err(ChainRpcError::invalid)?;
                Ok(Some(tx))
            }
            Ok(RpcOutcome::HeightUnavailable) => Ok(None),
            // Unknown txs come back as an RPC error, not an empty result.
            Err(ChainRpcError::Rpc { message, .. }) if message.contains("not found") => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[instrument(level = "debug", skip(self, query))]
    async fn search_transactions(
        &self,
        query: &str,
        page: u32,
        per_page: u8,
    ) -> ChainResult<TxSearch> {
        self.get(
            "tx_search",
            &[
                ("query", format!("\"{query}\"")),
                ("page", page.to_string()),
                ("per_page", per_page.to_string()),
                ("order_by", "\"asc\"".into()),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_unavailable_detection() {
        let err = RpcErrorBody {
            code: -32603,
            message: "Internal error".into(),
            data: Some(
                "height 42569570 must be less than or equal to the current blockchain height 42569565"
                    .into(),
            ),
        };
        assert!(is_height_unavailable(&err));

        let other = RpcErrorBody {
            code: -32603,
            message: "Internal error".into(),
            data: Some("tx (ABC) not found".into()),
        };
        assert!(!is_height_unavailable(&other));
    }
}
