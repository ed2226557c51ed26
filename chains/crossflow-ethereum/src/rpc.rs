use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ethers_core::types::{Bytes, H160, H256, U64};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::instrument;
use url::Url;

use crossflow_core::{
    with_retry, ChainResult, ChainRpcError, EvmLog, EvmProvider, EvmReceipt, EvmTransaction,
    LogQuery, RetryPolicy,
};

/// JSON-RPC client for an EVM endpoint with timeout and backoff built in.
///
/// Transient faults (transport errors, 429/5xx) are retried per the policy;
/// permanent faults (400/403/404, malformed payloads) fail immediately.
#[derive(Debug)]
pub struct EvmRpcClient {
    client: reqwest::Client,
    url: Url,
    policy: RetryPolicy,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcErrorBody>,
}

#[derive(Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

impl EvmRpcClient {
    /// Default per-request timeout.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Build a client for one endpoint.
    pub fn new(url: Url) -> ChainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Self::REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ChainRpcError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url,
            policy: RetryPolicy::default(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Override the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn request<R: DeserializeOwned>(&self, method: &str, params: Value) -> ChainResult<R> {
        with_retry(self.policy, || self.request_once(method, params.clone())).await
    }

    async fn request_once<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> ChainResult<R> {
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChainRpcError::HttpStatus(status.as_u16()));
        }

        let envelope: JsonRpcResponse = response.json().await.map_err(classify_reqwest)?;
        if let Some(err) = envelope.error {
            return Err(ChainRpcError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        let result = envelope
            .result
            .ok_or_else(|| ChainRpcError::InvalidResponse("missing result".into()))?;
        serde_json::from_value(result).map_err(ChainRpcError::invalid)
    }
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

/// Raw `eth_getLogs` entry; pending logs carry null block fields.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: H160,
    topics: Vec<H256>,
    data: Bytes,
    block_number: Option<U64>,
    transaction_hash: Option<H256>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    hash: H256,
    block_number: Option<U64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: H256,
    block_number: Option<U64>,
    status: Option<U64>,
}

fn hex_quantity(value: u64) -> String {
    format!("{value:#x}")
}

fn filter_json(query: &LogQuery) -> Value {
    let topics: Vec<Value> = query
        .topics
        .iter()
        .map(|topic| match topic {
            Some(t) => json!(format!("{t:?}")),
            None => Value::Null,
        })
        .collect();
    json!({
        "fromBlock": hex_quantity(query.from_block),
        "toBlock": hex_quantity(query.to_block),
        "address": format!("{:?}", query.address),
        "topics": topics,
    })
}

#[async_trait]
impl EvmProvider for EvmRpcClient {
    #[instrument(level = "debug", skip(self), fields(url = %self.url))]
    async fn block_number(&self) -> ChainResult<u64> {
        let raw: String = self.request("eth_blockNumber", json!([])).await?;
        u64::from_str_radix(raw.trim_start_matches("0x"), 16).map_err(ChainRpcError::invalid)
    }

    #[instrument(level = "debug", skip(self, query), fields(from = query.from_block, to = query.to_block))]
    async fn logs(&self, query: &LogQuery) -> ChainResult<Vec<EvmLog>> {
        let raw: Vec<RawLog> = self.request("eth_getLogs", json!([filter_json(query)])).await?;
        Ok(raw
            .into_iter()
            .filter_map(|log| {
                // Pending logs have no block yet and cannot be matched.
                let block_number = log.block_number?.as_u64();
                let transaction_hash = log.transaction_hash?;
                Some(EvmLog {
                    address: log.address,
                    topics: log.topics,
                    data: log.data.to_vec(),
                    block_number,
                    transaction_hash,
                })
            })
            .collect())
    }

    #[instrument(level = "debug", skip(self))]
    async fn transaction(&self, hash: H256) -> ChainResult<Option<EvmTransaction>> {
        let raw: Option<RawTransaction> = self
            .request("eth_getTransactionByHash", json!([format!("{hash:?}")]))
            .await?;
        Ok(raw.map(|tx| EvmTransaction {
            hash: tx.hash,
            block_number: tx.block_number.map(|b| b.as_u64()),
        }))
    }

    #[instrument(level = "debug", skip(self))]
    async fn transaction_receipt(&self, hash: H256) -> ChainResult<Option<EvmReceipt>> {
        let raw: Option<RawReceipt> = self
            .request("eth_getTransactionReceipt", json!([format!("{hash:?}")]))
            .await?;
        Ok(raw.map(|receipt| EvmReceipt {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|b| b.as_u64()),
            status: receipt.status.map(|s| s.as_u64()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_json_shape() {
        let query = LogQuery {
            from_block: 0x10,
            to_block: 0x20,
            address: H160::repeat_byte(0xaa),
            topics: [Some(H256::repeat_byte(0x01)), None, None],
        };
        let value = filter_json(&query);
        assert_eq!(value["fromBlock"], "0x10");
        assert_eq!(value["toBlock"], "0x20");
        assert_eq!(
            value["address"],
            "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
        );
        assert_eq!(value["topics"][1], Value::Null);
    }

    #[test]
    fn raw_log_parses_hex_payloads() {
        let raw: RawLog = serde_json::from_value(json!({
            "address": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            "topics": ["0x0101010101010101010101010101010101010101010101010101010101010101"],
            "data": "0x00000000000000000000000000000000000000000000000000000000000186a0",
            "blockNumber": "0x10",
            "transactionHash": "0x0202020202020202020202020202020202020202020202020202020202020202",
        }))
        .unwrap();
        assert_eq!(raw.block_number.unwrap().as_u64(), 16);
        assert_eq!(raw.data.len(), 32);
    }
}
