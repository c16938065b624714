use std::{
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use alloy_primitives::{Address, Bytes, B256, U256};
use rand::Rng;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use crate::errors::{ChainError, ChainResult};

/// Retry schedule for transient chain failures: capped exponential backoff
/// with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            multiplier: 2.0,
            max_attempts: 5,
            max_jitter: Duration::from_millis(250),
        }
    }
}

/// Runs `op`, retrying transient failures per the policy. Permanent
/// failures return immediately.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> ChainResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ChainResult<T>>,
{
    let mut delay = policy.initial;
    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let jitter_ms = rand::thread_rng().gen_range(0..=policy.max_jitter.as_millis() as u64);
                let wait = delay + Duration::from_millis(jitter_ms);
                warn!(
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    "transient chain error, backing off: {err}"
                );
                tokio::time::sleep(wait).await;
                delay = Duration::from_secs_f64(delay.as_secs_f64() * policy.multiplier);
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("retry loop always returns")
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
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorObject>,
}

#[derive(Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

/// A log entry as returned by `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(default, deserialize_with = "hex_u64_opt")]
    pub block_number: Option<u64>,
}

/// A transaction receipt, reduced to the fields the monitor consumes.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: B256,
    #[serde(default, deserialize_with = "hex_u64_opt")]
    pub block_number: Option<u64>,
    #[serde(deserialize_with = "hex_u64")]
    pub status: u64,
    #[serde(default, deserialize_with = "hex_u64_opt")]
    pub gas_used: Option<u64>,
}

/// Minimal JSON-RPC 2.0 client over reqwest.
///
/// Every method classifies failures into transient/permanent; callers
/// apply [`with_retry`] where retry discipline is required.
pub struct RpcClient {
    http: reqwest::Client,
    url: Url,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: &str, call_timeout: Duration) -> ChainResult<Self> {
        let url = Url::parse(url)
            .map_err(|err| ChainError::Permanent(format!("invalid rpc url: {err}")))?;
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|err| ChainError::Permanent(format!("http client: {err}")))?;
        Ok(Self {
            http,
            url,
            next_id: AtomicU64::new(1),
        })
    }

    pub async fn request<R: DeserializeOwned>(&self, method: &str, params: Value) -> ChainResult<R> {
        let body = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response = self
            .http
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(ChainError::from_reqwest)?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ChainError::Transient(format!("rpc http {status}")));
        }
        if !status.is_success() {
            return Err(ChainError::Permanent(format!("rpc http {status}")));
        }

        let parsed: JsonRpcResponse = response
            .json()
            .await
            .map_err(|err| ChainError::Permanent(format!("malformed rpc response: {err}")))?;

        if let Some(error) = parsed.error {
            return Err(classify_rpc_error(method, error));
        }
        // A null result is legitimate (e.g. a pending receipt); let the
        // caller's type decide whether that is acceptable.
        let result = parsed.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|err| ChainError::Permanent(format!("{method}: malformed result: {err}")))
    }

    pub async fn block_number(&self) -> ChainResult<u64> {
        let raw: String = self.request("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&raw)
    }

    pub async fn chain_id(&self) -> ChainResult<u64> {
        let raw: String = self.request("eth_chainId", json!([])).await?;
        parse_hex_u64(&raw)
    }

    pub async fn call(&self, to: Address, data: &[u8]) -> ChainResult<Bytes> {
        let raw: String = self
            .request(
                "eth_call",
                json!([{ "to": to, "data": hex_bytes(data) }, "latest"]),
            )
            .await?;
        parse_hex_bytes(&raw)
    }

    pub async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[Address],
    ) -> ChainResult<Vec<RpcLog>> {
        self.request(
            "eth_getLogs",
            json!([{
                "fromBlock": hex_quantity(from_block),
                "toBlock": hex_quantity(to_block),
                "address": addresses,
            }]),
        )
        .await
    }

    pub async fn transaction_count(&self, address: Address) -> ChainResult<u64> {
        let raw: String = self
            .request("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        parse_hex_u64(&raw)
    }

    pub async fn balance(&self, address: Address) -> ChainResult<U256> {
        let raw: String = self
            .request("eth_getBalance", json!([address, "latest"]))
            .await?;
        parse_hex_u256(&raw)
    }

    pub async fn estimate_gas(&self, from: Address, to: Address, data: &[u8]) -> ChainResult<u64> {
        let raw: String = self
            .request(
                "eth_estimateGas",
                json!([{ "from": from, "to": to, "data": hex_bytes(data) }]),
            )
            .await?;
        parse_hex_u64(&raw)
    }

    /// Base fee of the latest block; zero on pre-1559 chains.
    pub async fn base_fee(&self) -> ChainResult<u128> {
        let block: Value = self
            .request("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        match block.get("baseFeePerGas").and_then(Value::as_str) {
            Some(raw) => Ok(parse_hex_u64(raw)? as u128),
            None => Ok(0),
        }
    }

    pub async fn send_raw_transaction(&self, raw_tx: &[u8]) -> ChainResult<B256> {
        let raw: String = self
            .request("eth_sendRawTransaction", json!([hex_bytes(raw_tx)]))
            .await?;
        raw.parse::<B256>()
            .map_err(|err| ChainError::Permanent(format!("malformed tx hash: {err}")))
    }

    pub async fn transaction_receipt(&self, hash: B256) -> ChainResult<Option<RpcReceipt>> {
        self.request("eth_getTransactionReceipt", json!([hash])).await
    }
}

fn classify_rpc_error(method: &str, error: JsonRpcErrorObject) -> ChainError {
    let lowered = error.message.to_ascii_lowercase();
    debug!(method, code = error.code, "rpc error: {}", error.message);
    if lowered.contains("rate limit")
        || lowered.contains("too many requests")
        || lowered.contains("timeout")
        || error.code == -32005
    {
        ChainError::Transient(format!("{method}: {}", error.message))
    } else {
        ChainError::Permanent(format!("{method}: {}", error.message))
    }
}

pub(crate) fn hex_quantity(value: u64) -> String {
    format!("{value:#x}")
}

pub(crate) fn hex_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(2 + data.len() * 2);
    out.push_str("0x");
    for byte in data {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn parse_hex_u64(raw: &str) -> ChainResult<u64> {
    let stripped = raw.trim_start_matches("0x");
    u64::from_str_radix(stripped, 16)
        .map_err(|err| ChainError::Permanent(format!("malformed quantity {raw:?}: {err}")))
}

fn parse_hex_u256(raw: &str) -> ChainResult<U256> {
    raw.parse::<U256>()
        .map_err(|err| ChainError::Permanent(format!("malformed quantity {raw:?}: {err}")))
}

fn parse_hex_bytes(raw: &str) -> ChainResult<Bytes> {
    raw.parse::<Bytes>()
        .map_err(|err| ChainError::Permanent(format!("malformed bytes: {err}")))
}

fn hex_u64<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_hex_u64(&raw).map_err(serde::de::Error::custom)
}

fn hex_u64_opt<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw {
        Some(raw) => parse_hex_u64(&raw).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
