//! JSON-RPC chain provider
//!
//! Talks to an Ethereum node over HTTP with `ureq`. Requests are blocking, so
//! each one runs on tokio's blocking pool. Transport failures are retried a
//! bounded number of times. Node-side errors are returned as they are, except
//! that an oversized `eth_getLogs` answer becomes [`Error::ResponseTooLarge`]
//! so the fetch driver can shrink its page.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{hex, Address, Bytes, B256, U64};
use async_trait::async_trait;
use chainstore_core::{Error, Result};
use chainstore_engine::{Block, BlockProvider, BlockSpec, Log, LogFilter, LogProvider};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 4;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Node error messages that mean "ask for fewer blocks".
const TOO_LARGE_MARKERS: &[&str] = &[
    "response size exceeded",
    "query returned more than",
    "block range is too wide",
    "exceed maximum block range",
];

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<NodeError>,
}

#[derive(Debug, Deserialize)]
struct NodeError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlock {
    number: U64,
    hash: Option<B256>,
    parent_hash: B256,
}

impl RawBlock {
    fn into_block(self) -> std::result::Result<Block, RpcFailure> {
        let hash = self.hash.ok_or_else(|| {
            RpcFailure::Malformed(format!("block {} has no hash", self.number))
        })?;
        Ok(Block {
            number: self.number.to::<u64>(),
            hash: hex::encode_prefixed(hash),
            parent_hash: hex::encode_prefixed(self.parent_hash),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    block_number: Option<U64>,
    block_hash: Option<B256>,
    transaction_index: Option<U64>,
    log_index: Option<U64>,
    transaction_hash: Option<B256>,
    #[serde(default)]
    removed: bool,
}

impl RawLog {
    fn into_log(self) -> std::result::Result<Log, RpcFailure> {
        let pending = || RpcFailure::Malformed("node returned a pending log".to_string());
        Ok(Log {
            address: self.address,
            topics: self.topics,
            data: self.data,
            block_number: self.block_number.ok_or_else(pending)?.to::<u64>(),
            block_hash: hex::encode_prefixed(self.block_hash.ok_or_else(pending)?),
            transaction_index: self.transaction_index.ok_or_else(pending)?.to::<u64>(),
            log_index: self.log_index.ok_or_else(pending)?.to::<u64>(),
            transaction_hash: self.transaction_hash,
        })
    }
}

// ============================================================================
// Failures
// ============================================================================

#[derive(Debug)]
enum RpcFailure {
    /// Network failure, timeout or server-side HTTP status
    Transport(String),
    /// The node answered with a JSON-RPC error object
    Node { code: i64, message: String },
    /// The answer did not have the expected shape
    Malformed(String),
}

impl RpcFailure {
    fn is_response_too_large(&self) -> bool {
        match self {
            RpcFailure::Node { message, .. } => {
                let message = message.to_lowercase();
                TOO_LARGE_MARKERS.iter().any(|m| message.contains(m))
            }
            _ => false,
        }
    }

    fn into_error(self, method: &str) -> Error {
        match self {
            RpcFailure::Transport(msg) => Error::Provider(format!("{}: {}", method, msg)),
            RpcFailure::Node { code, message } => {
                Error::Provider(format!("{} failed with code {}: {}", method, code, message))
            }
            RpcFailure::Malformed(msg) => {
                Error::Provider(format!("{}: malformed response: {}", method, msg))
            }
        }
    }
}

// ============================================================================
// Provider
// ============================================================================

/// [`BlockProvider`] and [`LogProvider`] backed by a JSON-RPC node.
pub struct JsonRpcProvider {
    url: String,
    agent: ureq::Agent,
    next_id: AtomicU64,
}

impl JsonRpcProvider {
    /// Provider for the node at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .http_status_as_error(false)
            .build();
        Self {
            url: url.into(),
            agent: ureq::Agent::new_with_config(config),
            next_id: AtomicU64::new(1),
        }
    }

    async fn call<T>(&self, method: &'static str, params: Value) -> std::result::Result<T, RpcFailure>
    where
        T: DeserializeOwned,
    {
        let mut attempt = 1;
        loop {
            let body = json!({
                "jsonrpc": "2.0",
                "id": self.next_id.fetch_add(1, Ordering::Relaxed),
                "method": method,
                "params": params.clone(),
            });
            let agent = self.agent.clone();
            let url = self.url.clone();
            let outcome = tokio::task::spawn_blocking(move || post(&agent, &url, &body))
                .await
                .unwrap_or_else(|e| Err(RpcFailure::Transport(format!("request task failed: {}", e))));

            match outcome {
                Err(RpcFailure::Transport(msg)) if attempt < MAX_ATTEMPTS => {
                    warn!(
                        target: "chainstore::rpc",
                        method,
                        attempt,
                        error = %msg,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(failure) => return Err(failure),
                Ok(result) => {
                    return serde_json::from_value(result)
                        .map_err(|e| RpcFailure::Malformed(e.to_string()));
                }
            }
        }
    }

    async fn get_block(&self, method: &'static str, params: Value) -> Result<Option<Block>> {
        let raw: Option<RawBlock> = self
            .call(method, params)
            .await
            .map_err(|f| f.into_error(method))?;
        raw.map(RawBlock::into_block)
            .transpose()
            .map_err(|f| f.into_error(method))
    }
}

fn post(agent: &ureq::Agent, url: &str, body: &Value) -> std::result::Result<Value, RpcFailure> {
    let bytes = serde_json::to_vec(body).map_err(|e| RpcFailure::Malformed(e.to_string()))?;
    let mut response = agent
        .post(url)
        .header("Content-Type", "application/json")
        .send(&bytes[..])
        .map_err(|e| RpcFailure::Transport(e.to_string()))?;

    let status = response.status();
    if status.is_server_error() || status.as_u16() == 429 {
        return Err(RpcFailure::Transport(format!("HTTP status {}", status)));
    }

    let text = response
        .body_mut()
        .read_to_string()
        .map_err(|e| RpcFailure::Transport(format!("failed to read response: {}", e)))?;
    parse_envelope(&text)
}

fn parse_envelope(text: &str) -> std::result::Result<Value, RpcFailure> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|e| {
        RpcFailure::Malformed(format!(
            "invalid JSON response: {}: {}",
            e,
            &text[..text.len().min(200)]
        ))
    })?;
    if let Some(err) = envelope.error {
        return Err(RpcFailure::Node {
            code: err.code,
            message: err.message,
        });
    }
    Ok(envelope.result.unwrap_or(Value::Null))
}

fn quantity(n: u64) -> String {
    format!("{:#x}", n)
}

/// `eth_getLogs` parameters for `filter`.
fn filter_params(filter: &LogFilter) -> Value {
    let mut object = Map::new();
    match &filter.blocks {
        BlockSpec::Range {
            from_block,
            to_block,
        } => {
            object.insert("fromBlock".to_string(), json!(quantity(*from_block)));
            object.insert("toBlock".to_string(), json!(quantity(*to_block)));
        }
        BlockSpec::Hash(hash) => {
            object.insert("blockHash".to_string(), json!(hash));
        }
    }
    if !filter.topics.address.is_empty() {
        object.insert("address".to_string(), json!(filter.topics.address));
    }
    if !filter.topics.topics.is_empty() {
        let topics: Vec<Value> = filter
            .topics
            .topics
            .iter()
            .map(|accepted| {
                if accepted.is_empty() {
                    Value::Null
                } else {
                    json!(accepted)
                }
            })
            .collect();
        object.insert("topics".to_string(), Value::Array(topics));
    }
    json!([Value::Object(object)])
}

#[async_trait]
impl BlockProvider for JsonRpcProvider {
    async fn get_block_by_hash(&self, hash: &str) -> Result<Block> {
        self.get_block("eth_getBlockByHash", json!([hash, false]))
            .await?
            .ok_or_else(|| Error::Provider(format!("unknown block hash {}", hash)))
    }

    async fn get_block_by_number(&self, number: u64) -> Result<Option<Block>> {
        self.get_block("eth_getBlockByNumber", json!([quantity(number), false]))
            .await
    }

    async fn get_latest_block(&self) -> Result<Block> {
        self.get_block("eth_getBlockByNumber", json!(["latest", false]))
            .await?
            .ok_or_else(|| Error::Provider("node returned no latest block".to_string()))
    }
}

#[async_trait]
impl LogProvider for JsonRpcProvider {
    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>> {
        const METHOD: &str = "eth_getLogs";
        let raw: Vec<RawLog> = match self.call(METHOD, filter_params(filter)).await {
            Ok(raw) => raw,
            Err(failure) => {
                if let BlockSpec::Range {
                    from_block,
                    to_block,
                } = filter.blocks
                {
                    if failure.is_response_too_large() {
                        return Err(Error::ResponseTooLarge {
                            from_block,
                            to_block,
                        });
                    }
                }
                return Err(failure.into_error(METHOD));
            }
        };

        let logs = raw
            .into_iter()
            .filter(|log| !log.removed)
            .map(RawLog::into_log)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|f| f.into_error(METHOD))?;
        debug!(target: "chainstore::rpc", count = logs.len(), "Fetched logs");
        Ok(logs)
    }
}
