use alloy::eips::BlockId;
use alloy::network::Ethereum;
use alloy::primitives::{Address, Bytes, B256, U256, U64};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::client::RpcClient;
use alloy::rpc::types::{Filter, Log, TransactionRequest};
use alloy::sol;
use alloy::sol_types::SolCall;
use alloy::transports::http::reqwest::Url;
use alloy::transports::http::Http;
use alloy::transports::{RpcError, TransportErrorKind};
use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use strata_common::{normalize_address, normalize_hash, Block, Transaction};
use thiserror::Error;

use crate::config::Config;

/// Retry delays for head and block fetches (in seconds)
const RPC_RETRY_DELAYS: &[u64] = &[2, 5, 10, 20, 30];
const RPC_MAX_RETRIES: usize = 5;

sol! {
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
    }
}

pub(crate) type SharedRateLimiter = Arc<RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("RPC request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Malformed RPC response: {0}")]
    Malformed(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ChainError {
    /// Failures worth another attempt against the same node
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::Timeout | ChainError::Transport(_))
    }
}

impl From<RpcError<TransportErrorKind>> for ChainError {
    fn from(e: RpcError<TransportErrorKind>) -> Self {
        match e {
            RpcError::ErrorResp(payload) => ChainError::Rpc {
                code: payload.code,
                message: payload.message.to_string(),
            },
            RpcError::NullResp => ChainError::NotFound("null response".to_string()),
            RpcError::DeserError { err, .. } => ChainError::Malformed(err.to_string()),
            other => ChainError::Transport(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChainError::Timeout
        } else {
            ChainError::Transport(e.to_string())
        }
    }
}

// =====================
// Raw chain data
// =====================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: B256,
    pub block_number: U64,
    pub transaction_index: U64,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub gas: U256,
    #[serde(default)]
    pub gas_price: Option<U256>,
    pub input: Bytes,
}

impl RpcTransaction {
    /// Plain native-asset transfer: empty calldata, a recipient and a non-zero value
    pub fn is_value_transfer(&self) -> bool {
        self.input.is_empty() && self.to.is_some() && !self.value.is_zero()
    }

    pub fn to_record(&self) -> Transaction {
        Transaction {
            hash: normalize_hash(&self.hash),
            block_number: self.block_number.to::<u64>(),
            transaction_index: self.transaction_index.to::<u64>(),
            from_address: normalize_address(&self.from),
            to_address: self.to.as_ref().map(normalize_address),
            value: self.value.to_string(),
            gas: self.gas.to_string(),
            gas_price: self.gas_price.unwrap_or_default().to_string(),
            input: format!("0x{}", hex::encode(&self.input)),
            wallets: Vec::new(),
        }
    }
}

/// `transactions` is a list of hashes unless full objects were requested
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BlockTransactions {
    Full(Vec<RpcTransaction>),
    Hashes(Vec<B256>),
}

impl BlockTransactions {
    pub fn len(&self) -> usize {
        match self {
            BlockTransactions::Full(txs) => txs.len(),
            BlockTransactions::Hashes(hashes) => hashes.len(),
        }
    }

    pub fn full(&self) -> &[RpcTransaction] {
        match self {
            BlockTransactions::Full(txs) => txs,
            BlockTransactions::Hashes(_) => &[],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub number: U64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: U64,
    pub gas_limit: U256,
    pub gas_used: U256,
    pub transactions: BlockTransactions,
}

impl RpcBlock {
    pub fn to_record(&self) -> Block {
        Block {
            number: self.number.to::<u64>(),
            hash: normalize_hash(&self.hash),
            parent_hash: normalize_hash(&self.parent_hash),
            timestamp: self.timestamp.to::<u64>(),
            gas_limit: self.gas_limit.to_string(),
            gas_used: self.gas_used.to_string(),
            transaction_count: self.transactions.len() as u32,
        }
    }
}

/// Mined log with its position in the chain
#[derive(Debug, Clone)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
}

impl TryFrom<Log> for RawLog {
    type Error = ChainError;

    fn try_from(log: Log) -> Result<Self, ChainError> {
        let (Some(block_number), Some(transaction_hash), Some(log_index)) =
            (log.block_number, log.transaction_hash, log.log_index)
        else {
            return Err(ChainError::Malformed(format!(
                "log of {} has no block position",
                normalize_address(&log.inner.address)
            )));
        };
        Ok(Self {
            address: log.inner.address,
            topics: log.inner.data.topics().to_vec(),
            data: log.inner.data.data,
            block_number,
            transaction_hash,
            log_index,
        })
    }
}

/// Log query for a block range. `topics` are alternatives for topic0.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<Address>,
    pub topics: Vec<B256>,
}

impl LogFilter {
    fn to_filter(&self) -> Filter {
        let mut filter = Filter::new().from_block(self.from_block).to_block(self.to_block);
        if !self.addresses.is_empty() {
            filter = filter.address(self.addresses.clone());
        }
        if !self.topics.is_empty() {
            filter = filter.event_signature(self.topics.clone());
        }
        filter
    }
}

// =====================
// Provider boundary
// =====================

/// Read-only access to a chain node
#[async_trait]
pub trait ChainProvider: Send + Sync {
    async fn get_chain_head(&self) -> Result<u64, ChainError>;

    /// Blocks are returned in the order requested.
    async fn fetch_blocks(&self, numbers: &[u64], include_transactions: bool) -> Result<Vec<RpcBlock>, ChainError>;

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError>;

    async fn call_view_function(&self, contract: Address, calldata: Bytes, block: u64) -> Result<Bytes, ChainError>;

    /// Native asset balance
    async fn get_balance(&self, address: Address, block: u64) -> Result<U256, ChainError>;
}

/// ERC-20 `balanceOf(owner)` as of `block`
pub async fn token_balance(
    provider: &dyn ChainProvider,
    token: Address,
    owner: Address,
    block: u64,
) -> Result<U256, ChainError> {
    let calldata = IERC20::balanceOfCall { account: owner }.abi_encode();
    let output = provider.call_view_function(token, calldata.into(), block).await?;
    if output.len() < 32 {
        return Err(ChainError::Malformed(format!(
            "balanceOf returned {} bytes from {}",
            output.len(),
            normalize_address(&token)
        )));
    }
    Ok(U256::from_be_slice(&output[..32]))
}

pub(crate) type HttpProvider = RootProvider<Ethereum>;

/// JSON-RPC over HTTP. Single calls go through the alloy provider, block
/// ranges through one raw batch request.
pub struct RpcProvider {
    provider: HttpProvider,
    client: reqwest::Client,
    rpc_url: String,
    rate_limiter: SharedRateLimiter,
}

impl RpcProvider {
    pub fn new(config: &Config) -> Result<Self> {
        let url: Url = config
            .rpc_url
            .parse()
            .with_context(|| format!("Invalid RPC_URL {}", config.rpc_url))?;
        let http = alloy::transports::http::reqwest::Client::builder()
            .timeout(config.rpc_timeout)
            .build()?;
        let provider = RootProvider::new(RpcClient::new(Http::with_client(http, url), false));

        let client = reqwest::Client::builder()
            .timeout(config.rpc_timeout)
            .build()?;
        let rps = NonZeroU32::new(config.rpc_requests_per_second).unwrap_or(NonZeroU32::MIN.saturating_add(99));
        tracing::info!("Rate limiting RPC requests to {} req/sec", rps);

        Ok(Self {
            provider,
            client,
            rpc_url: config.rpc_url.clone(),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
        })
    }

    /// Run `op` again on retryable failures, backing off per `RPC_RETRY_DELAYS`.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ChainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!("{} succeeded after {} retries", what, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt + 1 < RPC_MAX_RETRIES => {
                    let delay = RPC_RETRY_DELAYS
                        .get(attempt)
                        .copied()
                        .unwrap_or(*RPC_RETRY_DELAYS.last().unwrap_or(&30));

                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {}s...",
                        what,
                        attempt + 1,
                        RPC_MAX_RETRIES,
                        e,
                        delay
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_blocks_once(&self, numbers: &[u64], include_transactions: bool) -> Result<Vec<RpcBlock>, ChainError> {
        for _ in numbers {
            self.rate_limiter.until_ready().await;
        }

        let batch_request: Vec<Value> = numbers
            .iter()
            .enumerate()
            .map(|(i, n)| {
                json!({
                    "jsonrpc": "2.0",
                    "method": "eth_getBlockByNumber",
                    "params": [format!("0x{:x}", n), include_transactions],
                    "id": i
                })
            })
            .collect();

        let response = self.client.post(&self.rpc_url).json(&batch_request).send().await?;
        if !response.status().is_success() {
            return Err(ChainError::Transport(format!("HTTP {}", response.status())));
        }
        let batch_response: Vec<Value> = response
            .json()
            .await
            .map_err(|e| ChainError::Malformed(format!("Failed to parse batch response: {}", e)))?;

        // Responses may arrive in any order
        let mut response_map: BTreeMap<u64, &Value> = BTreeMap::new();
        for resp in &batch_response {
            if let Some(id) = resp.get("id").and_then(|v| v.as_u64()) {
                response_map.insert(id, resp);
            }
        }

        let mut blocks = Vec::with_capacity(numbers.len());
        for (i, n) in numbers.iter().enumerate() {
            let resp = response_map
                .get(&(i as u64))
                .ok_or_else(|| ChainError::Malformed(format!("Missing response for block {}", n)))?;
            let block: RpcBlock = parse_result(resp, "eth_getBlockByNumber")
                .map_err(|e| match e {
                    ChainError::NotFound(_) => ChainError::NotFound(format!("block {}", n)),
                    other => other,
                })?;
            blocks.push(block);
        }
        Ok(blocks)
    }
}

fn parse_result<T: DeserializeOwned>(response: &Value, method: &str) -> Result<T, ChainError> {
    if let Some(error) = response.get("error") {
        return Err(ChainError::Rpc {
            code: error.get("code").and_then(|c| c.as_i64()).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    match response.get("result") {
        None | Some(Value::Null) => Err(ChainError::NotFound(format!("{} returned no result", method))),
        Some(result) => serde_json::from_value(result.clone())
            .map_err(|e| ChainError::Malformed(format!("{}: {}", method, e))),
    }
}

#[async_trait]
impl ChainProvider for RpcProvider {
    async fn get_chain_head(&self) -> Result<u64, ChainError> {
        self.with_retry("eth_blockNumber", || async {
            self.rate_limiter.until_ready().await;
            Ok::<_, ChainError>(self.provider.get_block_number().await?)
        })
        .await
    }

    async fn fetch_blocks(&self, numbers: &[u64], include_transactions: bool) -> Result<Vec<RpcBlock>, ChainError> {
        if numbers.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!("Fetching {} blocks starting at {}", numbers.len(), numbers[0]);
        self.with_retry("eth_getBlockByNumber batch", || self.fetch_blocks_once(numbers, include_transactions))
            .await
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError> {
        self.rate_limiter.until_ready().await;
        let logs = self.provider.get_logs(&filter.to_filter()).await?;
        logs.into_iter().map(RawLog::try_from).collect()
    }

    async fn call_view_function(&self, contract: Address, calldata: Bytes, block: u64) -> Result<Bytes, ChainError> {
        self.rate_limiter.until_ready().await;
        let tx = TransactionRequest::default().to(contract).input(calldata.into());
        Ok(self.provider.call(tx).block(BlockId::number(block)).await?)
    }

    async fn get_balance(&self, address: Address, block: u64) -> Result<U256, ChainError> {
        self.rate_limiter.until_ready().await;
        Ok(self.provider.get_balance(address).block_id(BlockId::number(block)).await?)
    }
}
