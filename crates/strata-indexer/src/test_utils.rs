use alloy::primitives::{keccak256, Address, Bytes, B256, U256, U64};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::decoder::transfer_descriptor;
use crate::provider::{BlockTransactions, ChainError, ChainProvider, LogFilter, RawLog, RpcBlock, RpcTransaction};

/// In-memory chain for job and streaming-loop tests
#[derive(Default)]
pub struct MockProvider {
    head: AtomicU64,
    blocks: Mutex<BTreeMap<u64, RpcBlock>>,
    logs: Mutex<Vec<RawLog>>,
    native: Mutex<HashMap<Address, U256>>,
    tokens: Mutex<HashMap<(Address, Address), U256>>,
    failing_log_calls: AtomicUsize,
    failing_log_block: Mutex<Option<u64>>,
    balance_reads: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Add empty blocks `start..=end`
    pub fn add_empty_blocks(&self, start: u64, end: u64) {
        for n in start..=end {
            self.add_block(n, Vec::new());
        }
    }

    pub fn add_block(&self, number: u64, transactions: Vec<RpcTransaction>) {
        let block = RpcBlock {
            number: U64::from(number),
            hash: B256::from(U256::from(number)),
            parent_hash: B256::from(U256::from(number.saturating_sub(1))),
            timestamp: U64::from(1_700_000_000 + number * 12),
            gas_limit: U256::from(30_000_000u64),
            gas_used: U256::from(21_000u64 * transactions.len() as u64),
            transactions: BlockTransactions::Full(transactions),
        };
        self.blocks.lock().unwrap().insert(number, block);
    }

    pub fn add_log(&self, log: RawLog) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn set_native_balance(&self, address: Address, balance: u64) {
        self.native.lock().unwrap().insert(address, U256::from(balance));
    }

    pub fn set_token_balance(&self, token: Address, owner: Address, balance: u64) {
        self.tokens.lock().unwrap().insert((token, owner), U256::from(balance));
    }

    /// Make the next `n` `get_logs` calls fail
    pub fn fail_next_get_logs(&self, n: usize) {
        self.failing_log_calls.store(n, Ordering::SeqCst);
    }

    /// Make the first `get_logs` call whose range covers `block` fail
    pub fn fail_get_logs_at(&self, block: u64) {
        *self.failing_log_block.lock().unwrap() = Some(block);
    }

    pub fn balance_reads(&self) -> usize {
        self.balance_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainProvider for MockProvider {
    async fn get_chain_head(&self) -> Result<u64, ChainError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn fetch_blocks(&self, numbers: &[u64], include_transactions: bool) -> Result<Vec<RpcBlock>, ChainError> {
        let blocks = self.blocks.lock().unwrap();
        numbers
            .iter()
            .map(|n| {
                let mut block = blocks
                    .get(n)
                    .cloned()
                    .ok_or_else(|| ChainError::NotFound(format!("block {}", n)))?;
                if !include_transactions {
                    let hashes = block.transactions.full().iter().map(|tx| tx.hash).collect();
                    block.transactions = BlockTransactions::Hashes(hashes);
                }
                Ok(block)
            })
            .collect()
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, ChainError> {
        let remaining = self.failing_log_calls.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_log_calls.store(remaining - 1, Ordering::SeqCst);
            return Err(ChainError::Timeout);
        }
        {
            let mut failing = self.failing_log_block.lock().unwrap();
            if failing.is_some_and(|b| b >= filter.from_block && b <= filter.to_block) {
                *failing = None;
                return Err(ChainError::Transport("connection reset".to_string()));
            }
        }

        let mut logs: Vec<RawLog> = self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| {
                let block = log.block_number;
                block >= filter.from_block
                    && block <= filter.to_block
                    && (filter.addresses.is_empty() || filter.addresses.contains(&log.address))
                    && (filter.topics.is_empty()
                        || log.topics.first().is_some_and(|t| filter.topics.contains(t)))
            })
            .cloned()
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(logs)
    }

    async fn call_view_function(&self, contract: Address, calldata: Bytes, _block: u64) -> Result<Bytes, ChainError> {
        self.balance_reads.fetch_add(1, Ordering::SeqCst);
        if calldata.len() != 36 || calldata[..4] != keccak256("balanceOf(address)")[..4] {
            return Err(ChainError::Rpc { code: 3, message: "execution reverted".to_string() });
        }
        let owner = Address::from_slice(&calldata[16..36]);
        let balance = self
            .tokens
            .lock()
            .unwrap()
            .get(&(contract, owner))
            .copied()
            .unwrap_or_default();
        Ok(Bytes::from(balance.to_be_bytes::<32>().to_vec()))
    }

    async fn get_balance(&self, address: Address, _block: u64) -> Result<U256, ChainError> {
        self.balance_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.native.lock().unwrap().get(&address).copied().unwrap_or_default())
    }
}

pub fn value_transfer(hash: u8, block: u64, index: u64, from: Address, to: Address, value: u64) -> RpcTransaction {
    RpcTransaction {
        hash: B256::repeat_byte(hash),
        block_number: U64::from(block),
        transaction_index: U64::from(index),
        from,
        to: Some(to),
        value: U256::from(value),
        gas: U256::from(21_000u64),
        gas_price: Some(U256::from(1_000_000_000u64)),
        input: Bytes::new(),
    }
}

pub fn transfer_log(token: Address, from: Address, to: Address, value: u64, block: u64, log_index: u64) -> RawLog {
    RawLog {
        address: token,
        topics: vec![transfer_descriptor().topic(), from.into_word(), to.into_word()],
        data: Bytes::from(U256::from(value).to_be_bytes::<32>().to_vec()),
        block_number: block,
        transaction_hash: B256::from(U256::from(block * 1000 + log_index)),
        log_index,
    }
}
