use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Token address used for the chain's native asset in balance records.
pub const NATIVE_TOKEN: &str = "0x";

/// The null address; balances are never resolved for it.
pub const ZERO_ADDRESS: Address = Address::ZERO;

/// Lower-case, `0x`-prefixed rendering used for every address in exported records.
pub fn normalize_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

/// Lower-case, `0x`-prefixed rendering of a 32-byte hash.
pub fn normalize_hash(hash: &B256) -> String {
    format!("0x{}", hex::encode(hash.as_slice()))
}

// =====================
// Chain records
// =====================

/// Block header fields as exported to sinks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
    pub gas_limit: String,
    pub gas_used: String,
    pub transaction_count: u32,
}

/// Transaction as exported to sinks.
/// `input` is `"0x"` for plain value transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub block_number: u64,
    pub transaction_index: u64,
    pub from_address: String,
    pub to_address: Option<String>,
    pub value: String,
    pub gas: String,
    pub gas_price: String,
    pub input: String,
    #[serde(default)]
    pub wallets: Vec<WalletBalanceRecord>,
}

/// Balance of one address for one token right after a transaction touched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalanceRecord {
    pub address: String,
    /// `NATIVE_TOKEN` for the native asset
    pub token_address: String,
    pub balance: String,
    pub pre_balance: String,
    pub at_block: u64,
}

/// ERC-20 style `Transfer` event with resolved wallet balances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTransfer {
    pub contract_address: String,
    pub from_address: String,
    pub to_address: String,
    pub value: String,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    #[serde(default)]
    pub wallets: Vec<WalletBalanceRecord>,
    #[serde(default)]
    pub activities: Vec<WalletActivity>,
}

/// Any ABI-described event decoded from a log.
/// Integer params are decimal strings, address params lower-case hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub contract_address: String,
    pub transaction_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    pub event_type: String,
    /// Output alias for records of this event; `event_type` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_name: Option<String>,
    pub params: BTreeMap<String, String>,
    /// Balances of the event's address params in the emitting token (lending events only)
    #[serde(default)]
    pub wallets: Vec<WalletBalanceRecord>,
    #[serde(default)]
    pub activities: Vec<WalletActivity>,
}

// =====================
// Accumulate history
// =====================

/// One point in a wallet's running-total history for an activity type
/// against a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulateEntry {
    pub contract_address: String,
    pub activity_type: String,
    #[serde(with = "decimal_u256")]
    pub amount: U256,
    #[serde(with = "decimal_u256")]
    pub running_total: U256,
    pub block_number: u64,
    pub transaction_hash: String,
    /// Idempotency key; replaying the same event is a no-op.
    pub event_id: String,
}

/// An accumulate entry attributed to the wallet it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletActivity {
    pub wallet_address: String,
    pub entry: AccumulateEntry,
}

// =====================
// Sink items
// =====================

/// Everything an extraction job can hand to a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExportItem {
    Block(Block),
    Transaction(Transaction),
    TokenTransfer(TokenTransfer),
    Event(Event),
}

/// Identity of an exported item; sinks upsert on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemKey {
    Block(u64),
    Transaction(String),
    TokenTransfer { transaction_hash: String, log_index: u64 },
    Event { transaction_hash: String, log_index: u64 },
}

impl ExportItem {
    pub fn key(&self) -> ItemKey {
        match self {
            ExportItem::Block(b) => ItemKey::Block(b.number),
            ExportItem::Transaction(t) => ItemKey::Transaction(t.hash.clone()),
            ExportItem::TokenTransfer(t) => ItemKey::TokenTransfer {
                transaction_hash: t.transaction_hash.clone(),
                log_index: t.log_index,
            },
            ExportItem::Event(e) => ItemKey::Event {
                transaction_hash: e.transaction_hash.clone(),
                log_index: e.log_index,
            },
        }
    }
}

/// Serde adapter rendering `U256` as a decimal string
pub mod decimal_u256 {
    use alloy::primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_str(&s).map_err(serde::de::Error::custom)
    }
}
