use alloy::primitives::{keccak256, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use strata_common::{normalize_address, normalize_hash, Event, StrataError};

use crate::provider::RawLog;

/// One parameter of an event ABI fragment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventParam {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub indexed: bool,
}

/// Event ABI fragment as stored in the event-ABI directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDescriptor {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<EventParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_name: Option<String>,
    #[serde(default)]
    pub is_lending: bool,
}

impl EventDescriptor {
    /// Canonical signature, e.g. `Transfer(address,address,uint256)`
    pub fn signature(&self) -> String {
        let types: Vec<&str> = self.inputs.iter().map(|p| p.kind.as_str()).collect();
        format!("{}({})", self.name, types.join(","))
    }

    pub fn topic(&self) -> B256 {
        keccak256(self.signature().as_bytes())
    }

    /// Indexed params first, each group in declaration order. This is the
    /// order of words in topics[1..] followed by the data blob.
    pub fn params_in_order(&self) -> Vec<EventParam> {
        let (mut indexed, rest): (Vec<_>, Vec<_>) = self.inputs.iter().cloned().partition(|p| p.indexed);
        indexed.extend(rest);
        indexed
    }

    pub fn record_name(&self) -> &str {
        self.save_name.as_deref().unwrap_or(&self.name)
    }
}

/// ERC-20 `Transfer(address indexed from, address indexed to, uint256 value)`
pub fn transfer_descriptor() -> EventDescriptor {
    let param = |name: &str, kind: &str, indexed| EventParam {
        name: name.to_string(),
        kind: kind.to_string(),
        indexed,
    };
    EventDescriptor {
        name: "Transfer".to_string(),
        inputs: vec![
            param("from", "address", true),
            param("to", "address", true),
            param("value", "uint256", false),
        ],
        save_name: None,
        is_lending: false,
    }
}

/// Load every `*.json` descriptor in `dir`, ordered by file name.
/// A missing directory yields no descriptors.
pub fn load_descriptors(dir: &Path) -> Result<Vec<EventDescriptor>, StrataError> {
    if !dir.exists() {
        tracing::warn!("Event ABI directory {} does not exist, no events will be indexed", dir.display());
        return Ok(Vec::new());
    }

    let entries = std::fs::read_dir(dir)
        .map_err(|e| StrataError::Config(format!("Cannot read {}: {}", dir.display(), e)))?;
    let mut paths = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| StrataError::Config(format!("Cannot read {}: {}", dir.display(), e)))?
            .path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut descriptors = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| StrataError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        let descriptor: EventDescriptor = serde_json::from_str(&raw)
            .map_err(|e| StrataError::Config(format!("Invalid event ABI {}: {}", path.display(), e)))?;
        tracing::debug!("Loaded event {} ({})", descriptor.signature(), path.display());
        descriptors.push(descriptor);
    }
    Ok(descriptors)
}

/// Decodes logs of one subscribed event into `Event` records.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    descriptor: EventDescriptor,
    topic: B256,
    params: Vec<EventParam>,
}

impl EventDecoder {
    pub fn new(descriptor: EventDescriptor) -> Self {
        let topic = descriptor.topic();
        let params = descriptor.params_in_order();
        Self { descriptor, topic, params }
    }

    pub fn descriptor(&self) -> &EventDescriptor {
        &self.descriptor
    }

    pub fn topic(&self) -> B256 {
        self.topic
    }

    /// `None` when the log belongs to another event or does not fit the
    /// descriptor's shape.
    pub fn decode(&self, log: &RawLog) -> Option<Event> {
        let transaction_hash = normalize_hash(&log.transaction_hash);
        let log_index = log.log_index;

        let Some(topic0) = log.topics.first() else {
            tracing::warn!("Topics are empty in log {} of transaction {}", log_index, transaction_hash);
            return None;
        };
        if *topic0 != self.topic {
            return None;
        }

        if log.data.len() % 32 != 0 {
            tracing::warn!(
                "Data of log {} in transaction {} is not word aligned ({} bytes)",
                log_index,
                transaction_hash,
                log.data.len()
            );
            return None;
        }
        let words: Vec<&[u8]> = log.topics[1..]
            .iter()
            .map(|topic| topic.as_slice())
            .chain(log.data.chunks(32))
            .collect();

        if words.len() != self.params.len() {
            tracing::warn!(
                "{} has {} params but log {} of transaction {} carries {} words",
                self.descriptor.name,
                self.params.len(),
                log_index,
                transaction_hash,
                words.len()
            );
            return None;
        }

        let params: BTreeMap<String, String> = self
            .params
            .iter()
            .zip(words)
            .map(|(param, word)| (param.name.clone(), decode_word(word, &param.kind)))
            .collect();

        Some(Event {
            contract_address: normalize_address(&log.address),
            transaction_hash,
            log_index,
            block_number: log.block_number,
            event_type: self.descriptor.name.clone(),
            save_name: self.descriptor.save_name.clone(),
            params,
            wallets: Vec::new(),
            activities: Vec::new(),
        })
    }
}

fn is_integer_type(kind: &str) -> bool {
    let bits = kind
        .strip_prefix("uint")
        .or_else(|| kind.strip_prefix("int"));
    match bits {
        Some("") => true,
        Some(bits) => bits.parse::<u16>().is_ok_and(|b| b > 0 && b <= 256 && b % 8 == 0),
        None => false,
    }
}

/// Integers as unsigned decimal, addresses as the low 20 bytes, anything else raw.
fn decode_word(word: &[u8], kind: &str) -> String {
    if is_integer_type(kind) {
        U256::from_be_slice(word).to_string()
    } else if kind == "address" {
        format!("0x{}", hex::encode(&word[12..]))
    } else {
        format!("0x{}", hex::encode(word))
    }
}

#[cfg(test)]
pub(crate) fn log_with(topics: Vec<B256>, data: Vec<u8>, block: u64, log_index: u64) -> RawLog {
    use alloy::primitives::{Address, Bytes};

    RawLog {
        address: Address::repeat_byte(0xcc),
        topics,
        data: Bytes::from(data),
        block_number: block,
        transaction_hash: B256::repeat_byte(block as u8),
        log_index,
    }
}
