use alloy::primitives::{Address, U256};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use strata_common::{normalize_address, ZERO_ADDRESS, NATIVE_TOKEN};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::provider::{token_balance, ChainError, ChainProvider};

const SHARDS: usize = 16;

/// Asset a balance is held in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Asset {
    Native,
    Token(Address),
}

impl Asset {
    /// Token address as written to balance records
    pub fn token_address(&self) -> String {
        match self {
            Asset::Native => NATIVE_TOKEN.to_string(),
            Asset::Token(address) => normalize_address(address),
        }
    }
}

/// Direction of a value transfer relative to the wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceChange {
    Debit(U256),
    Credit(U256),
}

#[derive(Debug, Clone, Copy)]
struct CachedBalance {
    balance: U256,
    fresh_until: Instant,
}

/// Balances cached for one wallet, as of the moment it was read
#[cfg(test)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalletSnapshot {
    pub balances: HashMap<Asset, U256>,
}

type Shard = HashMap<Address, HashMap<Asset, CachedBalance>>;

/// Entries as they were before the pending partition first touched them
type Journal = HashMap<(Address, Asset), Option<CachedBalance>>;

/// Reads a balance from the chain as of `block`.
pub async fn chain_balance(
    provider: &dyn ChainProvider,
    address: Address,
    asset: Asset,
    block: u64,
) -> Result<U256, ChainError> {
    match asset {
        Asset::Native => provider.get_balance(address, block).await,
        Asset::Token(token) => token_balance(provider, token, address, block).await,
    }
}

/// Per-wallet, per-asset balance ledger with wall-clock freshness.
///
/// Balances derived from observed transfers are trusted until the entry's
/// freshness deadline passes; after that the next access re-reads the chain.
/// Wallets are sharded by address and a shard stays locked across the chain
/// read that fills a miss, so updates to one wallet never interleave.
///
/// Changes are journaled until `commit`. `rollback` restores every entry the
/// pending partition touched, so re-exporting it derives the same records.
pub struct BalanceStateCache {
    shards: Vec<Mutex<Shard>>,
    ttl: Duration,
    journal: std::sync::Mutex<Journal>,
}

impl BalanceStateCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            ttl,
            journal: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn shard(&self, address: &Address) -> &Mutex<Shard> {
        &self.shards[address.0[19] as usize % SHARDS]
    }

    fn journal(&self) -> std::sync::MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the entry's state before its first change since the last commit.
    /// Must be called with the wallet's shard locked.
    fn remember(&self, shard: &Shard, address: Address, asset: Asset) {
        let prior = shard.get(&address).and_then(|assets| assets.get(&asset)).copied();
        self.journal().entry((address, asset)).or_insert(prior);
    }

    /// Keep every change made since the last commit or rollback.
    pub fn commit(&self) {
        self.journal().clear();
    }

    /// Undo every change made since the last commit.
    pub async fn rollback(&self) {
        let journal = std::mem::take(&mut *self.journal());
        if journal.is_empty() {
            return;
        }
        tracing::debug!("Rolling back {} cached balances", journal.len());

        for ((address, asset), prior) in journal {
            let mut shard = self.shard(&address).lock().await;
            match prior {
                Some(cached) => {
                    shard.entry(address).or_default().insert(asset, cached);
                }
                None => {
                    if let Some(assets) = shard.get_mut(&address) {
                        assets.remove(&asset);
                        if assets.is_empty() {
                            shard.remove(&address);
                        }
                    }
                }
            }
        }
    }

    /// Cached balance while fresh, otherwise the chain's balance at `block`.
    /// `None` means unknown: the zero address, or a failed chain read.
    #[cfg(test)]
    pub async fn get_or_fetch<F, Fut>(
        &self,
        address: Address,
        asset: Asset,
        block: u64,
        fetch: F,
    ) -> (Option<U256>, WalletSnapshot)
    where
        F: FnOnce(Address, Asset, u64) -> Fut,
        Fut: Future<Output = Result<U256, ChainError>>,
    {
        if address == ZERO_ADDRESS {
            return (None, WalletSnapshot::default());
        }
        let mut shard = self.shard(&address).lock().await;
        self.remember(&shard, address, asset);
        let balance = self.lookup(&mut shard, address, asset, block, fetch).await;
        (balance, snapshot(&shard, &address))
    }

    /// Overwrite the cached balance. The freshness deadline is kept when the
    /// asset was already cached.
    #[cfg(test)]
    pub async fn update(&self, address: Address, asset: Asset, balance: U256) {
        let mut shard = self.shard(&address).lock().await;
        self.remember(&shard, address, asset);
        self.store(&mut shard, address, asset, balance);
    }

    /// Apply a transfer to the wallet's balance under one lock and return
    /// `(pre_balance, balance)`. `None` when the pre-balance is unknown or a
    /// debit exceeds it; in the latter case the cached entry is dropped so
    /// the next access re-reads the chain.
    pub async fn apply_change<F, Fut>(
        &self,
        address: Address,
        asset: Asset,
        change: BalanceChange,
        block: u64,
        fetch: F,
    ) -> Option<(U256, U256)>
    where
        F: FnOnce(Address, Asset, u64) -> Fut,
        Fut: Future<Output = Result<U256, ChainError>>,
    {
        if address == ZERO_ADDRESS {
            return None;
        }
        let mut shard = self.shard(&address).lock().await;
        self.remember(&shard, address, asset);
        let pre = self.lookup(&mut shard, address, asset, block, fetch).await?;

        let post = match change {
            BalanceChange::Credit(value) => pre.saturating_add(value),
            BalanceChange::Debit(value) => match pre.checked_sub(value) {
                Some(post) => post,
                None => {
                    tracing::warn!(
                        "Debit of {} exceeds cached balance {} of {} for {}, dropping entry",
                        value,
                        pre,
                        normalize_address(&address),
                        asset.token_address()
                    );
                    if let Some(assets) = shard.get_mut(&address) {
                        assets.remove(&asset);
                    }
                    return None;
                }
            },
        };
        self.store(&mut shard, address, asset, post);
        Some((pre, post))
    }

    async fn lookup<F, Fut>(
        &self,
        shard: &mut Shard,
        address: Address,
        asset: Asset,
        block: u64,
        fetch: F,
    ) -> Option<U256>
    where
        F: FnOnce(Address, Asset, u64) -> Fut,
        Fut: Future<Output = Result<U256, ChainError>>,
    {
        let now = Instant::now();
        if let Some(cached) = shard.get(&address).and_then(|assets| assets.get(&asset)) {
            if now < cached.fresh_until {
                return Some(cached.balance);
            }
        }

        match fetch(address, asset, block).await {
            Ok(balance) => {
                shard.entry(address).or_default().insert(
                    asset,
                    CachedBalance {
                        balance,
                        fresh_until: now + self.ttl,
                    },
                );
                Some(balance)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to read balance of {} for {} at block {}: {}",
                    normalize_address(&address),
                    asset.token_address(),
                    block,
                    e
                );
                None
            }
        }
    }

    fn store(&self, shard: &mut Shard, address: Address, asset: Asset, balance: U256) {
        let ttl = self.ttl;
        shard
            .entry(address)
            .or_default()
            .entry(asset)
            .and_modify(|cached| cached.balance = balance)
            .or_insert_with(|| CachedBalance {
                balance,
                fresh_until: Instant::now() + ttl,
            });
    }
}

#[cfg(test)]
fn snapshot(shard: &Shard, address: &Address) -> WalletSnapshot {
    WalletSnapshot {
        balances: shard
            .get(address)
            .map(|assets| assets.iter().map(|(asset, cached)| (*asset, cached.balance)).collect())
            .unwrap_or_default(),
    }
}
