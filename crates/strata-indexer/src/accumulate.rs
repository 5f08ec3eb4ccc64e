use alloy::primitives::U256;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Mutex;
use strata_common::{AccumulateEntry, Event, WalletActivity};

const SHARDS: usize = 16;

/// Identity of one running-total history
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistoryKey {
    pub wallet_address: String,
    pub activity_type: String,
    pub contract_address: String,
}

/// One activity amount to fold into a wallet's history
#[derive(Debug, Clone)]
pub struct Activity {
    pub wallet_address: String,
    pub activity_type: String,
    pub contract_address: String,
    pub amount: U256,
    pub block_number: u64,
    pub transaction_hash: String,
    pub event_id: String,
}

impl Activity {
    fn key(&self) -> HistoryKey {
        HistoryKey {
            wallet_address: self.wallet_address.clone(),
            activity_type: self.activity_type.clone(),
            contract_address: self.contract_address.clone(),
        }
    }
}

/// Idempotency key of the activity derived from a log
pub fn event_id(transaction_hash: &str, log_index: u64) -> String {
    format!("{}:{}", transaction_hash, log_index)
}

type Shard = HashMap<HistoryKey, Vec<AccumulateEntry>>;

/// Result of folding an activity into its history
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted(WalletActivity),
    /// Same event id already present at that block; history unchanged
    Replayed(WalletActivity),
}

impl MergeOutcome {
    /// The entry as stored in the history, whether new or replayed
    pub fn into_activity(self) -> WalletActivity {
        match self {
            MergeOutcome::Inserted(activity) | MergeOutcome::Replayed(activity) => activity,
        }
    }

    #[cfg(test)]
    pub fn is_replay(&self) -> bool {
        matches!(self, MergeOutcome::Replayed(_))
    }
}

/// Block-ordered running totals per (wallet, activity type, contract).
///
/// Entries are inserted after every entry at the same or an earlier block,
/// so a late arrival lands in block order. Totals of entries already after
/// the insertion point are left as they were.
pub struct AccumulateHistoryMerger {
    shards: Vec<Mutex<Shard>>,
}

impl Default for AccumulateHistoryMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl AccumulateHistoryMerger {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &HistoryKey) -> std::sync::MutexGuard<'_, Shard> {
        let mut hasher = DefaultHasher::new();
        key.wallet_address.hash(&mut hasher);
        let idx = (hasher.finish() % SHARDS as u64) as usize;
        self.shards[idx].lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fold `activity` into its history. An entry whose event id already
    /// sits at the same block is left alone and returned as a replay.
    pub fn insert(&self, activity: Activity) -> MergeOutcome {
        let key = activity.key();
        let mut shard = self.shard(&key);
        let history = shard.entry(key).or_default();

        let at_block = activity.block_number;
        let pos = history.partition_point(|e| e.block_number <= at_block);
        let replayed = history[..pos]
            .iter()
            .rev()
            .take_while(|e| e.block_number == at_block)
            .find(|e| e.event_id == activity.event_id);
        if let Some(existing) = replayed {
            tracing::debug!(
                "Skipping replayed {} activity {} for {}",
                activity.activity_type,
                activity.event_id,
                activity.wallet_address
            );
            return MergeOutcome::Replayed(WalletActivity {
                wallet_address: activity.wallet_address,
                entry: existing.clone(),
            });
        }

        let running_total = match pos {
            0 => activity.amount,
            _ => history[pos - 1].running_total.saturating_add(activity.amount),
        };
        let entry = AccumulateEntry {
            contract_address: activity.contract_address,
            activity_type: activity.activity_type,
            amount: activity.amount,
            running_total,
            block_number: at_block,
            transaction_hash: activity.transaction_hash,
            event_id: activity.event_id,
        };
        history.insert(pos, entry.clone());

        MergeOutcome::Inserted(WalletActivity {
            wallet_address: activity.wallet_address,
            entry,
        })
    }

    pub fn history(&self, key: &HistoryKey) -> Vec<AccumulateEntry> {
        self.shard(key).get(key).cloned().unwrap_or_default()
    }

    /// Total of the most recent entry
    #[cfg(test)]
    pub fn current_total(&self, key: &HistoryKey) -> Option<U256> {
        self.shard(key).get(key).and_then(|h| h.last()).map(|e| e.running_total)
    }
}

/// Where a lending leg takes its amount from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AmountSource {
    Param(&'static str),
    Fixed(u64),
}

/// One wallet-side activity produced by a lending event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LendingLeg {
    activity_type: &'static str,
    wallet_param: &'static str,
    amount: AmountSource,
}

const fn leg(activity_type: &'static str, wallet_param: &'static str, amount: AmountSource) -> LendingLeg {
    LendingLeg { activity_type, wallet_param, amount }
}

const MINT_LEGS: &[LendingLeg] = &[leg("Mint", "minter", AmountSource::Param("mintAmount"))];
const BORROW_LEGS: &[LendingLeg] = &[leg("Borrow", "borrower", AmountSource::Param("borrowAmount"))];
const REPAY_LEGS: &[LendingLeg] = &[leg("RepayBorrow", "borrower", AmountSource::Param("repayAmount"))];
const REDEEM_LEGS: &[LendingLeg] = &[leg("Redeem", "redeemer", AmountSource::Param("redeemAmount"))];
const LIQUIDATE_LEGS: &[LendingLeg] = &[
    leg("LiquidateBorrow-liquidator", "liquidator", AmountSource::Param("repayAmount")),
    leg("LiquidateBorrow-borrower", "borrower", AmountSource::Fixed(1)),
];

/// Lending-protocol events that feed accumulate histories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LendingAction {
    Mint,
    Borrow,
    RepayBorrow,
    Redeem,
    LiquidateBorrow,
}

impl FromStr for LendingAction {
    type Err = String;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "Mint" => Ok(LendingAction::Mint),
            "Borrow" => Ok(LendingAction::Borrow),
            "RepayBorrow" => Ok(LendingAction::RepayBorrow),
            "Redeem" => Ok(LendingAction::Redeem),
            "LiquidateBorrow" => Ok(LendingAction::LiquidateBorrow),
            other => Err(format!("{} is not a lending event", other)),
        }
    }
}

impl LendingAction {
    fn legs(&self) -> &'static [LendingLeg] {
        match self {
            LendingAction::Mint => MINT_LEGS,
            LendingAction::Borrow => BORROW_LEGS,
            LendingAction::RepayBorrow => REPAY_LEGS,
            LendingAction::Redeem => REDEEM_LEGS,
            LendingAction::LiquidateBorrow => LIQUIDATE_LEGS,
        }
    }

    /// Activities carried by `event`. Legs whose wallet or amount param is
    /// missing or unparsable are skipped.
    pub fn activities(&self, event: &Event) -> Vec<Activity> {
        let id = event_id(&event.transaction_hash, event.log_index);
        self.legs()
            .iter()
            .filter_map(|leg| {
                let wallet = event.params.get(leg.wallet_param)?;
                let amount = match leg.amount {
                    AmountSource::Param(name) => U256::from_str(event.params.get(name)?).ok()?,
                    AmountSource::Fixed(value) => U256::from(value),
                };
                Some(Activity {
                    wallet_address: wallet.clone(),
                    activity_type: leg.activity_type.to_string(),
                    contract_address: event.contract_address.clone(),
                    amount,
                    block_number: event.block_number,
                    transaction_hash: event.transaction_hash.clone(),
                    event_id: id.clone(),
                })
            })
            .collect()
    }
}

/// `TransferFrom` for the sender and `TransferTo` for the recipient
pub fn transfer_activities(
    contract_address: &str,
    from_address: &str,
    to_address: &str,
    value: U256,
    block_number: u64,
    transaction_hash: &str,
    log_index: u64,
) -> [Activity; 2] {
    let id = event_id(transaction_hash, log_index);
    let activity = |wallet: &str, activity_type: &str| Activity {
        wallet_address: wallet.to_string(),
        activity_type: activity_type.to_string(),
        contract_address: contract_address.to_string(),
        amount: value,
        block_number,
        transaction_hash: transaction_hash.to_string(),
        event_id: id.clone(),
    };
    [activity(from_address, "TransferFrom"), activity(to_address, "TransferTo")]
}
