mod blocks;
mod events;
mod token_transfers;

pub use blocks::BlockJob;
pub use events::{EventJob, EventsJob};
pub use token_transfers::TokenTransferJob;

use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use strata_common::{normalize_address, WalletBalanceRecord};

use crate::accumulate::AccumulateHistoryMerger;
use crate::balance_cache::{chain_balance, Asset, BalanceChange, BalanceStateCache};
use crate::provider::ChainProvider;
use crate::sink::ItemSink;

/// Shared stores and settings handed to every extraction job
#[derive(Clone)]
pub struct JobContext {
    pub provider: Arc<dyn ChainProvider>,
    pub sink: Arc<dyn ItemSink>,
    pub balances: Arc<BalanceStateCache>,
    pub history: Arc<AccumulateHistoryMerger>,
    pub batch_size: usize,
    pub max_workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Opened,
    Exporting,
    Closed,
}

/// One kind of record pulled for a block range
#[async_trait]
pub trait ExtractionJob: Send + Sync {
    fn name(&self) -> String;

    fn sink(&self) -> &Arc<dyn ItemSink>;

    /// Fetch, derive and hand every record of the range to the sink.
    async fn export(&self) -> Result<()>;
}

/// Drive `job` through opened -> exporting -> closed. The sink is closed
/// even when the export fails; the export error wins.
pub async fn run_job(job: &dyn ExtractionJob) -> Result<JobState> {
    let name = job.name();
    job.sink().open().await.with_context(|| format!("{}: failed to open sink", name))?;
    let mut state = JobState::Opened;
    tracing::debug!("{} {:?}", name, state);

    state = JobState::Exporting;
    tracing::debug!("{} {:?}", name, state);
    let exported = job.export().await;

    let closed = job.sink().close().await;
    state = JobState::Closed;
    tracing::debug!("{} {:?}", name, state);

    exported.with_context(|| format!("{} failed", name))?;
    closed.with_context(|| format!("{}: failed to close sink", name))?;
    Ok(state)
}

/// Balance records for both sides of a transfer of `value` in `asset` at
/// `block`. A side whose pre-balance is unknown is left out. Misses read
/// the chain at `block - 1`, the state before the transfer.
pub(crate) async fn transfer_balance_records(
    ctx: &JobContext,
    asset: Asset,
    from: Address,
    to: Address,
    value: U256,
    block: u64,
) -> Vec<WalletBalanceRecord> {
    let mut records = Vec::with_capacity(2);
    for (address, change) in [(from, BalanceChange::Debit(value)), (to, BalanceChange::Credit(value))] {
        let provider = Arc::clone(&ctx.provider);
        let applied = ctx
            .balances
            .apply_change(address, asset, change, block.saturating_sub(1), move |a, t, b| async move {
                chain_balance(provider.as_ref(), a, t, b).await
            })
            .await;

        if let Some((pre_balance, balance)) = applied {
            records.push(WalletBalanceRecord {
                address: normalize_address(&address),
                token_address: asset.token_address(),
                balance: balance.to_string(),
                pre_balance: pre_balance.to_string(),
                at_block: block,
            });
        }
    }
    records
}
