use alloy::primitives::{Address, U256};
use anyhow::Result;
use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use strata_common::error::validate_range;
use strata_common::{normalize_address, ExportItem, StrataError, TokenTransfer};

use super::{transfer_balance_records, ExtractionJob, JobContext};
use crate::accumulate::transfer_activities;
use crate::balance_cache::Asset;
use crate::decoder::{transfer_descriptor, EventDecoder};
use crate::executor::BatchWorkExecutor;
use crate::partition::Partition;
use crate::provider::LogFilter;
use crate::sink::ItemSink;

/// Exports ERC-20 `Transfer` events with balance records for both sides
/// and folds `TransferFrom`/`TransferTo` activity into the history merger.
pub struct TokenTransferJob {
    ctx: JobContext,
    partition: Partition,
    decoder: Arc<EventDecoder>,
    tokens: Arc<Vec<Address>>,
}

impl TokenTransferJob {
    /// An empty `tokens` list scans transfers of every contract.
    pub fn new(ctx: JobContext, partition: Partition, tokens: Vec<Address>) -> Result<Self, StrataError> {
        validate_range(partition.start, partition.end)?;
        Ok(Self {
            ctx,
            partition,
            decoder: Arc::new(EventDecoder::new(transfer_descriptor())),
            tokens: Arc::new(tokens),
        })
    }
}

async fn export_batch(
    ctx: JobContext,
    decoder: Arc<EventDecoder>,
    tokens: Arc<Vec<Address>>,
    block_numbers: Vec<u64>,
) -> Result<()> {
    let (Some(&from_block), Some(&to_block)) = (block_numbers.first(), block_numbers.last()) else {
        return Ok(());
    };
    let filter = LogFilter {
        from_block,
        to_block,
        addresses: tokens.as_ref().clone(),
        topics: vec![decoder.topic()],
    };
    let logs = ctx.provider.get_logs(&filter).await?;

    let mut items = Vec::with_capacity(logs.len());
    for log in &logs {
        let Some(event) = decoder.decode(log) else {
            continue;
        };
        let Some((from, to, value)) = transfer_parts(&event.params) else {
            tracing::warn!(
                "Skipping transfer log {} of {} with unparsable params",
                event.log_index,
                event.transaction_hash
            );
            continue;
        };

        let wallets =
            transfer_balance_records(&ctx, Asset::Token(log.address), from, to, value, event.block_number).await;
        let from_address = normalize_address(&from);
        let to_address = normalize_address(&to);
        let activities = transfer_activities(
            &event.contract_address,
            &from_address,
            &to_address,
            value,
            event.block_number,
            &event.transaction_hash,
            event.log_index,
        )
        .into_iter()
        .map(|activity| ctx.history.insert(activity).into_activity())
        .collect();

        items.push(ExportItem::TokenTransfer(TokenTransfer {
            contract_address: event.contract_address,
            from_address,
            to_address,
            value: value.to_string(),
            transaction_hash: event.transaction_hash,
            log_index: event.log_index,
            block_number: event.block_number,
            wallets,
            activities,
        }));
    }

    ctx.sink.export_items(items).await
}

fn transfer_parts(params: &std::collections::BTreeMap<String, String>) -> Option<(Address, Address, U256)> {
    let from = Address::from_str(params.get("from")?).ok()?;
    let to = Address::from_str(params.get("to")?).ok()?;
    let value = U256::from_str(params.get("value")?).ok()?;
    Some((from, to, value))
}

#[async_trait]
impl ExtractionJob for TokenTransferJob {
    fn name(&self) -> String {
        format!("token transfers {}", self.partition)
    }

    fn sink(&self) -> &Arc<dyn ItemSink> {
        &self.ctx.sink
    }

    async fn export(&self) -> Result<()> {
        let executor = BatchWorkExecutor::new(self.ctx.batch_size, self.ctx.max_workers);
        let ctx = self.ctx.clone();
        let decoder = Arc::clone(&self.decoder);
        let tokens = Arc::clone(&self.tokens);

        executor
            .execute(
                self.partition.blocks().collect(),
                move |batch| export_batch(ctx.clone(), Arc::clone(&decoder), Arc::clone(&tokens), batch),
                Some(self.partition.len() as usize),
            )
            .await?;
        executor.shutdown().await?;
        Ok(())
    }
}
