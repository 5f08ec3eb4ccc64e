use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use strata_common::error::validate_range;
use strata_common::{normalize_address, Event, ExportItem, StrataError, WalletBalanceRecord};

use super::{ExtractionJob, JobContext};
use crate::accumulate::LendingAction;
use crate::decoder::{EventDecoder, EventDescriptor};
use crate::executor::BatchWorkExecutor;
use crate::partition::Partition;
use crate::provider::{token_balance, LogFilter, RawLog};
use crate::sink::ItemSink;

/// Exports every log of one subscribed event in a partition
pub struct EventJob {
    ctx: JobContext,
    partition: Partition,
    decoder: Arc<EventDecoder>,
    tokens: Arc<Vec<Address>>,
}

impl EventJob {
    pub fn new(
        ctx: JobContext,
        partition: Partition,
        descriptor: EventDescriptor,
        tokens: Vec<Address>,
    ) -> Result<Self, StrataError> {
        validate_range(partition.start, partition.end)?;
        Ok(Self {
            ctx,
            partition,
            decoder: Arc::new(EventDecoder::new(descriptor)),
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

    let descriptor = decoder.descriptor();
    let action = if descriptor.is_lending {
        match descriptor.name.parse::<LendingAction>() {
            Ok(action) => Some(action),
            Err(e) => {
                tracing::debug!("{}, no activity recorded", e);
                None
            }
        }
    } else {
        None
    };

    let mut items = Vec::with_capacity(logs.len());
    for log in &logs {
        let Some(mut event) = decoder.decode(log) else {
            continue;
        };

        if descriptor.is_lending {
            event.wallets = lending_balance_records(&ctx, descriptor, log, &event).await;
        }
        if let Some(action) = action {
            event.activities = action
                .activities(&event)
                .into_iter()
                .map(|activity| ctx.history.insert(activity).into_activity())
                .collect();
        }

        items.push(ExportItem::Event(event));
    }

    ctx.sink.export_items(items).await
}

/// Token balances of every address param of a lending event, read straight
/// from the chain at the event block and the block before it. Wallets whose
/// balance cannot be read are left out. The balance cache is not touched: it
/// may already hold transfers from later blocks of the same partition.
async fn lending_balance_records(
    ctx: &JobContext,
    descriptor: &EventDescriptor,
    log: &RawLog,
    event: &Event,
) -> Vec<WalletBalanceRecord> {
    let mut records = Vec::new();
    for param in descriptor.inputs.iter().filter(|p| p.kind == "address") {
        let Some(owner) = event.params.get(&param.name).and_then(|v| Address::from_str(v).ok()) else {
            continue;
        };
        if owner == Address::ZERO {
            continue;
        }

        let balance = read_token_balance(ctx, log.address, owner, event.block_number).await;
        let pre_balance = read_token_balance(ctx, log.address, owner, event.block_number.saturating_sub(1)).await;
        let (Some(balance), Some(pre_balance)) = (balance, pre_balance) else {
            continue;
        };

        records.push(WalletBalanceRecord {
            address: normalize_address(&owner),
            token_address: event.contract_address.clone(),
            balance: balance.to_string(),
            pre_balance: pre_balance.to_string(),
            at_block: event.block_number,
        });
    }
    records
}

async fn read_token_balance(ctx: &JobContext, token: Address, owner: Address, block: u64) -> Option<U256> {
    match token_balance(ctx.provider.as_ref(), token, owner, block).await {
        Ok(balance) => Some(balance),
        Err(e) => {
            tracing::warn!(
                "Failed to read balance of {} on {} at block {}: {}",
                normalize_address(&owner),
                normalize_address(&token),
                block,
                e
            );
            None
        }
    }
}

#[async_trait]
impl ExtractionJob for EventJob {
    fn name(&self) -> String {
        format!("{} events {}", self.decoder.descriptor().name, self.partition)
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

/// Runs one `EventJob` per subscribed event, up to `subscription_workers`
/// of them at once.
pub struct EventsJob {
    ctx: JobContext,
    partition: Partition,
    descriptors: Vec<EventDescriptor>,
    tokens: Vec<Address>,
    subscription_workers: usize,
}

impl EventsJob {
    pub fn new(
        ctx: JobContext,
        partition: Partition,
        descriptors: Vec<EventDescriptor>,
        tokens: Vec<Address>,
        subscription_workers: usize,
    ) -> Result<Self, StrataError> {
        validate_range(partition.start, partition.end)?;
        if subscription_workers == 0 {
            return Err(StrataError::InvalidInput(
                "event subscription workers must be at least 1".to_string(),
            ));
        }
        Ok(Self { ctx, partition, descriptors, tokens, subscription_workers })
    }
}

#[async_trait]
impl ExtractionJob for EventsJob {
    fn name(&self) -> String {
        format!("events {}", self.partition)
    }

    fn sink(&self) -> &Arc<dyn ItemSink> {
        &self.ctx.sink
    }

    async fn export(&self) -> Result<()> {
        if self.descriptors.is_empty() {
            return Ok(());
        }

        let executor = BatchWorkExecutor::new(1, self.subscription_workers);
        let ctx = self.ctx.clone();
        let partition = self.partition;
        let tokens = self.tokens.clone();

        executor
            .execute(
                self.descriptors.clone(),
                move |descriptors| {
                    let ctx = ctx.clone();
                    let tokens = tokens.clone();
                    async move {
                        for descriptor in descriptors {
                            let job = EventJob::new(ctx.clone(), partition, descriptor, tokens.clone())?;
                            job.export().await.with_context(|| format!("{} failed", job.name()))?;
                        }
                        Ok::<(), anyhow::Error>(())
                    }
                },
                Some(self.descriptors.len()),
            )
            .await?;
        executor.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulate::HistoryKey;
    use crate::balance_cache::Asset;
    use crate::decoder::{log_with, EventParam};
    use crate::jobs::run_job;
    use crate::jobs::testing::context;
    use crate::sink::MemorySink;
    use crate::provider::ChainError;
    use crate::jobs::TokenTransferJob;
    use crate::test_utils::{transfer_log, MockProvider};
    use alloy::primitives::B256;
    use strata_common::TokenTransfer;

    fn param(name: &str, kind: &str, indexed: bool) -> EventParam {
        EventParam { name: name.to_string(), kind: kind.to_string(), indexed }
    }

    fn mint_descriptor() -> EventDescriptor {
        EventDescriptor {
            name: "Mint".to_string(),
            inputs: vec![param("minter", "address", false), param("mintAmount", "uint256", false)],
            save_name: Some("mints".to_string()),
            is_lending: true,
        }
    }

    fn liquidate_descriptor() -> EventDescriptor {
        EventDescriptor {
            name: "LiquidateBorrow".to_string(),
            inputs: vec![
                param("liquidator", "address", false),
                param("borrower", "address", false),
                param("repayAmount", "uint256", false),
            ],
            save_name: None,
            is_lending: true,
        }
    }

    fn words(values: &[B256]) -> Vec<u8> {
        values.iter().flat_map(|w| w.as_slice().to_vec()).collect()
    }

    fn events(sink: &MemorySink) -> Vec<Event> {
        sink.items()
            .into_values()
            .filter_map(|item| match item {
                ExportItem::Event(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_lending_event_wallets_and_activity() {
        let provider = Arc::new(MockProvider::new());
        let sink = Arc::new(MemorySink::new());
        let market = Address::repeat_byte(0xcc);
        let minter = Address::repeat_byte(0x0a);
        provider.set_token_balance(market, minter, 70);

        let descriptor = mint_descriptor();
        let data = words(&[minter.into_word(), B256::from(U256::from(40u64))]);
        provider.add_log(log_with(vec![descriptor.topic()], data.clone(), 12, 0));
        provider.add_log(log_with(vec![descriptor.topic()], data, 13, 2));

        let ctx = context(provider.clone(), sink.clone());
        let history = ctx.history.clone();
        let balances = ctx.balances.clone();
        let job = EventJob::new(ctx, Partition { start: 10, end: 14 }, descriptor, vec![]).unwrap();
        run_job(&job).await.unwrap();

        let events = events(&sink);
        assert_eq!(events.len(), 2);
        let first = events.iter().find(|e| e.block_number == 12).unwrap();
        assert_eq!(first.save_name.as_deref(), Some("mints"));
        assert_eq!(first.params["mintAmount"], "40");
        assert_eq!(first.wallets.len(), 1);
        assert_eq!(first.wallets[0].address, normalize_address(&minter));
        assert_eq!(first.wallets[0].token_address, normalize_address(&market));
        assert_eq!(first.wallets[0].balance, "70");
        // Two direct reads per event, nothing cached
        assert_eq!(provider.balance_reads(), 4);

        let key = HistoryKey {
            wallet_address: normalize_address(&minter),
            activity_type: "Mint".to_string(),
            contract_address: normalize_address(&market),
        };
        assert_eq!(history.current_total(&key), Some(U256::from(80u64)));
        let second = events.iter().find(|e| e.block_number == 13).unwrap();
        assert_eq!(second.activities[0].entry.running_total, U256::from(80u64));

        // Direct reads leave the transfer ledger alone
        let (cached, _) = balances
            .get_or_fetch(minter, Asset::Token(market), 14, |_, _, _| async { Err(ChainError::Timeout) })
            .await;
        assert_eq!(cached, None);
    }

    #[tokio::test]
    async fn test_lending_read_does_not_rewind_transfer_balances() {
        let provider = Arc::new(MockProvider::new());
        let sink = Arc::new(MemorySink::new());
        let market = Address::repeat_byte(0xcc);
        let minter = Address::repeat_byte(0x0a);
        let other = Address::repeat_byte(0x0b);
        provider.set_token_balance(market, minter, 70);
        provider.set_token_balance(market, other, 1_000);

        let descriptor = mint_descriptor();
        let data = words(&[minter.into_word(), B256::from(U256::from(40u64))]);
        provider.add_log(log_with(vec![descriptor.topic()], data, 12, 0));
        provider.add_log(transfer_log(market, other, minter, 100, 14, 1));
        provider.add_log(transfer_log(market, minter, other, 10, 16, 1));

        // Same job order as the streaming loop, one partition after another
        let ctx = context(provider, sink.clone());
        let first = Partition { start: 11, end: 15 };
        run_job(&TokenTransferJob::new(ctx.clone(), first, vec![]).unwrap()).await.unwrap();
        run_job(&EventsJob::new(ctx.clone(), first, vec![descriptor], vec![], 1).unwrap())
            .await
            .unwrap();
        let second = Partition { start: 16, end: 20 };
        run_job(&TokenTransferJob::new(ctx, second, vec![]).unwrap()).await.unwrap();

        let transfers: Vec<TokenTransfer> = sink
            .items()
            .into_values()
            .filter_map(|item| match item {
                ExportItem::TokenTransfer(t) => Some(t),
                _ => None,
            })
            .collect();
        let minter_record = |block: u64| {
            let transfer = transfers.iter().find(|t| t.block_number == block).unwrap();
            let record = transfer
                .wallets
                .iter()
                .find(|w| w.address == normalize_address(&minter))
                .unwrap();
            (record.pre_balance.clone(), record.balance.clone())
        };
        assert_eq!(minter_record(14), ("70".to_string(), "170".to_string()));
        assert_eq!(minter_record(16), ("170".to_string(), "160".to_string()));

        let mint = events(&sink).into_iter().find(|e| e.block_number == 12).unwrap();
        assert_eq!(mint.wallets[0].balance, "70");
    }

    #[tokio::test]
    async fn test_liquidation_has_two_legs() {
        let provider = Arc::new(MockProvider::new());
        let sink = Arc::new(MemorySink::new());
        let liquidator = Address::repeat_byte(0x01);
        let borrower = Address::repeat_byte(0x02);

        let descriptor = liquidate_descriptor();
        let data = words(&[liquidator.into_word(), borrower.into_word(), B256::from(U256::from(900u64))]);
        provider.add_log(log_with(vec![descriptor.topic()], data, 30, 4));

        let job = EventJob::new(context(provider, sink.clone()), Partition { start: 30, end: 30 }, descriptor, vec![])
            .unwrap();
        run_job(&job).await.unwrap();

        let events = events(&sink);
        let mut legs: Vec<(String, String, U256)> = events[0]
            .activities
            .iter()
            .map(|a| (a.wallet_address.clone(), a.entry.activity_type.clone(), a.entry.amount))
            .collect();
        legs.sort();
        assert_eq!(
            legs,
            vec![
                (normalize_address(&liquidator), "LiquidateBorrow-liquidator".to_string(), U256::from(900u64)),
                (normalize_address(&borrower), "LiquidateBorrow-borrower".to_string(), U256::from(1u64)),
            ]
        );
        assert_eq!(events[0].wallets.len(), 2);
    }

    #[tokio::test]
    async fn test_plain_event_has_no_wallets() {
        let provider = Arc::new(MockProvider::new());
        let sink = Arc::new(MemorySink::new());
        let descriptor = EventDescriptor {
            name: "Approval".to_string(),
            inputs: vec![
                param("owner", "address", true),
                param("spender", "address", true),
                param("value", "uint256", false),
            ],
            save_name: None,
            is_lending: false,
        };
        provider.add_log(log_with(
            vec![descriptor.topic(), Address::repeat_byte(1).into_word(), Address::repeat_byte(2).into_word()],
            U256::from(5u64).to_be_bytes::<32>().to_vec(),
            7,
            0,
        ));

        let job = EventsJob::new(
            context(provider.clone(), sink.clone()),
            Partition { start: 1, end: 9 },
            vec![descriptor, mint_descriptor()],
            vec![],
            2,
        )
        .unwrap();
        run_job(&job).await.unwrap();

        let events = events(&sink);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "Approval");
        assert!(events[0].wallets.is_empty());
        assert!(events[0].activities.is_empty());
        assert_eq!(provider.balance_reads(), 0);
    }

    #[tokio::test]
    async fn test_events_job_fails_when_a_subscription_fails() {
        let provider = Arc::new(MockProvider::new());
        provider.fail_next_get_logs(1);
        let job = EventsJob::new(
            context(provider, Arc::new(MemorySink::new())),
            Partition { start: 1, end: 1 },
            vec![mint_descriptor()],
            vec![],
            1,
        )
        .unwrap();
        assert!(run_job(&job).await.is_err());
    }
}
