use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use strata_common::error::validate_range;
use strata_common::{ExportItem, StrataError};

use super::{transfer_balance_records, ExtractionJob, JobContext};
use crate::balance_cache::Asset;
use crate::executor::BatchWorkExecutor;
use crate::partition::Partition;
use crate::sink::ItemSink;

/// Exports blocks and their transactions. Plain value transfers also carry
/// native balance records for sender and recipient.
pub struct BlockJob {
    ctx: JobContext,
    partition: Partition,
    export_blocks: bool,
    export_transactions: bool,
}

impl BlockJob {
    pub fn new(
        ctx: JobContext,
        partition: Partition,
        export_blocks: bool,
        export_transactions: bool,
    ) -> Result<Self, StrataError> {
        validate_range(partition.start, partition.end)?;
        if !export_blocks && !export_transactions {
            return Err(StrataError::InvalidInput(
                "at least one of export_blocks or export_transactions must be set".to_string(),
            ));
        }
        Ok(Self { ctx, partition, export_blocks, export_transactions })
    }
}

async fn export_batch(
    ctx: JobContext,
    block_numbers: Vec<u64>,
    export_blocks: bool,
    export_transactions: bool,
) -> Result<()> {
    let blocks = ctx.provider.fetch_blocks(&block_numbers, export_transactions).await?;
    if blocks.len() != block_numbers.len() {
        bail!("requested {} blocks, node returned {}", block_numbers.len(), blocks.len());
    }

    let mut items = Vec::new();
    for block in &blocks {
        let record = block.to_record();
        let number = record.number;
        if export_blocks {
            items.push(ExportItem::Block(record));
        }
        if !export_transactions {
            continue;
        }

        for tx in block.transactions.full() {
            let mut transaction = tx.to_record();
            if let (true, Some(to)) = (tx.is_value_transfer(), tx.to) {
                transaction.wallets =
                    transfer_balance_records(&ctx, Asset::Native, tx.from, to, tx.value, number).await;
            }
            items.push(ExportItem::Transaction(transaction));
        }
    }

    ctx.sink.export_items(items).await
}

#[async_trait]
impl ExtractionJob for BlockJob {
    fn name(&self) -> String {
        format!("blocks {}", self.partition)
    }

    fn sink(&self) -> &Arc<dyn ItemSink> {
        &self.ctx.sink
    }

    async fn export(&self) -> Result<()> {
        let executor = BatchWorkExecutor::new(self.ctx.batch_size, self.ctx.max_workers);
        let ctx = self.ctx.clone();
        let (export_blocks, export_transactions) = (self.export_blocks, self.export_transactions);

        executor
            .execute(
                self.partition.blocks().collect(),
                move |batch| export_batch(ctx.clone(), batch, export_blocks, export_transactions),
                Some(self.partition.len() as usize),
            )
            .await?;
        executor.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::run_job;
    use crate::jobs::testing::context;
    use crate::sink::MemorySink;
    use crate::test_utils::{value_transfer, MockProvider};
    use alloy::primitives::Address;
    use strata_common::{normalize_hash, ItemKey};

    #[tokio::test]
    async fn test_value_transfer_balances() {
        let provider = Arc::new(MockProvider::new());
        let sink = Arc::new(MemorySink::new());
        let a = Address::repeat_byte(0xaa);
        let b = Address::repeat_byte(0xbb);
        provider.set_native_balance(a, 500);
        provider.add_block(10, vec![value_transfer(0x01, 10, 0, a, b, 100)]);

        let job = BlockJob::new(context(provider, sink.clone()), Partition { start: 10, end: 10 }, true, true).unwrap();
        run_job(&job).await.unwrap();

        assert!(sink.get(&ItemKey::Block(10)).is_some());
        let item = sink
            .get(&ItemKey::Transaction(normalize_hash(&alloy::primitives::B256::repeat_byte(0x01))))
            .unwrap();
        let ExportItem::Transaction(tx) = item else {
            panic!("expected a transaction");
        };
        assert_eq!(tx.wallets.len(), 2);
        let sender = &tx.wallets[0];
        assert_eq!(sender.address, format!("0x{}", "aa".repeat(20)));
        assert_eq!((sender.pre_balance.as_str(), sender.balance.as_str()), ("500", "400"));
        let receiver = &tx.wallets[1];
        assert_eq!(receiver.address, format!("0x{}", "bb".repeat(20)));
        assert_eq!((receiver.pre_balance.as_str(), receiver.balance.as_str()), ("0", "100"));
        assert!(tx.wallets.iter().all(|w| w.at_block == 10 && w.token_address == "0x"));
    }

    #[tokio::test]
    async fn test_blocks_only() {
        let provider = Arc::new(MockProvider::new());
        let sink = Arc::new(MemorySink::new());
        let a = Address::repeat_byte(0xaa);
        provider.add_empty_blocks(1, 4);
        provider.add_block(5, vec![value_transfer(0x02, 5, 0, a, a, 1)]);

        let job = BlockJob::new(context(provider.clone(), sink.clone()), Partition { start: 1, end: 5 }, true, false).unwrap();
        run_job(&job).await.unwrap();

        assert_eq!(sink.len(), 5);
        assert_eq!(provider.balance_reads(), 0);
        let Some(ExportItem::Block(block)) = sink.get(&ItemKey::Block(5)) else {
            panic!("expected block 5");
        };
        assert_eq!(block.transaction_count, 1);
    }

    #[tokio::test]
    async fn test_missing_block_fails_job() {
        let provider = Arc::new(MockProvider::new());
        provider.add_empty_blocks(1, 3);
        let job = BlockJob::new(
            context(provider, Arc::new(MemorySink::new())),
            Partition { start: 1, end: 4 },
            true,
            true,
        )
        .unwrap();
        assert!(run_job(&job).await.is_err());
    }

    #[test]
    fn test_rejects_nothing_to_export() {
        let ctx = context(Arc::new(MockProvider::new()), Arc::new(MemorySink::new()));
        assert!(BlockJob::new(ctx.clone(), Partition { start: 1, end: 1 }, false, false).is_err());
        assert!(BlockJob::new(ctx, Partition { start: 2, end: 1 }, true, false).is_err());
    }
}
