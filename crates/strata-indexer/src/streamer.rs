use alloy::primitives::Address;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use strata_common::StrataError;
use tokio::sync::watch;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::decoder::EventDescriptor;
use crate::jobs::{run_job, BlockJob, EventsJob, JobContext, TokenTransferJob};
use crate::partition::{partition_range, Partition};

/// Outcome of one poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cycle {
    /// Synced up to and including this block
    Synced(u64),
    /// Head has not moved past the last synced block
    Idle,
    /// Shutdown was requested between partitions
    Interrupted,
}

/// Follows the chain head, exporting every block range one partition at a
/// time and persisting the checkpoint after each partition.
pub struct StreamingLoop {
    ctx: JobContext,
    checkpoints: Arc<dyn CheckpointStore>,
    descriptors: Vec<EventDescriptor>,
    tokens: Vec<Address>,
    shutdown: watch::Receiver<bool>,
    start_block: Option<u64>,
    end_block: Option<u64>,
    lag: u64,
    period: Duration,
    block_batch_size: u64,
    partition_size: u64,
    event_subscription_workers: usize,
    retry_errors: bool,
}

impl StreamingLoop {
    pub fn new(
        config: &Config,
        ctx: JobContext,
        checkpoints: Arc<dyn CheckpointStore>,
        descriptors: Vec<EventDescriptor>,
        tokens: Vec<Address>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            ctx,
            checkpoints,
            descriptors,
            tokens,
            shutdown,
            start_block: config.start_block,
            end_block: config.end_block,
            lag: config.lag,
            period: Duration::from_secs(config.period_seconds),
            block_batch_size: config.block_batch_size,
            partition_size: config.partition_size,
            event_subscription_workers: config.event_subscription_workers,
            retry_errors: config.retry_errors,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut next_block = self.resolve_start_block().await?;
        tracing::info!("Streaming from block {}", next_block);

        loop {
            if self.shutdown_requested() {
                tracing::info!("Shutdown requested, next block would have been {}", next_block);
                return Ok(());
            }
            if let Some(end) = self.end_block {
                if next_block > end {
                    tracing::info!("Reached end block {}", end);
                    return Ok(());
                }
            }

            match self.sync_cycle(next_block).await {
                Ok(Cycle::Synced(last)) => next_block = last + 1,
                Ok(Cycle::Interrupted) => continue,
                Ok(Cycle::Idle) => {
                    tracing::debug!("Nothing to sync, next block {}", next_block);
                    self.pause().await;
                }
                Err(e) => {
                    if !self.retry_errors || is_fatal(&e) {
                        return Err(e);
                    }
                    tracing::error!(
                        "Sync from block {} failed: {:#}. Retrying in {}s",
                        next_block,
                        e,
                        self.period.as_secs()
                    );
                    // Partitions that finished before the failure are already checkpointed
                    match self.checkpoints.load().await {
                        Ok(Some(saved)) => next_block = next_block.max(saved + 1),
                        Ok(None) => {}
                        Err(e) => tracing::warn!("Failed to reload checkpoint: {}", e),
                    }
                    self.pause().await;
                }
            }
        }
    }

    /// Stored checkpoint + 1, else `START_BLOCK`, else the current safe head.
    async fn resolve_start_block(&self) -> Result<u64> {
        let saved = self
            .checkpoints
            .load()
            .await
            .context("Failed to load checkpoint")?;

        match (saved, self.start_block) {
            (Some(last), start) => {
                let resume = last.saturating_add(1);
                if let Some(start) = start.filter(|s| *s != resume) {
                    tracing::warn!(
                        "START_BLOCK {} ignored, resuming after checkpoint {}",
                        start,
                        last
                    );
                }
                Ok(resume)
            }
            (None, Some(start)) => Ok(start),
            (None, None) => {
                let head = self.ctx.provider.get_chain_head().await?;
                Ok(head.saturating_sub(self.lag))
            }
        }
    }

    async fn sync_cycle(&self, next_block: u64) -> Result<Cycle> {
        let head = self.ctx.provider.get_chain_head().await?;
        let Some(safe_head) = head.checked_sub(self.lag) else {
            return Ok(Cycle::Idle);
        };

        let mut target = safe_head.min(next_block.saturating_add(self.block_batch_size - 1));
        if let Some(end) = self.end_block {
            target = target.min(end);
        }
        if target < next_block {
            return Ok(Cycle::Idle);
        }

        let partitions = partition_range(next_block, target, self.partition_size)?;
        let mut synced = None;
        for partition in partitions {
            if self.shutdown_requested() {
                break;
            }

            let started = std::time::Instant::now();
            if let Err(e) = self.sync_partition(partition).await {
                // A retry applies the partition's transfers again
                self.ctx.balances.rollback().await;
                return Err(e);
            }
            self.ctx.balances.commit();
            synced = Some(partition.end);

            tracing::info!(
                "Partition {} complete ({} blocks in {:.2}s) | head {}",
                partition,
                partition.len(),
                started.elapsed().as_secs_f64(),
                head
            );
        }

        Ok(synced.map_or(Cycle::Interrupted, Cycle::Synced))
    }

    async fn sync_partition(&self, partition: Partition) -> Result<()> {
        self.export_partition(partition).await?;
        self.checkpoints
            .save(partition.end)
            .await
            .with_context(|| format!("Failed to save checkpoint {}", partition.end))?;
        Ok(())
    }

    async fn export_partition(&self, partition: Partition) -> Result<()> {
        let blocks = BlockJob::new(self.ctx.clone(), partition, true, true)?;
        run_job(&blocks).await?;

        let transfers = TokenTransferJob::new(self.ctx.clone(), partition, self.tokens.clone())?;
        run_job(&transfers).await?;

        let events = EventsJob::new(
            self.ctx.clone(),
            partition,
            self.descriptors.clone(),
            self.tokens.clone(),
            self.event_subscription_workers,
        )?;
        run_job(&events).await?;
        Ok(())
    }

    /// A dropped sender counts as a shutdown request.
    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    async fn pause(&mut self) {
        let period = self.period;
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = self.shutdown.changed() => {}
        }
    }
}

fn is_fatal(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| cause.downcast_ref::<StrataError>().is_some_and(StrataError::is_fatal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::config::test_config;
    use crate::jobs::testing::context;
    use crate::sink::MemorySink;
    use crate::test_utils::{transfer_log, value_transfer, MockProvider};
    use async_trait::async_trait;
    use strata_common::{ExportItem, ItemKey};

    fn streamer(
        config: &Config,
        provider: Arc<MockProvider>,
        sink: Arc<MemorySink>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> (StreamingLoop, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let looper = StreamingLoop::new(config, context(provider, sink), checkpoints, Vec::new(), Vec::new(), rx);
        (looper, tx)
    }

    fn chain(head: u64) -> Arc<MockProvider> {
        let provider = Arc::new(MockProvider::new());
        provider.set_head(head);
        provider.add_empty_blocks(0, head);
        provider
    }

    #[tokio::test]
    async fn test_bounded_backfill() {
        let provider = chain(30);
        let sink = Arc::new(MemorySink::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new(None));
        let mut config = test_config();
        config.start_block = Some(3);
        config.end_block = Some(14);
        config.block_batch_size = 4;

        let (looper, _tx) = streamer(&config, provider, sink.clone(), checkpoints.clone());
        looper.run().await.unwrap();

        assert_eq!(checkpoints.get(), Some(14));
        let blocks: Vec<u64> = sink
            .items()
            .keys()
            .filter_map(|k| match k {
                ItemKey::Block(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(blocks, (3..=14).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_checkpoint_wins_over_start_block() {
        let provider = chain(20);
        let sink = Arc::new(MemorySink::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new(Some(10)));
        let mut config = test_config();
        config.start_block = Some(2);
        config.end_block = Some(12);

        let (looper, _tx) = streamer(&config, provider, sink.clone(), checkpoints.clone());
        looper.run().await.unwrap();

        assert_eq!(checkpoints.get(), Some(12));
        assert_eq!(sink.len(), 2);
        assert!(sink.get(&ItemKey::Block(11)).is_some());
    }

    #[tokio::test]
    async fn test_starts_at_safe_head_without_checkpoint() {
        let provider = chain(100);
        let sink = Arc::new(MemorySink::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new(None));
        let mut config = test_config();
        config.lag = 10;
        config.end_block = Some(90);

        let (looper, _tx) = streamer(&config, provider, sink.clone(), checkpoints.clone());
        looper.run().await.unwrap();

        assert_eq!(checkpoints.get(), Some(90));
        assert_eq!(sink.len(), 1);
        assert!(sink.get(&ItemKey::Block(90)).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_before_start_exports_nothing() {
        let provider = chain(10);
        let sink = Arc::new(MemorySink::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new(None));
        let mut config = test_config();
        config.start_block = Some(0);

        let (looper, tx) = streamer(&config, provider, sink.clone(), checkpoints.clone());
        tx.send(true).unwrap();
        looper.run().await.unwrap();

        assert!(sink.is_empty());
        assert_eq!(checkpoints.get(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_loop_stops_on_shutdown() {
        let provider = chain(5);
        let sink = Arc::new(MemorySink::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new(Some(5)));
        let config = test_config();

        let (looper, tx) = streamer(&config, provider, sink.clone(), checkpoints.clone());
        let handle = tokio::spawn(looper.run());
        tokio::time::sleep(Duration::from_secs(3)).await;
        tx.send(true).unwrap();

        handle.await.unwrap().unwrap();
        assert!(sink.is_empty());
        assert_eq!(checkpoints.get(), Some(5));
    }

    struct BrokenCheckpointStore;

    #[async_trait]
    impl CheckpointStore for BrokenCheckpointStore {
        async fn load(&self) -> Result<Option<u64>, StrataError> {
            Err(StrataError::Checkpoint("disk unreadable".to_string()))
        }

        async fn save(&self, _block: u64) -> Result<(), StrataError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_unreadable_checkpoint_is_fatal() {
        let (looper, _tx) = streamer(
            &test_config(),
            chain(1),
            Arc::new(MemorySink::new()),
            Arc::new(BrokenCheckpointStore),
        );
        assert!(looper.run().await.is_err());
    }

    /// Blocks 1..=10 with one token transfer in each partition of five.
    fn transfer_chain() -> Arc<MockProvider> {
        let provider = chain(10);
        let token = Address::repeat_byte(0xcc);
        for (owner, block) in [(0x01, 3), (0x02, 8)] {
            let from = Address::repeat_byte(owner);
            let to = Address::repeat_byte(owner + 0x10);
            provider.set_token_balance(token, from, 1_000);
            provider.add_log(transfer_log(token, from, to, 250, block, 0));
        }
        provider
    }

    #[tokio::test]
    async fn test_resume_after_crash_matches_uninterrupted_run() {
        let mut config = test_config();
        config.start_block = Some(1);
        config.end_block = Some(10);
        config.block_batch_size = 10;

        let reference = Arc::new(MemorySink::new());
        let (looper, _tx) = streamer(
            &config,
            transfer_chain(),
            reference.clone(),
            Arc::new(MemoryCheckpointStore::new(None)),
        );
        looper.run().await.unwrap();

        // Token transfer scan of the second partition fails, no retry
        let provider = transfer_chain();
        provider.fail_get_logs_at(8);
        let sink = Arc::new(MemorySink::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new(None));
        config.retry_errors = false;
        let (looper, _tx) = streamer(&config, provider.clone(), sink.clone(), checkpoints.clone());
        assert!(looper.run().await.is_err());
        assert_eq!(checkpoints.get(), Some(5));
        assert!(sink.get(&ItemKey::Block(8)).is_some());

        // Restart with fresh in-memory state, as after a process crash
        let (looper, _tx) = streamer(&config, provider, sink.clone(), checkpoints.clone());
        looper.run().await.unwrap();

        assert_eq!(checkpoints.get(), Some(10));
        assert_eq!(sink.items(), reference.items());
        let transfers = sink
            .items()
            .into_values()
            .filter(|item| matches!(item, ExportItem::TokenTransfer(_)))
            .count();
        assert_eq!(transfers, 2);
    }

    /// Blocks 1..=10 with one native transfer a -> b of 100 at block 8.
    fn native_transfer_chain() -> Arc<MockProvider> {
        let provider = chain(10);
        let a = Address::repeat_byte(0xaa);
        let b = Address::repeat_byte(0xbb);
        provider.set_native_balance(a, 500);
        provider.add_block(8, vec![value_transfer(0x08, 8, 0, a, b, 100)]);
        provider
    }

    fn native_records(sink: &MemorySink) -> Vec<(String, String)> {
        sink.items()
            .into_values()
            .filter_map(|item| match item {
                ExportItem::Transaction(tx) => Some(tx),
                _ => None,
            })
            .flat_map(|tx| tx.wallets)
            .map(|w| (w.pre_balance, w.balance))
            .collect()
    }

    #[tokio::test]
    async fn test_in_process_retry_matches_uninterrupted_run() {
        let mut config = test_config();
        config.start_block = Some(1);
        config.end_block = Some(10);
        config.block_batch_size = 10;
        config.period_seconds = 0;

        let reference = Arc::new(MemorySink::new());
        let (looper, _tx) = streamer(
            &config,
            native_transfer_chain(),
            reference.clone(),
            Arc::new(MemoryCheckpointStore::new(None)),
        );
        looper.run().await.unwrap();
        assert_eq!(
            native_records(&reference),
            vec![("500".to_string(), "400".to_string()), ("0".to_string(), "100".to_string())]
        );

        // Blocks of 6..=10 are exported, then the transfer scan fails once
        let provider = native_transfer_chain();
        provider.fail_get_logs_at(8);
        let sink = Arc::new(MemorySink::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new(None));
        assert!(config.retry_errors);
        let (looper, _tx) = streamer(&config, provider, sink.clone(), checkpoints.clone());
        looper.run().await.unwrap();

        assert_eq!(checkpoints.get(), Some(10));
        assert_eq!(native_records(&sink), native_records(&reference));
        assert_eq!(sink.items(), reference.items());
    }
}
