mod json;
mod memory;
mod postgres;

pub use json::JsonLinesSink;
pub use memory::MemorySink;
pub use postgres::PostgresSink;

use anyhow::Result;
use async_trait::async_trait;
use strata_common::ExportItem;

/// Destination for extracted records.
///
/// Exports must be idempotent: a partition that failed halfway is exported
/// again from the start, so writing an item twice has to leave the same
/// state as writing it once.
#[async_trait]
pub trait ItemSink: Send + Sync {
    async fn open(&self) -> Result<()>;

    async fn export_item(&self, item: ExportItem) -> Result<()>;

    async fn export_items(&self, items: Vec<ExportItem>) -> Result<()> {
        for item in items {
            self.export_item(item).await?;
        }
        Ok(())
    }

    /// Flush buffered output.
    async fn close(&self) -> Result<()>;
}
