use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use strata_common::{ExportItem, ItemKey};

use super::ItemSink;

/// Keyed in-memory store; a re-exported item replaces the earlier copy.
#[derive(Default)]
pub struct MemorySink {
    items: Mutex<BTreeMap<ItemKey, ExportItem>>,
    exports: Mutex<usize>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> BTreeMap<ItemKey, ExportItem> {
        self.lock_items().clone()
    }

    pub fn get(&self, key: &ItemKey) -> Option<ExportItem> {
        self.lock_items().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `export_item` calls, duplicates included
    pub fn export_count(&self) -> usize {
        *self.exports.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_items(&self) -> std::sync::MutexGuard<'_, BTreeMap<ItemKey, ExportItem>> {
        self.items.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl ItemSink for MemorySink {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn export_item(&self, item: ExportItem) -> Result<()> {
        self.lock_items().insert(item.key(), item);
        *self.exports.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
