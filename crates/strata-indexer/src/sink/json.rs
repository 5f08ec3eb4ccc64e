use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use strata_common::ExportItem;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use super::ItemSink;

type Writer = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Writes one JSON object per line to a file (appending) or stdout.
pub struct JsonLinesSink {
    path: Option<PathBuf>,
    writer: Mutex<Option<Writer>>,
}

impl JsonLinesSink {
    pub fn stdout() -> Self {
        Self { path: None, writer: Mutex::new(None) }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self { path: Some(path.into()), writer: Mutex::new(None) }
    }

    async fn create_writer(&self) -> Result<Writer> {
        let inner: Box<dyn AsyncWrite + Send + Unpin> = match &self.path {
            Some(path) => Box::new(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?,
            ),
            None => Box::new(tokio::io::stdout()),
        };
        Ok(BufWriter::new(inner))
    }
}

#[async_trait]
impl ItemSink for JsonLinesSink {
    async fn open(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.is_none() {
            *writer = Some(self.create_writer().await?);
        }
        Ok(())
    }

    async fn export_item(&self, item: ExportItem) -> Result<()> {
        let mut line = serde_json::to_vec(&item)?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            *guard = Some(self.create_writer().await?);
        }
        if let Some(writer) = guard.as_mut() {
            writer.write_all(&line).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.flush().await?;
        }
        Ok(())
    }
}
