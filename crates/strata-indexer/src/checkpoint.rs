use async_trait::async_trait;
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Mutex;
use strata_common::StrataError;

const LAST_SYNCED_KEY: &str = "last_synced_block";

/// Durable "last fully processed block" marker
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<Option<u64>, StrataError>;

    async fn save(&self, block: u64) -> Result<(), StrataError>;
}

/// Plain-text file holding the block number
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> Result<Option<u64>, StrataError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StrataError::Checkpoint(format!(
                    "Cannot read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed.parse().map(Some).map_err(|e| {
            StrataError::Checkpoint(format!("Invalid block number in {}: {}", self.path.display(), e))
        })
    }

    /// Write to a sibling temp file and rename over the old one.
    async fn save(&self, block: u64) -> Result<(), StrataError> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, block.to_string())
            .await
            .map_err(|e| StrataError::Checkpoint(format!("Cannot write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StrataError::Checkpoint(format!("Cannot replace {}: {}", self.path.display(), e)))
    }
}

/// Row in the `indexer_state` key/value table
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn load(&self) -> Result<Option<u64>, StrataError> {
        let result: Option<(String,)> = sqlx::query_as("SELECT value FROM indexer_state WHERE key = $1")
            .bind(LAST_SYNCED_KEY)
            .fetch_optional(&self.pool)
            .await?;

        result
            .map(|(value,)| {
                value
                    .parse()
                    .map_err(|e| StrataError::Checkpoint(format!("Invalid {} value {:?}: {}", LAST_SYNCED_KEY, value, e)))
            })
            .transpose()
    }

    async fn save(&self, block: u64) -> Result<(), StrataError> {
        sqlx::query(
            "INSERT INTO indexer_state (key, value, updated_at)
             VALUES ($1, $2, NOW())
             ON CONFLICT (key) DO UPDATE SET value = $2, updated_at = NOW()"
        )
        .bind(LAST_SYNCED_KEY)
        .bind(block.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    block: Mutex<Option<u64>>,
}

impl MemoryCheckpointStore {
    pub fn new(block: Option<u64>) -> Self {
        Self { block: Mutex::new(block) }
    }

    pub fn get(&self) -> Option<u64> {
        *self.block.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> Result<Option<u64>, StrataError> {
        Ok(self.get())
    }

    async fn save(&self, block: u64) -> Result<(), StrataError> {
        *self.block.lock().unwrap_or_else(|p| p.into_inner()) = Some(block);
        Ok(())
    }
}
