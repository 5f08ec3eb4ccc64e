use alloy::primitives::Address;
use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    pub rpc_requests_per_second: u32,
    pub rpc_timeout: Duration,
    pub start_block: Option<u64>,
    pub end_block: Option<u64>,
    pub batch_size: usize,
    pub max_workers: usize,
    pub event_subscription_workers: usize,
    pub lag: u64,
    pub period_seconds: u64,
    pub block_batch_size: u64,
    pub partition_size: u64,
    pub event_abi_dir: PathBuf,
    pub tokens_filter_file: Option<PathBuf>,
    pub balance_cache_ttl: Duration,
    pub checkpoint_file: PathBuf,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub output: Option<PathBuf>,
    pub retry_errors: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            rpc_url: env::var("RPC_URL")
                .context("RPC_URL must be set")?,
            rpc_requests_per_second: env::var("RPC_REQUESTS_PER_SECOND")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .context("Invalid RPC_REQUESTS_PER_SECOND")?,
            rpc_timeout: Duration::from_secs(
                env::var("RPC_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .context("Invalid RPC_TIMEOUT_SECS")?,
            ),
            start_block: env::var("START_BLOCK")
                .ok()
                .map(|v| v.parse())
                .transpose()
                .context("Invalid START_BLOCK")?,
            end_block: env::var("END_BLOCK")
                .ok()
                .map(|v| v.parse())
                .transpose()
                .context("Invalid END_BLOCK")?,
            batch_size: env::var("BATCH_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .context("Invalid BATCH_SIZE")?,
            max_workers: env::var("MAX_WORKERS")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .context("Invalid MAX_WORKERS")?,
            event_subscription_workers: env::var("EVENT_SUBSCRIPTION_WORKERS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("Invalid EVENT_SUBSCRIPTION_WORKERS")?,
            lag: env::var("LAG")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("Invalid LAG")?,
            period_seconds: env::var("PERIOD_SECONDS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid PERIOD_SECONDS")?,
            block_batch_size: env::var("BLOCK_BATCH_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .context("Invalid BLOCK_BATCH_SIZE")?,
            partition_size: env::var("PARTITION_SIZE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .context("Invalid PARTITION_SIZE")?,
            event_abi_dir: env::var("EVENT_ABI_DIR")
                .unwrap_or_else(|_| "artifacts/event-abi".to_string())
                .into(),
            tokens_filter_file: env::var("TOKENS_FILTER_FILE").ok().map(PathBuf::from),
            balance_cache_ttl: Duration::from_secs(
                env::var("BALANCE_CACHE_TTL_SECS")
                    .unwrap_or_else(|_| "86400".to_string())
                    .parse()
                    .context("Invalid BALANCE_CACHE_TTL_SECS")?,
            ),
            checkpoint_file: env::var("CHECKPOINT_FILE")
                .unwrap_or_else(|_| "last_synced_block.txt".to_string())
                .into(),
            database_url: env::var("DATABASE_URL").ok(),
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid DB_MAX_CONNECTIONS")?,
            output: env::var("OUTPUT").ok().map(PathBuf::from),
            retry_errors: env::var("RETRY_ERRORS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("Invalid RETRY_ERRORS")?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that can never produce a valid run.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("BATCH_SIZE must be greater than 0");
        }
        if self.max_workers == 0 || self.event_subscription_workers == 0 {
            bail!("MAX_WORKERS and EVENT_SUBSCRIPTION_WORKERS must be greater than 0");
        }
        if self.partition_size == 0 || self.block_batch_size == 0 {
            bail!("PARTITION_SIZE and BLOCK_BATCH_SIZE must be greater than 0");
        }
        if let (Some(start), Some(end)) = (self.start_block, self.end_block) {
            strata_common::error::validate_range(start, end)?;
        }
        Ok(())
    }
}

/// Token contracts to restrict log scans to, one address per line.
/// Blank lines and `#` comments are skipped.
pub fn load_tokens(path: &Path) -> Result<Vec<Address>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read tokens filter file {}", path.display()))?;

    let mut tokens = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let token = Address::from_str(line)
            .with_context(|| format!("Invalid token address on line {} of {}", line_no + 1, path.display()))?;
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    Ok(tokens)
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        rpc_url: "http://localhost:8545".to_string(),
        rpc_requests_per_second: 100,
        rpc_timeout: Duration::from_secs(5),
        start_block: None,
        end_block: None,
        batch_size: 2,
        max_workers: 4,
        event_subscription_workers: 1,
        lag: 0,
        period_seconds: 1,
        block_batch_size: 100,
        partition_size: 5,
        event_abi_dir: "artifacts/event-abi".into(),
        tokens_filter_file: None,
        balance_cache_ttl: Duration::from_secs(60),
        checkpoint_file: "last_synced_block.txt".into(),
        database_url: None,
        db_max_connections: 1,
        output: None,
        retry_errors: true,
    }
}
