use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod accumulate;
mod balance_cache;
mod checkpoint;
mod config;
mod decoder;
mod executor;
mod jobs;
mod partition;
mod provider;
mod sink;
mod streamer;
#[cfg(test)]
mod test_utils;

use accumulate::AccumulateHistoryMerger;
use balance_cache::BalanceStateCache;
use checkpoint::{CheckpointStore, FileCheckpointStore, PostgresCheckpointStore};
use jobs::JobContext;
use provider::{ChainProvider, RpcProvider};
use sink::{ItemSink, JsonLinesSink, PostgresSink};
use streamer::StreamingLoop;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    tracing::info!("Starting Strata Indexer");
    let config = config::Config::from_env()?;

    let provider: Arc<dyn ChainProvider> = Arc::new(RpcProvider::new(&config)?);

    let descriptors = decoder::load_descriptors(&config.event_abi_dir)?;
    tracing::info!("Subscribed to {} events", descriptors.len());

    let tokens = match &config.tokens_filter_file {
        Some(path) => {
            let tokens = config::load_tokens(path)?;
            tracing::info!("Restricting log scans to {} token contracts", tokens.len());
            tokens
        }
        None => Vec::new(),
    };

    let (sink, checkpoints): (Arc<dyn ItemSink>, Arc<dyn CheckpointStore>) = match &config.database_url {
        Some(url) => {
            let pool = strata_common::db::create_pool(url, config.db_max_connections).await?;
            tracing::info!("Running database migrations");
            strata_common::db::run_migrations(&pool).await?;
            (
                Arc::new(PostgresSink::new(pool.clone())),
                Arc::new(PostgresCheckpointStore::new(pool)),
            )
        }
        None => {
            let sink = match &config.output {
                Some(path) => JsonLinesSink::file(path.clone()),
                None => JsonLinesSink::stdout(),
            };
            (
                Arc::new(sink),
                Arc::new(FileCheckpointStore::new(config.checkpoint_file.clone())),
            )
        }
    };

    let ctx = JobContext {
        provider,
        sink,
        balances: Arc::new(BalanceStateCache::new(config.balance_cache_ttl)),
        history: Arc::new(AccumulateHistoryMerger::new()),
        batch_size: config.batch_size,
        max_workers: config.max_workers,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl-C, finishing the current partition");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                tracing::error!("Cannot listen for Ctrl-C: {}", e);
                shutdown_tx.closed().await;
            }
        }
    });

    StreamingLoop::new(&config, ctx, checkpoints, descriptors, tokens, shutdown_rx)
        .run()
        .await?;

    tracing::info!("Strata Indexer stopped");
    Ok(())
}

/// Logs go to stderr so stdout stays clean for the JSON-lines sink.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "strata_indexer=info,sqlx=warn".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
