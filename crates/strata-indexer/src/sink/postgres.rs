use anyhow::Result;
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use std::str::FromStr;
use strata_common::{
    Block, Event, ExportItem, TokenTransfer, Transaction, WalletActivity, WalletBalanceRecord,
};

use super::ItemSink;

/// Upserts records into Postgres. Every statement is keyed on the record's
/// identity, so re-exporting a partition rewrites rows instead of
/// duplicating them.
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decimal(value: &str) -> Result<BigDecimal> {
    Ok(BigDecimal::from_str(value)?)
}

#[async_trait]
impl ItemSink for PostgresSink {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn export_item(&self, item: ExportItem) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_item(&mut conn, &item).await
    }

    async fn export_items(&self, items: Vec<ExportItem>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for item in &items {
            write_item(&mut tx, item).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

async fn write_item(conn: &mut PgConnection, item: &ExportItem) -> Result<()> {
    match item {
        ExportItem::Block(block) => insert_block(conn, block).await,
        ExportItem::Transaction(tx) => {
            insert_transaction(conn, tx).await?;
            for wallet in &tx.wallets {
                insert_wallet_balance(conn, wallet, &tx.hash).await?;
            }
            Ok(())
        }
        ExportItem::TokenTransfer(transfer) => {
            insert_token_transfer(conn, transfer).await?;
            for wallet in &transfer.wallets {
                insert_wallet_balance(conn, wallet, &transfer.transaction_hash).await?;
            }
            for activity in &transfer.activities {
                insert_wallet_activity(conn, activity).await?;
            }
            Ok(())
        }
        ExportItem::Event(event) => {
            insert_event(conn, event).await?;
            for wallet in &event.wallets {
                insert_wallet_balance(conn, wallet, &event.transaction_hash).await?;
            }
            for activity in &event.activities {
                insert_wallet_activity(conn, activity).await?;
            }
            Ok(())
        }
    }
}

async fn insert_block(conn: &mut PgConnection, block: &Block) -> Result<()> {
    sqlx::query(
        "INSERT INTO blocks (number, hash, parent_hash, timestamp, gas_limit, gas_used, transaction_count, indexed_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
         ON CONFLICT (number) DO UPDATE SET
            hash = $2, parent_hash = $3, timestamp = $4, gas_limit = $5, gas_used = $6,
            transaction_count = $7, indexed_at = NOW()"
    )
    .bind(block.number as i64)
    .bind(&block.hash)
    .bind(&block.parent_hash)
    .bind(block.timestamp as i64)
    .bind(decimal(&block.gas_limit)?)
    .bind(decimal(&block.gas_used)?)
    .bind(block.transaction_count as i32)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_transaction(conn: &mut PgConnection, tx: &Transaction) -> Result<()> {
    sqlx::query(
        "INSERT INTO transactions (hash, block_number, transaction_index, from_address, to_address, value, gas, gas_price, input)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT (hash) DO NOTHING"
    )
    .bind(&tx.hash)
    .bind(tx.block_number as i64)
    .bind(tx.transaction_index as i64)
    .bind(&tx.from_address)
    .bind(&tx.to_address)
    .bind(decimal(&tx.value)?)
    .bind(decimal(&tx.gas)?)
    .bind(decimal(&tx.gas_price)?)
    .bind(&tx.input)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_token_transfer(conn: &mut PgConnection, transfer: &TokenTransfer) -> Result<()> {
    sqlx::query(
        "INSERT INTO token_transfers (transaction_hash, log_index, contract_address, from_address, to_address, value, block_number)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (transaction_hash, log_index) DO NOTHING"
    )
    .bind(&transfer.transaction_hash)
    .bind(transfer.log_index as i64)
    .bind(&transfer.contract_address)
    .bind(&transfer.from_address)
    .bind(&transfer.to_address)
    .bind(decimal(&transfer.value)?)
    .bind(transfer.block_number as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_event(conn: &mut PgConnection, event: &Event) -> Result<()> {
    let record_name = event.save_name.as_deref().unwrap_or(&event.event_type);
    sqlx::query(
        "INSERT INTO events (transaction_hash, log_index, contract_address, block_number, event_type, record_name, params)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (transaction_hash, log_index) DO UPDATE SET
            event_type = $5, record_name = $6, params = $7"
    )
    .bind(&event.transaction_hash)
    .bind(event.log_index as i64)
    .bind(&event.contract_address)
    .bind(event.block_number as i64)
    .bind(&event.event_type)
    .bind(record_name)
    .bind(Json(&event.params))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_wallet_balance(
    conn: &mut PgConnection,
    record: &WalletBalanceRecord,
    transaction_hash: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO wallet_balances (address, token_address, transaction_hash, balance, pre_balance, at_block)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (address, token_address, transaction_hash) DO UPDATE SET
            balance = $4, pre_balance = $5, at_block = $6"
    )
    .bind(&record.address)
    .bind(&record.token_address)
    .bind(transaction_hash)
    .bind(decimal(&record.balance)?)
    .bind(decimal(&record.pre_balance)?)
    .bind(record.at_block as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_wallet_activity(conn: &mut PgConnection, activity: &WalletActivity) -> Result<()> {
    let entry = &activity.entry;
    sqlx::query(
        "INSERT INTO wallet_activities (wallet_address, activity_type, contract_address, event_id, amount, running_total, block_number, transaction_hash)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (wallet_address, activity_type, contract_address, event_id) DO NOTHING"
    )
    .bind(&activity.wallet_address)
    .bind(&entry.activity_type)
    .bind(&entry.contract_address)
    .bind(&entry.event_id)
    .bind(decimal(&entry.amount.to_string())?)
    .bind(decimal(&entry.running_total.to_string())?)
    .bind(entry.block_number as i64)
    .bind(&entry.transaction_hash)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
