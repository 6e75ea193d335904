use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};

use super::{to_i64, to_u64, StoreError};
use crate::models::{Side, TradeRecord};

#[derive(Debug, FromRow)]
struct TradeRow {
    tx_hash: String,
    log_index: i64,
    block_number: i64,
    maker_address: String,
    taker_address: String,
    market_id: String,
    outcome_index: Option<i32>,
    shares: i64,
    price: Decimal,
    side: String,
    traded_at: DateTime<Utc>,
}

impl TryFrom<TradeRow> for TradeRecord {
    type Error = StoreError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        let side = Side::from_api_str(&row.side)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown side {}", row.side)))?;
        let outcome_index = row
            .outcome_index
            .map(|i| u32::try_from(i).map_err(|_| StoreError::Corrupt(format!("outcome index {i}"))))
            .transpose()?;

        Ok(TradeRecord {
            block_number: to_u64(row.block_number, "block_number")?,
            log_index: to_u64(row.log_index, "log_index")?,
            shares: to_u64(row.shares, "shares")?,
            tx_hash: row.tx_hash,
            maker_address: row.maker_address,
            taker_address: row.taker_address,
            market_id: row.market_id,
            outcome_index,
            price: row.price,
            side,
            timestamp: row.traded_at,
        })
    }
}

/// Insert decoded trades in one transaction, skipping ones already journaled.
pub async fn insert_trades(pool: &PgPool, records: &[TradeRecord]) -> Result<u64, StoreError> {
    if records.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    let mut inserted = 0;

    for record in records {
        let outcome_index = record
            .outcome_index
            .map(|i| i32::try_from(i).map_err(|_| StoreError::Corrupt(format!("outcome index {i}"))))
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO trade_records
                (tx_hash, log_index, block_number, maker_address, taker_address,
                 market_id, outcome_index, shares, price, side, traded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (tx_hash, log_index) DO NOTHING
            "#,
        )
        .bind(&record.tx_hash)
        .bind(to_i64(record.log_index, "log_index")?)
        .bind(to_i64(record.block_number, "block_number")?)
        .bind(&record.maker_address)
        .bind(&record.taker_address)
        .bind(&record.market_id)
        .bind(outcome_index)
        .bind(to_i64(record.shares, "shares")?)
        .bind(record.price)
        .bind(record.side.to_string())
        .bind(record.timestamp)
        .execute(&mut *tx)
        .await?;

        inserted += result.rows_affected();
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Trades at or after `since`, in chain order.
pub async fn get_trades_since(
    pool: &PgPool,
    since: DateTime<Utc>,
) -> Result<Vec<TradeRecord>, StoreError> {
    let rows = sqlx::query_as::<_, TradeRow>(
        r#"
        SELECT tx_hash, log_index, block_number, maker_address, taker_address,
               market_id, outcome_index, shares, price, side, traded_at
        FROM trade_records
        WHERE traded_at >= $1
        ORDER BY block_number, log_index
        "#,
    )
    .bind(since)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(TradeRecord::try_from).collect()
}
