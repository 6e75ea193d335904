use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{to_i64, to_u64, StoreError};
use crate::models::{ReplicationOrder, Side, SubmissionResult, TradeRef};

#[derive(Debug, FromRow)]
struct OrderRow {
    id: Uuid,
    source_tx_hash: String,
    source_log_index: i64,
    source_address: String,
    market_id: String,
    outcome_index: i32,
    side: String,
    size: i64,
    limit_price: Decimal,
    dry_run: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for ReplicationOrder {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let side = Side::from_api_str(&row.side)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown side {}", row.side)))?;
        let outcome_index = u32::try_from(row.outcome_index)
            .map_err(|_| StoreError::Corrupt(format!("outcome index {}", row.outcome_index)))?;

        Ok(ReplicationOrder {
            id: row.id,
            source_trade_ref: TradeRef {
                tx_hash: row.source_tx_hash,
                log_index: to_u64(row.source_log_index, "source_log_index")?,
            },
            source_address: row.source_address,
            market_id: row.market_id,
            outcome_index,
            side,
            size: to_u64(row.size, "size")?,
            limit_price: row.limit_price,
            dry_run: row.dry_run,
            created_at: row.created_at,
        })
    }
}

/// Journal a replication order. Returns false if one already exists for the
/// same source trade and tracked address.
pub async fn insert_order(pool: &PgPool, order: &ReplicationOrder) -> Result<bool, StoreError> {
    let outcome_index = i32::try_from(order.outcome_index)
        .map_err(|_| StoreError::Corrupt(format!("outcome index {}", order.outcome_index)))?;

    let result = sqlx::query(
        r#"
        INSERT INTO replication_orders
            (id, source_tx_hash, source_log_index, source_address, market_id,
             outcome_index, side, size, limit_price, dry_run, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (source_tx_hash, source_log_index, source_address) DO NOTHING
        "#,
    )
    .bind(order.id)
    .bind(&order.source_trade_ref.tx_hash)
    .bind(to_i64(order.source_trade_ref.log_index, "log_index")?)
    .bind(&order.source_address)
    .bind(&order.market_id)
    .bind(outcome_index)
    .bind(order.side.to_string())
    .bind(to_i64(order.size, "size")?)
    .bind(order.limit_price)
    .bind(order.dry_run)
    .bind(order.created_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// The journaled order for a source trade and address, if no submission
/// outcome was ever recorded for it.
pub async fn get_pending_order(
    pool: &PgPool,
    trade_ref: &TradeRef,
    source_address: &str,
) -> Result<Option<ReplicationOrder>, StoreError> {
    let row = sqlx::query_as::<_, OrderRow>(
        r#"
        SELECT o.id, o.source_tx_hash, o.source_log_index, o.source_address, o.market_id,
               o.outcome_index, o.side, o.size, o.limit_price, o.dry_run, o.created_at
        FROM replication_orders o
        LEFT JOIN submission_attempts s ON s.order_id = o.id
        WHERE o.source_tx_hash = $1
          AND o.source_log_index = $2
          AND o.source_address = $3
          AND s.order_id IS NULL
        "#,
    )
    .bind(&trade_ref.tx_hash)
    .bind(to_i64(trade_ref.log_index, "log_index")?)
    .bind(source_address)
    .fetch_optional(pool)
    .await?;

    row.map(ReplicationOrder::try_from).transpose()
}

/// Append the final outcome of a submission.
pub async fn insert_submission(
    pool: &PgPool,
    order_id: Uuid,
    result: &SubmissionResult,
) -> Result<(), StoreError> {
    let (tx_hash, reason) = match result {
        SubmissionResult::Accepted { tx_hash, .. } => (tx_hash.clone(), None),
        SubmissionResult::Rejected { reason, .. } | SubmissionResult::Error { reason, .. } => {
            (None, Some(reason.clone()))
        }
    };
    let attempts = i32::try_from(result.attempts()).unwrap_or(i32::MAX);

    sqlx::query(
        r#"
        INSERT INTO submission_attempts (order_id, status, tx_hash, reason, attempts)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(order_id)
    .bind(result.label())
    .bind(tx_hash)
    .bind(reason)
    .bind(attempts)
    .execute(pool)
    .await?;

    Ok(())
}
