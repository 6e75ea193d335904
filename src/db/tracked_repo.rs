use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};

use super::{to_i64, to_u64, StoreError};
use crate::models::TrackedAddress;

#[derive(Debug, FromRow)]
struct TrackedRow {
    address: String,
    added_at: DateTime<Utc>,
    max_position_size: i64,
    copy_ratio: Decimal,
}

impl TryFrom<TrackedRow> for TrackedAddress {
    type Error = StoreError;

    fn try_from(row: TrackedRow) -> Result<Self, Self::Error> {
        Ok(TrackedAddress {
            max_position_size: to_u64(row.max_position_size, "max_position_size")?,
            address: row.address,
            added_at: row.added_at,
            copy_ratio: row.copy_ratio,
        })
    }
}

pub async fn list_tracked(pool: &PgPool) -> Result<Vec<TrackedAddress>, StoreError> {
    let rows = sqlx::query_as::<_, TrackedRow>(
        "SELECT address, added_at, max_position_size, copy_ratio FROM tracked_addresses ORDER BY address",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(TrackedAddress::try_from).collect()
}

/// Insert a tracked address, or update its sizing parameters if present.
pub async fn upsert_tracked(pool: &PgPool, entry: &TrackedAddress) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO tracked_addresses (address, added_at, max_position_size, copy_ratio)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (address) DO UPDATE
        SET max_position_size = EXCLUDED.max_position_size, copy_ratio = EXCLUDED.copy_ratio
        "#,
    )
    .bind(&entry.address)
    .bind(entry.added_at)
    .bind(to_i64(entry.max_position_size, "max_position_size")?)
    .bind(entry.copy_ratio)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn remove_tracked(pool: &PgPool, address: &str) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM tracked_addresses WHERE address = $1")
        .bind(address)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}
