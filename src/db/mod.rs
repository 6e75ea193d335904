pub mod cursor_repo;
pub mod memory;
pub mod order_repo;
pub mod trade_repo;
pub mod tracked_repo;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Cursor, ReplicationOrder, SubmissionResult, TrackedAddress, TradeRecord, TradeRef};

pub async fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    // Verify connectivity
    sqlx::query("SELECT 1").execute(&pool).await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A stored row could not be mapped back into the domain model.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable state: the cursor, the tracked registry and the trade/order journals.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_cursor(&self) -> Result<Option<Cursor>, StoreError>;

    async fn save_cursor(&self, cursor: Cursor) -> Result<(), StoreError>;

    async fn load_tracked(&self) -> Result<Vec<TrackedAddress>, StoreError>;

    async fn upsert_tracked(&self, entry: &TrackedAddress) -> Result<(), StoreError>;

    /// Returns false when the address was not tracked.
    async fn remove_tracked(&self, address: &str) -> Result<bool, StoreError>;

    /// Idempotent on `(tx_hash, log_index)`. Returns the number of new rows.
    async fn record_trades(&self, records: &[TradeRecord]) -> Result<u64, StoreError>;

    async fn load_trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeRecord>, StoreError>;

    /// Journal an order before it is submitted. Returns false if an order for
    /// the same source trade and address already exists.
    async fn journal_order(&self, order: &ReplicationOrder) -> Result<bool, StoreError>;

    /// The journaled order for `trade_ref` and `source_address` when no
    /// submission outcome has been recorded for it yet.
    async fn pending_order(
        &self,
        trade_ref: &TradeRef,
        source_address: &str,
    ) -> Result<Option<ReplicationOrder>, StoreError>;

    async fn record_submission(
        &self,
        order_id: Uuid,
        result: &SubmissionResult,
    ) -> Result<(), StoreError>;
}

/// Postgres-backed `Store`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn load_cursor(&self) -> Result<Option<Cursor>, StoreError> {
        cursor_repo::load_cursor(&self.pool).await
    }

    async fn save_cursor(&self, cursor: Cursor) -> Result<(), StoreError> {
        cursor_repo::save_cursor(&self.pool, cursor).await
    }

    async fn load_tracked(&self) -> Result<Vec<TrackedAddress>, StoreError> {
        tracked_repo::list_tracked(&self.pool).await
    }

    async fn upsert_tracked(&self, entry: &TrackedAddress) -> Result<(), StoreError> {
        tracked_repo::upsert_tracked(&self.pool, entry).await
    }

    async fn remove_tracked(&self, address: &str) -> Result<bool, StoreError> {
        tracked_repo::remove_tracked(&self.pool, address).await
    }

    async fn record_trades(&self, records: &[TradeRecord]) -> Result<u64, StoreError> {
        trade_repo::insert_trades(&self.pool, records).await
    }

    async fn load_trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeRecord>, StoreError> {
        trade_repo::get_trades_since(&self.pool, since).await
    }

    async fn journal_order(&self, order: &ReplicationOrder) -> Result<bool, StoreError> {
        order_repo::insert_order(&self.pool, order).await
    }

    async fn pending_order(
        &self,
        trade_ref: &TradeRef,
        source_address: &str,
    ) -> Result<Option<ReplicationOrder>, StoreError> {
        order_repo::get_pending_order(&self.pool, trade_ref, source_address).await
    }

    async fn record_submission(
        &self,
        order_id: Uuid,
        result: &SubmissionResult,
    ) -> Result<(), StoreError> {
        order_repo::insert_submission(&self.pool, order_id, result).await
    }
}

/// Integer columns are BIGINT; values above `i64::MAX` are refused, not wrapped.
pub(crate) fn to_i64(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{what} {value} exceeds BIGINT")))
}

pub(crate) fn to_u64(value: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {what}: {value}")))
}
