use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Store, StoreError};
use crate::models::{Cursor, ReplicationOrder, SubmissionResult, TrackedAddress, TradeRecord, TradeRef};

#[derive(Debug, Default)]
struct State {
    cursor: Option<Cursor>,
    cursor_writes: u64,
    tracked: BTreeMap<String, TrackedAddress>,
    trades: BTreeMap<TradeRef, TradeRecord>,
    order_keys: HashSet<(TradeRef, String)>,
    orders: Vec<ReplicationOrder>,
    submissions: Vec<(Uuid, SubmissionResult)>,
}

/// In-process `Store` for tests and `--ephemeral` runs. Nothing survives the
/// process, but a single instance can be shared across pipeline restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_cursor_writes: AtomicU32,
    fail_journal_at: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` cursor writes fail with `StoreError::Unavailable`.
    pub fn fail_next_cursor_writes(&self, n: u32) {
        self.fail_cursor_writes.store(n, Ordering::SeqCst);
    }

    /// Make the `nth` journal write from now (1-based) fail with
    /// `StoreError::Unavailable`. The writes before and after it succeed.
    pub fn fail_journal_write(&self, nth: u32) {
        self.fail_journal_at.store(nth, Ordering::SeqCst);
    }

    pub async fn cursor(&self) -> Option<Cursor> {
        self.state.lock().await.cursor
    }

    /// Successful cursor writes so far.
    pub async fn cursor_writes(&self) -> u64 {
        self.state.lock().await.cursor_writes
    }

    pub async fn orders(&self) -> Vec<ReplicationOrder> {
        self.state.lock().await.orders.clone()
    }

    pub async fn submissions(&self) -> Vec<(Uuid, SubmissionResult)> {
        self.state.lock().await.submissions.clone()
    }

    pub async fn trade_count(&self) -> usize {
        self.state.lock().await.trades.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_cursor(&self) -> Result<Option<Cursor>, StoreError> {
        Ok(self.state.lock().await.cursor)
    }

    async fn save_cursor(&self, cursor: Cursor) -> Result<(), StoreError> {
        let pending = self.fail_cursor_writes.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_cursor_writes.store(pending - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected cursor write failure".into()));
        }

        let mut state = self.state.lock().await;
        state.cursor = Some(cursor);
        state.cursor_writes += 1;
        Ok(())
    }

    async fn load_tracked(&self) -> Result<Vec<TrackedAddress>, StoreError> {
        Ok(self.state.lock().await.tracked.values().cloned().collect())
    }

    async fn upsert_tracked(&self, entry: &TrackedAddress) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .tracked
            .insert(entry.address.clone(), entry.clone());
        Ok(())
    }

    async fn remove_tracked(&self, address: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.tracked.remove(address).is_some())
    }

    async fn record_trades(&self, records: &[TradeRecord]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for record in records {
            if !state.trades.contains_key(&record.trade_ref()) {
                state.trades.insert(record.trade_ref(), record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn load_trades_since(&self, since: DateTime<Utc>) -> Result<Vec<TradeRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut trades: Vec<TradeRecord> = state
            .trades
            .values()
            .filter(|t| t.timestamp >= since)
            .cloned()
            .collect();
        trades.sort_by_key(|t| (t.block_number, t.log_index));
        Ok(trades)
    }

    async fn journal_order(&self, order: &ReplicationOrder) -> Result<bool, StoreError> {
        let countdown = self
            .fail_journal_at
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if countdown == Ok(1) {
            return Err(StoreError::Unavailable("injected journal write failure".into()));
        }

        let mut state = self.state.lock().await;
        let key = (order.source_trade_ref.clone(), order.source_address.clone());
        if !state.order_keys.insert(key) {
            return Ok(false);
        }
        state.orders.push(order.clone());
        Ok(true)
    }

    async fn pending_order(
        &self,
        trade_ref: &TradeRef,
        source_address: &str,
    ) -> Result<Option<ReplicationOrder>, StoreError> {
        let state = self.state.lock().await;
        let pending = state
            .orders
            .iter()
            .find(|o| &o.source_trade_ref == trade_ref && o.source_address == source_address)
            .filter(|o| !state.submissions.iter().any(|(id, _)| *id == o.id))
            .cloned();
        Ok(pending)
    }

    async fn record_submission(
        &self,
        order_id: Uuid,
        result: &SubmissionResult,
    ) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .submissions
            .push((order_id, result.clone()));
        Ok(())
    }
}
