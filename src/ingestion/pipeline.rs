use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::{watch, Notify};

use crate::clock::Sleeper;
use crate::db::{Store, StoreError};
use crate::errors::PipelineError;
use crate::execution::{CopyEngine, CopyOutcome, ExecutionGateway};
use crate::intelligence::SharedLedger;
use crate::models::{Cursor, RankBy, ReplicationOrder};
use crate::registry::{SharedRegistry, TrackedRegistry};

use super::decoder::TradeDecoder;
use super::ledger_reader::{LedgerReader, ReaderError};

/// Receipts fetched in parallel per block.
const RECEIPT_CONCURRENCY: usize = 8;

/// Traders included in the periodic ranking log.
const RANKING_LOG_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Polling,
    Processing,
    PersistingCursor,
    Faulted,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverState::Idle => write!(f, "IDLE"),
            DriverState::Polling => write!(f, "POLLING"),
            DriverState::Processing => write!(f, "PROCESSING"),
            DriverState::PersistingCursor => write!(f, "PERSISTING_CURSOR"),
            DriverState::Faulted => write!(f, "FAULTED"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound on blocks processed per cycle.
    pub batch_size: u64,
    pub poll_interval: Duration,
    pub fault_cooldown: Duration,
    /// First block to process when no cursor has ever been persisted.
    /// `None` starts at the current head.
    pub start_block: Option<u64>,
    /// Blocks behind the node's head treated as final.
    pub confirmations: u64,
    /// Cycles between ranking log lines; 0 disables them.
    pub ranking_log_every: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            poll_interval: Duration::from_secs(4),
            fault_cooldown: Duration::from_secs(15),
            start_block: None,
            confirmations: 0,
            ranking_log_every: 50,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Head the cycle worked towards (after confirmations).
    pub head: u64,
    pub first_block: Option<u64>,
    pub last_block: Option<u64>,
    pub trades: usize,
    pub skipped: usize,
    pub orders: usize,
    pub rejections: usize,
    /// A stop signal cut the batch short.
    pub stopped: bool,
}

impl CycleReport {
    pub fn blocks(&self) -> u64 {
        match (self.first_block, self.last_block) {
            (Some(first), Some(last)) => last - first + 1,
            _ => 0,
        }
    }

    /// No blocks remain between the cursor and the head.
    pub fn caught_up(&self) -> bool {
        self.last_block.map_or(true, |last| last >= self.head)
    }
}

#[derive(Debug, Default)]
struct BlockReport {
    trades: usize,
    skipped: usize,
    orders: usize,
    rejections: usize,
}

/// Drives read → decode → rank → copy → submit in block order, persisting the
/// cursor after each batch.
pub struct PipelineDriver {
    config: PipelineConfig,
    reader: LedgerReader,
    decoder: TradeDecoder,
    ledger: SharedLedger,
    registry: SharedRegistry,
    engine: CopyEngine,
    gateway: Arc<ExecutionGateway>,
    store: Arc<dyn Store>,
    sleeper: Arc<dyn Sleeper>,
    wake: Arc<Notify>,
    state: DriverState,
    cursor: Option<Cursor>,
    cycles: u64,
}

impl PipelineDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        reader: LedgerReader,
        decoder: TradeDecoder,
        ledger: SharedLedger,
        registry: SharedRegistry,
        engine: CopyEngine,
        gateway: Arc<ExecutionGateway>,
        store: Arc<dyn Store>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            config,
            reader,
            decoder,
            ledger,
            registry,
            engine,
            gateway,
            store,
            sleeper,
            wake: Arc::new(Notify::new()),
            state: DriverState::Idle,
            cursor: None,
            cycles: 0,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Cursor as last successfully persisted (or loaded).
    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    /// Notifying this handle cuts the idle wait short.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn ledger(&self) -> SharedLedger {
        self.ledger.clone()
    }

    /// Replay journaled trades inside the ledger window. Returns how many
    /// were applied.
    pub async fn rehydrate(&self) -> Result<usize, StoreError> {
        let window = self.ledger.read().await.window();
        let trades = self.store.load_trades_since(Utc::now() - window).await?;

        let mut ledger = self.ledger.write().await;
        let applied = trades.iter().filter(|t| ledger.ingest(t)).count();

        tracing::info!(
            journaled = trades.len(),
            applied,
            traders = ledger.trader_count(),
            "Trader ledger rehydrated"
        );
        Ok(applied)
    }

    /// Run cycles until `stop` is set or its sender is dropped. Failed cycles
    /// wait out the fault cooldown; caught-up cycles wait for the poll
    /// interval or a wake-up.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) {
        tracing::info!(
            batch_size = self.config.batch_size,
            confirmations = self.config.confirmations,
            dry_run = self.engine.dry_run(),
            "Pipeline driver started"
        );

        while !*stop.borrow() {
            let started = Instant::now();
            let result = self.run_cycle(&stop).await;
            histogram!("pipeline_cycle_seconds").record(started.elapsed().as_secs_f64());

            match result {
                Ok(report) if report.stopped => break,
                Ok(report) if !report.caught_up() => continue,
                Ok(_) => {
                    let closed = tokio::select! {
                        _ = self.sleeper.sleep(self.config.poll_interval) => false,
                        _ = self.wake.notified() => false,
                        changed = stop.changed() => changed.is_err(),
                    };
                    if closed {
                        break;
                    }
                }
                Err(e) => {
                    if e.is_alerting() {
                        tracing::error!(
                            error = %e,
                            cooldown_secs = self.config.fault_cooldown.as_secs(),
                            "Pipeline cycle faulted"
                        );
                    } else {
                        tracing::warn!(
                            error = %e,
                            cooldown_secs = self.config.fault_cooldown.as_secs(),
                            "Pipeline cycle faulted"
                        );
                    }
                    let closed = tokio::select! {
                        _ = self.sleeper.sleep(self.config.fault_cooldown) => false,
                        changed = stop.changed() => changed.is_err(),
                    };
                    if closed {
                        break;
                    }
                }
            }
        }

        self.state = DriverState::Idle;
        tracing::info!(cursor = ?self.cursor.map(|c| c.last_processed_block), "Pipeline driver stopped");
    }

    /// One POLLING → PROCESSING → PERSISTING_CURSOR pass. On error the driver
    /// is left in `Faulted` and the cursor is unchanged.
    pub async fn run_cycle(
        &mut self,
        stop: &watch::Receiver<bool>,
    ) -> Result<CycleReport, PipelineError> {
        match self.cycle(stop).await {
            Ok(report) => {
                self.state = DriverState::Idle;
                Ok(report)
            }
            Err(e) => {
                self.state = DriverState::Faulted;
                Err(e)
            }
        }
    }

    async fn cycle(&mut self, stop: &watch::Receiver<bool>) -> Result<CycleReport, PipelineError> {
        self.state = DriverState::Polling;
        self.reload_registry().await;

        let head = self
            .reader
            .latest_block()
            .await?
            .saturating_sub(self.config.confirmations);
        let cursor = self.current_cursor(head).await?;

        let mut report = CycleReport {
            head,
            ..Default::default()
        };

        let from = cursor.next_block();
        if from > head {
            tracing::debug!(head, cursor = cursor.last_processed_block, "No new blocks");
            return Ok(report);
        }
        let to = head.min(from + self.config.batch_size.max(1) - 1);

        // PROCESSING
        self.state = DriverState::Processing;
        let registry = self.registry.read().await.clone();

        for number in from..=to {
            if *stop.borrow() {
                tracing::info!(block = number, "Stop requested, ending batch early");
                report.stopped = true;
                break;
            }

            let block_report = self.process_block(number, &registry).await?;
            report.first_block.get_or_insert(number);
            report.last_block = Some(number);
            report.trades += block_report.trades;
            report.skipped += block_report.skipped;
            report.orders += block_report.orders;
            report.rejections += block_report.rejections;
        }

        // PERSISTING_CURSOR
        if let Some(last) = report.last_block {
            self.state = DriverState::PersistingCursor;
            let next = Cursor::new(last);
            self.store.save_cursor(next).await?;
            self.cursor = Some(next);
            gauge!("cursor_block").set(last as f64);

            tracing::info!(
                from = report.first_block,
                to = last,
                head,
                trades = report.trades,
                orders = report.orders,
                rejections = report.rejections,
                skipped = report.skipped,
                "Batch processed"
            );
        }

        self.cycles += 1;
        if self.config.ranking_log_every > 0 && self.cycles % self.config.ranking_log_every == 0 {
            self.log_ranking().await;
        }

        Ok(report)
    }

    /// In-memory cursor, else the persisted one, else the configured start
    /// block, else the current head.
    async fn current_cursor(&mut self, head: u64) -> Result<Cursor, PipelineError> {
        if let Some(cursor) = self.cursor {
            return Ok(cursor);
        }

        let cursor = match self.store.load_cursor().await? {
            Some(cursor) => {
                tracing::info!(block = cursor.last_processed_block, "Resuming from persisted cursor");
                cursor
            }
            None => {
                let last = match self.config.start_block {
                    Some(start) => start.saturating_sub(1),
                    None => head,
                };
                tracing::info!(start = last + 1, "No persisted cursor, starting fresh");
                Cursor::new(last)
            }
        };

        self.cursor = Some(cursor);
        Ok(cursor)
    }

    async fn reload_registry(&self) {
        match self.store.load_tracked().await {
            Ok(entries) => {
                let fresh = TrackedRegistry::from_entries(entries);
                let mut registry = self.registry.write().await;
                if *registry != fresh {
                    tracing::info!(
                        before = registry.len(),
                        after = fresh.len(),
                        "Tracked registry reloaded"
                    );
                    *registry = fresh;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to reload tracked registry, keeping current set");
            }
        }
    }

    async fn process_block(
        &self,
        number: u64,
        registry: &TrackedRegistry,
    ) -> Result<BlockReport, PipelineError> {
        let block = self.reader.get_block(number).await?;

        // Receipts for exchange transactions, fetched concurrently. A receipt
        // no node can serve fails the block so it is retried next cycle.
        let targets: Vec<_> = block
            .transactions
            .iter()
            .filter(|tx| self.decoder.targets(tx))
            .map(|tx| tx.hash)
            .collect();

        let receipts: HashMap<_, _> = stream::iter(targets)
            .map(|hash| async move {
                let logs = self.reader.get_receipt_logs(hash).await?;
                Ok::<_, ReaderError>((hash, logs))
            })
            .buffer_unordered(RECEIPT_CONCURRENCY)
            .try_collect()
            .await?;

        let decoded = self.decoder.decode_block(&block, &receipts);
        counter!("blocks_processed_total").increment(1);
        counter!("trades_decoded_total").increment(decoded.records.len() as u64);
        counter!("decode_skipped_total").increment(decoded.skipped.len() as u64);

        let mut report = BlockReport {
            trades: decoded.records.len(),
            skipped: decoded.skipped.len(),
            ..Default::default()
        };

        if decoded.records.is_empty() {
            tracing::debug!(block = number, txs = block.transactions.len(), "Block has no trades");
            return Ok(report);
        }

        self.store.record_trades(&decoded.records).await?;

        {
            let mut ledger = self.ledger.write().await;
            for record in &decoded.records {
                ledger.ingest(record);
            }
        }

        // Evaluate in parallel; results keep record order. Every evaluation
        // runs to completion before a journal failure fails the block, and
        // the replay resumes whatever was journaled but not submitted.
        let outcomes = join_all(
            decoded
                .records
                .iter()
                .map(|record| self.engine.evaluate(record, registry)),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<_>, StoreError>>()?;

        let mut by_source: BTreeMap<String, Vec<ReplicationOrder>> = BTreeMap::new();
        for outcome in outcomes {
            match outcome {
                CopyOutcome::Emit(order) => {
                    report.orders += 1;
                    by_source
                        .entry(order.source_address.clone())
                        .or_default()
                        .push(order);
                }
                CopyOutcome::Rejected { .. } => report.rejections += 1,
                CopyOutcome::NotTracked => {}
            }
        }

        // One address's orders go out one at a time; addresses run side by side.
        join_all(by_source.into_values().map(|orders| {
            let gateway = self.gateway.clone();
            async move {
                for order in orders {
                    let result = gateway.submit(&order).await;
                    tracing::debug!(order_id = %order.id, result = %result, "Submission finished");
                }
            }
        }))
        .await;

        tracing::debug!(
            block = number,
            trades = report.trades,
            orders = report.orders,
            "Block processed"
        );

        Ok(report)
    }

    async fn log_ranking(&self) {
        let ledger = self.ledger.read().await;
        let top = ledger.top(RANKING_LOG_SIZE, RankBy::Volume);

        tracing::info!(traders = ledger.trader_count(), "Top traders by volume");
        for (rank, stats) in top.iter().enumerate() {
            tracing::info!(
                rank = rank + 1,
                trader = %stats.address,
                volume = %stats.total_volume,
                trades = stats.trade_count,
                win_rate = %stats.win_rate(),
                "Ranked trader"
            );
        }
    }
}
