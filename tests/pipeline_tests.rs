mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use polymirror::db::{MemoryStore, Store};
use polymirror::errors::PipelineError;
use polymirror::execution::ExposureLimits;
use polymirror::ingestion::ledger_reader::ReaderError;
use polymirror::ingestion::DriverState;
use polymirror::models::{Cursor, RankBy, Side, SubmissionResult};
use polymirror::polymarket::{MarketData, MarketDataError, MarketSnapshot, OrderSubmitter};

use common::*;

fn no_stop() -> watch::Receiver<bool> {
    watch::channel(false).1
}

/// Block 1: the tracked address buys 100 units of `MARKET` at 0.40.
fn chain_with_tracked_buy() -> Arc<FakeChain> {
    let chain = FakeChain::new("node-a");
    chain.add_block(
        1,
        vec![FakeTx::exchange(vec![Fill::new(
            TRACKED,
            OTHER,
            Side::Buy,
            100,
            "0.40",
        )])],
    );
    chain
}

// ---------------------------------------------------------------------------
// Copy decisions end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_tracked_trade_is_copied_in_dry_run() {
    let chain = chain_with_tracked_buy();
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = store_tracking(TRACKED).await;
    let mut h = HarnessBuilder::new(chain, market, store.clone()).build();

    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.trades, 1);
    assert_eq!(report.orders, 1);
    assert_eq!(report.rejections, 0);
    assert!(report.caught_up());

    let orders = h.gateway.simulated().await;
    assert_eq!(orders.len(), 1);
    let order = &orders[0];
    assert_eq!(order.source_address, TRACKED);
    assert_eq!(order.market_id, MARKET.to_string());
    assert_eq!(order.side, Side::Buy);
    assert_eq!(order.size, 10);
    assert_eq!(order.limit_price, dec("0.42"));
    assert!(order.dry_run);

    let submissions = store.submissions().await;
    assert_eq!(submissions.len(), 1);
    assert_eq!(
        submissions[0].1,
        SubmissionResult::Accepted {
            tx_hash: None,
            attempts: 0
        }
    );

    assert_eq!(store.cursor().await, Some(Cursor::new(1)));
    assert_eq!(h.driver.state(), DriverState::Idle);
}

#[tokio::test]
async fn test_moved_market_is_rejected_as_stale() {
    let chain = chain_with_tracked_buy();
    let market = FakeMarket::with_price(MARKET, "0.55");
    let store = store_tracking(TRACKED).await;
    let mut h = HarnessBuilder::new(chain, market, store.clone()).build();

    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.orders, 0);
    assert_eq!(report.rejections, 1);
    assert!(h.gateway.simulated().await.is_empty());
    assert!(store.orders().await.is_empty());
    // Rejection is not a fault: the block still counts as processed.
    assert_eq!(store.cursor().await, Some(Cursor::new(1)));
}

#[tokio::test]
async fn test_untracked_trades_only_feed_the_ledger() {
    let chain = FakeChain::new("node-a");
    chain.add_block(
        1,
        vec![FakeTx::exchange(vec![
            Fill::new(OTHER, THIRD, Side::Buy, 100, "0.40"),
            Fill::new(THIRD, OTHER, Side::Sell, 300, "0.60"),
        ])],
    );
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = store_tracking(TRACKED).await;
    let mut h = HarnessBuilder::new(chain, market.clone(), store.clone()).build();

    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.trades, 2);
    assert_eq!(report.orders, 0);
    assert_eq!(report.rejections, 0);
    assert_eq!(market.lookups.load(Ordering::SeqCst), 0);
    assert_eq!(store.trade_count().await, 2);

    let ledger = h.driver.ledger();
    let ledger = ledger.read().await;
    assert_eq!(ledger.stats(OTHER).unwrap().trade_count, 2);
    assert_eq!(ledger.stats(THIRD).unwrap().trade_count, 2);
    assert!(ledger.stats(TRACKED).is_none());

    let top = ledger.top(5, RankBy::Volume);
    assert_eq!(top.len(), 2);
}

#[tokio::test]
async fn test_dust_fill_is_rejected_as_zero_size() {
    let chain = FakeChain::new("node-a");
    chain.add_block(
        1,
        vec![FakeTx::exchange(vec![Fill::new(
            TRACKED,
            OTHER,
            Side::Buy,
            5,
            "0.40",
        )])],
    );
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = store_tracking(TRACKED).await;
    let mut h = HarnessBuilder::new(chain, market, store.clone()).build();

    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.trades, 1);
    assert_eq!(report.orders, 0);
    assert_eq!(report.rejections, 1);
    assert!(store.orders().await.is_empty());
}

#[tokio::test]
async fn test_tracked_taker_copies_opposite_side() {
    let chain = FakeChain::new("node-a");
    chain.add_block(
        1,
        vec![FakeTx::exchange(vec![Fill::new(
            OTHER,
            TRACKED,
            Side::Buy,
            100,
            "0.40",
        )])],
    );
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = store_tracking(TRACKED).await;
    let mut h = HarnessBuilder::new(chain, market, store).build();

    h.driver.run_cycle(&no_stop()).await.unwrap();
    let orders = h.gateway.simulated().await;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].side, Side::Sell);
    assert_eq!(orders[0].limit_price, dec("0.38"));
}

#[tokio::test]
async fn test_live_orders_keep_log_order_per_address() {
    let chain = FakeChain::new("node-a");
    chain.add_block(
        1,
        vec![FakeTx::exchange(vec![
            Fill::new(TRACKED, OTHER, Side::Buy, 100, "0.40"),
            Fill::new(TRACKED, OTHER, Side::Buy, 300, "0.40"),
            Fill::new(TRACKED, OTHER, Side::Buy, 200, "0.40"),
        ])],
    );
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_tracked(&tracked(TRACKED, 1_000, dec("0.1")))
        .await
        .unwrap();

    let submitter = Arc::new(RecordingSubmitter::default());
    let mut builder = HarnessBuilder::new(chain, market, store.clone());
    builder.dry_run = false;
    builder.submitter = Some(submitter.clone() as Arc<dyn OrderSubmitter>);
    let mut h = builder.build();

    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.orders, 3);
    assert!(h.gateway.simulated().await.is_empty());

    let sizes: Vec<u64> = submitter
        .submitted
        .lock()
        .unwrap()
        .iter()
        .map(|o| o.size)
        .collect();
    assert_eq!(sizes, vec![10, 30, 20]);

    let submissions = store.submissions().await;
    assert_eq!(submissions.len(), 3);
    assert!(submissions.iter().all(|(_, r)| r.is_accepted() && r.attempts() == 1));
}

#[tokio::test]
async fn test_registry_changes_apply_on_next_cycle() {
    let chain = chain_with_tracked_buy();
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = Arc::new(MemoryStore::new());
    let mut h = HarnessBuilder::new(chain.clone(), market, store.clone()).build();

    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.orders, 0);

    store
        .upsert_tracked(&tracked(TRACKED, 50, dec("0.1")))
        .await
        .unwrap();
    chain.add_block(
        2,
        vec![FakeTx::exchange(vec![Fill::new(
            TRACKED,
            OTHER,
            Side::Buy,
            100,
            "0.40",
        )])],
    );

    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.first_block, Some(2));
    assert_eq!(report.orders, 1);
}

// ---------------------------------------------------------------------------
// Decoding faults stay local
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_garbled_transaction_is_skipped_alone() {
    let chain = FakeChain::new("node-a");
    chain.add_block(
        1,
        vec![
            FakeTx::garbled(),
            FakeTx::exchange(vec![Fill::new(TRACKED, OTHER, Side::Buy, 100, "0.40")]),
        ],
    );
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = store_tracking(TRACKED).await;
    let mut h = HarnessBuilder::new(chain, market, store.clone()).build();

    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.trades, 1);
    assert_eq!(report.orders, 1);
    assert_eq!(store.cursor().await, Some(Cursor::new(1)));
}

#[tokio::test]
async fn test_unindexed_receipt_holds_block_until_available() {
    let chain = chain_with_tracked_buy();
    chain.withhold_receipts(1);
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = store_tracking(TRACKED).await;
    let mut h = HarnessBuilder::new(chain, market, store.clone()).build();

    let err = h.driver.run_cycle(&no_stop()).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Chain(ReaderError::ReceiptNotFound(_))
    ));
    assert!(!err.is_alerting());
    assert_eq!(store.cursor().await, None);
    assert_eq!(store.trade_count().await, 0);
    assert!(h.gateway.simulated().await.is_empty());

    // Next cycle the node has the receipt and the trade is copied.
    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.first_block, Some(1));
    assert_eq!(report.skipped, 0);
    assert_eq!(report.orders, 1);
    assert_eq!(h.gateway.simulated().await.len(), 1);
    assert_eq!(store.cursor().await, Some(Cursor::new(1)));
}

#[tokio::test]
async fn test_receipt_missing_on_primary_is_read_from_backup() {
    let primary = chain_with_tracked_buy();
    primary.withhold_receipts(1);
    let backup = chain_with_tracked_buy();
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = store_tracking(TRACKED).await;

    let mut builder = HarnessBuilder::new(primary, market, store.clone());
    builder.chains.push(backup.clone());
    let mut h = builder.build();

    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.skipped, 0);
    assert_eq!(report.orders, 1);
    assert_eq!(backup.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.cursor().await, Some(Cursor::new(1)));
}

// ---------------------------------------------------------------------------
// Cursor and batching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_batches_are_bounded() {
    let chain = FakeChain::new("node-a");
    chain.add_empty_blocks(1..=5);
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = Arc::new(MemoryStore::new());
    let mut builder = HarnessBuilder::new(chain, market, store.clone());
    builder.config.batch_size = 2;
    let mut h = builder.build();

    let first = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!((first.first_block, first.last_block), (Some(1), Some(2)));
    assert!(!first.caught_up());

    let second = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!((second.first_block, second.last_block), (Some(3), Some(4)));

    let third = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!((third.first_block, third.last_block), (Some(5), Some(5)));
    assert!(third.caught_up());

    let idle = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(idle.blocks(), 0);

    assert_eq!(store.cursor().await, Some(Cursor::new(5)));
    assert_eq!(store.cursor_writes().await, 3);
}

#[tokio::test]
async fn test_confirmations_hold_back_the_head() {
    let chain = FakeChain::new("node-a");
    chain.add_empty_blocks(1..=5);
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = Arc::new(MemoryStore::new());
    let mut builder = HarnessBuilder::new(chain, market, store.clone());
    builder.config.confirmations = 2;
    let mut h = builder.build();

    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.head, 3);
    assert_eq!(report.last_block, Some(3));
}

#[tokio::test]
async fn test_resumes_from_persisted_cursor() {
    let chain = FakeChain::new("node-a");
    chain.add_empty_blocks(1..=6);
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = Arc::new(MemoryStore::new());
    store.save_cursor(Cursor::new(4)).await.unwrap();
    let mut h = HarnessBuilder::new(chain, market, store).build();

    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!((report.first_block, report.last_block), (Some(5), Some(6)));
}

#[tokio::test]
async fn test_fresh_start_without_start_block_begins_at_head() {
    let chain = FakeChain::new("node-a");
    chain.add_empty_blocks(1..=9);
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = Arc::new(MemoryStore::new());
    let mut builder = HarnessBuilder::new(chain.clone(), market, store);
    builder.config.start_block = None;
    let mut h = builder.build();

    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.blocks(), 0);
    assert_eq!(h.driver.cursor(), Some(Cursor::new(9)));

    chain.add_empty_blocks(10..=10);
    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.last_block, Some(10));
}

/// Raises the stop flag on the first market lookup, i.e. while block 1 is
/// being evaluated.
struct StopOnLookup {
    inner: Arc<FakeMarket>,
    stop: watch::Sender<bool>,
}

#[async_trait]
impl MarketData for StopOnLookup {
    async fn snapshot(&self, market_id: &str) -> Result<MarketSnapshot, MarketDataError> {
        self.stop.send_replace(true);
        self.inner.snapshot(market_id).await
    }
}

#[tokio::test]
async fn test_stop_finishes_current_block_and_persists_it() {
    let chain = chain_with_tracked_buy();
    chain.add_empty_blocks(2..=4);
    let (stop_tx, stop_rx) = watch::channel(false);
    let market = Arc::new(StopOnLookup {
        inner: FakeMarket::with_price(MARKET, "0.40"),
        stop: stop_tx,
    });
    let store = store_tracking(TRACKED).await;
    let mut h = HarnessBuilder::new(chain, market, store.clone()).build();

    let report = h.driver.run_cycle(&stop_rx).await.unwrap();
    assert!(report.stopped);
    assert_eq!((report.first_block, report.last_block), (Some(1), Some(1)));
    assert_eq!(report.orders, 1);
    assert_eq!(store.cursor().await, Some(Cursor::new(1)));
}

// ---------------------------------------------------------------------------
// Faults and recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_persistence_failure_keeps_cursor_and_replay_is_idempotent() {
    let chain = chain_with_tracked_buy();
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = store_tracking(TRACKED).await;
    store.fail_next_cursor_writes(1);

    let mut first = HarnessBuilder::new(chain.clone(), market.clone(), store.clone()).build();
    let err = first.driver.run_cycle(&no_stop()).await.unwrap_err();
    assert!(matches!(err, PipelineError::PersistenceFailure(_)));
    assert!(err.is_alerting());
    assert_eq!(first.driver.state(), DriverState::Faulted);
    assert_eq!(first.driver.cursor(), Some(Cursor::new(0)));
    assert_eq!(store.cursor().await, None);
    assert_eq!(store.orders().await.len(), 1);

    // Restart: a fresh driver rebuilt from what the store kept.
    drop(first);
    let mut second = HarnessBuilder::new(chain, market, store.clone()).build();
    assert_eq!(second.driver.rehydrate().await.unwrap(), 1);

    let report = second.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.last_block, Some(1));
    assert_eq!(report.orders, 0);
    assert_eq!(report.rejections, 1);
    assert!(second.gateway.simulated().await.is_empty());
    assert_eq!(store.orders().await.len(), 1);
    assert_eq!(store.submissions().await.len(), 1);
    assert_eq!(store.cursor().await, Some(Cursor::new(1)));

    let ledger = second.driver.ledger();
    assert_eq!(ledger.read().await.stats(TRACKED).unwrap().trade_count, 1);
}

#[tokio::test]
async fn test_journal_failure_mid_block_submits_every_order_on_replay() {
    let chain = FakeChain::new("node-a");
    chain.add_block(
        1,
        vec![FakeTx::exchange(vec![
            Fill::new(TRACKED, OTHER, Side::Buy, 100, "0.40"),
            Fill::new(TRACKED, OTHER, Side::Buy, 200, "0.40"),
        ])],
    );
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = store_tracking(TRACKED).await;
    store.fail_journal_write(2);
    let mut h = HarnessBuilder::new(chain, market, store.clone()).build();

    let err = h.driver.run_cycle(&no_stop()).await.unwrap_err();
    assert!(matches!(err, PipelineError::PersistenceFailure(_)));
    assert_eq!(store.orders().await.len(), 1);
    assert!(store.submissions().await.is_empty());
    assert!(h.gateway.simulated().await.is_empty());
    assert_eq!(store.cursor().await, None);

    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.orders, 2);
    assert_eq!(report.rejections, 0);
    assert_eq!(store.orders().await.len(), 2);
    assert_eq!(store.submissions().await.len(), 2);
    assert_eq!(store.cursor().await, Some(Cursor::new(1)));

    let mut sizes: Vec<u64> = h.gateway.simulated().await.iter().map(|o| o.size).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![10, 20]);
}

#[tokio::test]
async fn test_daily_order_limit_caps_copies() {
    let chain = FakeChain::new("node-a");
    chain.add_block(
        1,
        vec![FakeTx::exchange(vec![
            Fill::new(TRACKED, OTHER, Side::Buy, 100, "0.40"),
            Fill::new(TRACKED, OTHER, Side::Buy, 200, "0.40"),
        ])],
    );
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = store_tracking(TRACKED).await;
    let mut builder = HarnessBuilder::new(chain, market, store.clone());
    builder.exposure_limits = ExposureLimits {
        max_daily_orders: Some(1),
        ..ExposureLimits::default()
    };
    let mut h = builder.build();

    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.trades, 2);
    assert_eq!(report.orders, 1);
    assert_eq!(report.rejections, 1);
    assert_eq!(store.orders().await.len(), 1);
    assert_eq!(h.gateway.simulated().await.len(), 1);
}

#[tokio::test]
async fn test_node_outage_faults_then_recovers() {
    let chain = chain_with_tracked_buy();
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = store_tracking(TRACKED).await;
    let mut h = HarnessBuilder::new(chain.clone(), market, store.clone()).build();

    chain.set_down(true);
    let err = h.driver.run_cycle(&no_stop()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Chain(_)));
    assert!(err.is_alerting());
    assert_eq!(h.driver.state(), DriverState::Faulted);
    assert_eq!(store.cursor().await, None);

    chain.set_down(false);
    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.orders, 1);
    assert_eq!(h.driver.state(), DriverState::Idle);
    assert_eq!(store.cursor().await, Some(Cursor::new(1)));
}

#[tokio::test]
async fn test_failover_to_second_endpoint() {
    let primary = FakeChain::new("node-a");
    primary.set_down(true);
    let backup = chain_with_tracked_buy();
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = store_tracking(TRACKED).await;

    let mut builder = HarnessBuilder::new(primary.clone(), market, store.clone());
    builder.chains.push(backup.clone());
    let mut h = builder.build();

    let report = h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(report.orders, 1);
    assert!(backup.calls.load(Ordering::SeqCst) > 0);

    // The reader sticks with the endpoint that answered.
    let primary_calls = primary.calls.load(Ordering::SeqCst);
    h.driver.run_cycle(&no_stop()).await.unwrap();
    assert_eq!(primary.calls.load(Ordering::SeqCst), primary_calls);
}

#[tokio::test]
async fn test_run_loop_cools_down_after_fault() {
    let chain = chain_with_tracked_buy();
    chain.set_down(true);
    let market = FakeMarket::with_price(MARKET, "0.40");
    let store = store_tracking(TRACKED).await;
    let (stop_tx, stop_rx) = watch::channel(false);

    let node = chain.clone();
    let sleeper = TestSleeper::with_hook(move |count| match count {
        1 => node.set_down(false),
        _ => {
            stop_tx.send_replace(true);
        }
    });

    let mut builder = HarnessBuilder::new(chain, market, store.clone());
    builder.sleeper = sleeper.clone();
    let config = builder.config.clone();
    let mut h = builder.build();

    h.driver.run(stop_rx).await;

    let slept = sleeper.durations();
    assert_eq!(slept[0], config.fault_cooldown);
    assert_eq!(slept[1], config.poll_interval);
    assert_eq!(store.cursor().await, Some(Cursor::new(1)));
    assert_eq!(h.gateway.simulated().await.len(), 1);
    assert_eq!(h.driver.state(), DriverState::Idle);
}
