use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::models::{RankBy, Side, TradeRecord, TradeRef, TraderStats};

/// Full sweep of every trader's window once per this many ingests.
const SWEEP_EVERY: u32 = 256;

/// Shared across the pipeline (single writer) and ranking readers.
pub type SharedLedger = Arc<RwLock<TraderLedger>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closing {
    /// Opened or added to a position, or sold without a known cost basis.
    Open,
    Win,
    Loss,
    Flat,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    timestamp: DateTime<Utc>,
    volume: Decimal,
    closing: Closing,
}

/// Open outcome-token position used to judge later sells.
#[derive(Debug, Clone, Default)]
struct Lot {
    shares: Decimal,
    cost: Decimal,
}

#[derive(Debug, Default)]
struct TraderWindow {
    entries: VecDeque<LedgerEntry>,
    lots: HashMap<String, Lot>,
}

impl TraderWindow {
    fn apply(&mut self, token: &str, side: Side, shares: Decimal, price: Decimal) -> Closing {
        match side {
            Side::Buy => {
                let lot = self.lots.entry(token.to_string()).or_default();
                lot.shares += shares;
                lot.cost += shares * price;
                Closing::Open
            }
            Side::Sell => {
                let Some(lot) = self.lots.get_mut(token) else {
                    return Closing::Open;
                };
                if lot.shares.is_zero() {
                    return Closing::Open;
                }

                let avg = lot.cost / lot.shares;
                let closing = match price.cmp(&avg) {
                    Ordering::Greater => Closing::Win,
                    Ordering::Less => Closing::Loss,
                    Ordering::Equal => Closing::Flat,
                };

                let sold = shares.min(lot.shares);
                lot.shares -= sold;
                lot.cost -= avg * sold;
                if lot.shares.is_zero() {
                    self.lots.remove(token);
                }
                closing
            }
        }
    }

    fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        while self.entries.front().is_some_and(|e| e.timestamp < cutoff) {
            self.entries.pop_front();
        }
    }

    fn stats(
        &self,
        address: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<TraderStats> {
        let mut stats = TraderStats {
            address: address.to_string(),
            window_start: cutoff,
            window_end: now,
            total_volume: Decimal::ZERO,
            trade_count: 0,
            wins: 0,
            losses: 0,
        };

        for entry in self.entries.iter().filter(|e| e.timestamp >= cutoff) {
            stats.total_volume += entry.volume;
            stats.trade_count += 1;
            match entry.closing {
                Closing::Win => stats.wins += 1,
                Closing::Loss => stats.losses += 1,
                Closing::Open | Closing::Flat => {}
            }
        }

        (stats.trade_count > 0).then_some(stats)
    }
}

/// Rolling per-address trade statistics.
///
/// Time is measured in block timestamps: the window ends at the latest
/// timestamp ingested so far. Entries that fall out of the window are
/// excluded from queries immediately but only dropped on a later ingest.
#[derive(Debug)]
pub struct TraderLedger {
    window: Duration,
    traders: HashMap<String, TraderWindow>,
    seen: HashSet<TradeRef>,
    seen_order: VecDeque<(DateTime<Utc>, TradeRef)>,
    ignored: HashSet<String>,
    now: Option<DateTime<Utc>>,
    ingests_since_sweep: u32,
}

impl TraderLedger {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            traders: HashMap::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            ignored: HashSet::new(),
            now: None,
            ingests_since_sweep: 0,
        }
    }

    /// Addresses that never get stats of their own (the exchange itself is the
    /// taker on every matched order).
    pub fn with_ignored(mut self, addresses: impl IntoIterator<Item = String>) -> Self {
        self.ignored.extend(addresses);
        self
    }

    pub fn shared(self) -> SharedLedger {
        Arc::new(RwLock::new(self))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Latest timestamp ingested.
    pub fn now(&self) -> Option<DateTime<Utc>> {
        self.now
    }

    /// Number of addresses currently holding entries.
    pub fn trader_count(&self) -> usize {
        self.traders.len()
    }

    /// Apply a decoded trade to both counterparties. Returns false when the
    /// record was already applied or is older than the window.
    pub fn ingest(&mut self, record: &TradeRecord) -> bool {
        let trade_ref = record.trade_ref();
        if self.seen.contains(&trade_ref) {
            return false;
        }

        let now = self.now.map_or(record.timestamp, |n| n.max(record.timestamp));
        self.now = Some(now);
        let cutoff = now - self.window;
        if record.timestamp < cutoff {
            return false;
        }

        self.seen.insert(trade_ref.clone());
        self.seen_order.push_back((record.timestamp, trade_ref));

        let shares = record.share_amount();
        let volume = record.notional();

        let mut parties = vec![(record.maker_address.as_str(), record.side)];
        if record.taker_address != record.maker_address {
            parties.push((record.taker_address.as_str(), record.side.opposite()));
        }

        for (address, side) in parties {
            if self.ignored.contains(address) {
                continue;
            }
            let window = self.traders.entry(address.to_string()).or_default();
            let closing = window.apply(&record.market_id, side, shares, record.price);
            window.entries.push_back(LedgerEntry {
                timestamp: record.timestamp,
                volume,
                closing,
            });
            window.evict_before(cutoff);
        }

        self.ingests_since_sweep += 1;
        if self.ingests_since_sweep >= SWEEP_EVERY {
            self.sweep(cutoff);
        }

        true
    }

    fn sweep(&mut self, cutoff: DateTime<Utc>) {
        self.ingests_since_sweep = 0;

        for window in self.traders.values_mut() {
            window.evict_before(cutoff);
        }
        // Open lots do not keep a trader alive once their window is empty.
        self.traders.retain(|_, w| !w.entries.is_empty());

        while self
            .seen_order
            .front()
            .is_some_and(|(ts, _)| *ts < cutoff)
        {
            if let Some((_, trade_ref)) = self.seen_order.pop_front() {
                self.seen.remove(&trade_ref);
            }
        }

        tracing::debug!(traders = self.traders.len(), "Trader ledger swept");
    }

    /// Stats for one address inside the current window.
    pub fn stats(&self, address: &str) -> Option<TraderStats> {
        let now = self.now?;
        self.traders
            .get(address)?
            .stats(address, now - self.window, now)
    }

    /// Top `n` traders by `by`, descending; ties go to the lower address.
    pub fn top(&self, n: usize, by: RankBy) -> Vec<TraderStats> {
        let Some(now) = self.now else {
            return Vec::new();
        };
        let cutoff = now - self.window;

        let mut ranked: Vec<TraderStats> = self
            .traders
            .iter()
            .filter_map(|(address, w)| w.stats(address, cutoff, now))
            .collect();

        ranked.sort_by(|a, b| {
            metric_cmp(b, a, by).then_with(|| a.address.cmp(&b.address))
        });
        ranked.truncate(n);
        ranked
    }
}

fn metric_cmp(a: &TraderStats, b: &TraderStats, by: RankBy) -> Ordering {
    match by {
        RankBy::Volume => a.total_volume.cmp(&b.total_volume),
        RankBy::Count => a.trade_count.cmp(&b.trade_count),
        RankBy::WinRate => a.win_rate().cmp(&b.win_rate()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
