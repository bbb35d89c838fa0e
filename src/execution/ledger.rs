//! Authoritative paper portfolio: cash, positions, fills and snapshots.
//!
//! Every mutation happens under one lock and is persisted after the lock is
//! released. Risk exposure and wallet feedback are updated after the portfolio
//! mutation commits.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::fees::{trading_fee, withdrawal_haircut};
use super::risk_guard::RiskGuard;
use super::stress::{StressSimulator, StressStats};
use crate::config::{AppConfig, ExitBands};
use crate::errors::{Rejection, StateError};
use crate::intelligence::WalletClassifier;
use crate::models::{
    ExecutionResult, FillKind, FillRecord, Leg, MarketCategory, Outcome, PnlSnapshot, Position,
    PositionKey, PositionStatus, Side,
};
use crate::persistence::StateStore;
use crate::polymarket::{MarketDataService, ResolutionLookup};

const STATE_VERSION: u32 = 3;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub starting_balance: Decimal,
    pub exits: ExitBands,
    pub snapshot_interval: Duration,
    pub max_history: usize,
    pub max_snapshots: usize,
}

impl LedgerConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            starting_balance: config.starting_balance,
            exits: config.exits.clone(),
            snapshot_interval: config.persistence.snapshot_interval,
            max_history: config.persistence.max_history,
            max_snapshots: config.persistence.max_snapshots,
        }
    }
}

// ---------------------------------------------------------------------------
// Fill inputs
// ---------------------------------------------------------------------------

/// One outcome leg of an entry fill.
#[derive(Debug, Clone)]
pub struct LegFill {
    pub outcome: Outcome,
    pub asset_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub fee: Decimal,
    pub fee_rate_bps: u32,
    /// Whale (or quote) price the fill is measured against.
    pub reference_price: Decimal,
}

impl LegFill {
    pub fn cost(&self) -> Decimal {
        self.price * self.size + self.fee
    }
}

/// A priced entry, ready to be booked.
#[derive(Debug, Clone)]
pub struct EntryFill {
    pub key: PositionKey,
    pub market_title: Option<String>,
    pub legs: Vec<LegFill>,
    pub gas: Decimal,
    pub source_wallet: Option<String>,
    pub score: Option<u8>,
    pub category: MarketCategory,
    pub timestamp: DateTime<Utc>,
}

impl EntryFill {
    pub fn directional(market_id: &str, leg: LegFill, gas: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            key: PositionKey::directional(market_id, leg.outcome),
            market_title: None,
            legs: vec![leg],
            gas,
            source_wallet: None,
            score: None,
            category: MarketCategory::Unknown,
            timestamp,
        }
    }

    pub fn paired(
        market_id: &str,
        yes: LegFill,
        no: LegFill,
        gas: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            key: PositionKey::paired(market_id),
            market_title: None,
            legs: vec![yes, no],
            gas,
            source_wallet: None,
            score: None,
            category: MarketCategory::Unknown,
            timestamp,
        }
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.market_title = title;
        self
    }

    pub fn with_source(mut self, wallet: &str, score: u8) -> Self {
        if !wallet.is_empty() {
            self.source_wallet = Some(wallet.to_lowercase());
        }
        self.score = Some(score);
        self
    }

    pub fn with_category(mut self, category: MarketCategory) -> Self {
        self.category = category;
        self
    }

    /// Price * size + fee over every leg, plus gas.
    pub fn total_cost(&self) -> Decimal {
        self.legs.iter().map(LegFill::cost).sum::<Decimal>() + self.gas
    }

    fn validate(&self) -> Result<(), Rejection> {
        for leg in &self.legs {
            if leg.price <= Decimal::ZERO || leg.price > Decimal::ONE || leg.size <= Decimal::ZERO {
                return Err(Rejection::InvalidPrice(leg.price));
            }
        }
        let shape_ok = match &self.key {
            PositionKey::Directional { outcome, .. } => {
                self.legs.len() == 1 && self.legs[0].outcome == *outcome
            }
            PositionKey::Paired { .. } => {
                self.legs.len() == 2 && self.legs[0].outcome != self.legs[1].outcome
            }
        };
        if shape_ok {
            Ok(())
        } else {
            Err(Rejection::InvalidPrice(Decimal::ZERO))
        }
    }
}

/// A priced exit of a directional position.
#[derive(Debug, Clone)]
pub struct ExitQuote {
    pub price: Decimal,
    pub gas: Decimal,
    pub fee_rate_bps: u32,
    pub reference_price: Decimal,
}

// ---------------------------------------------------------------------------
// Persisted portfolio
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub version: u32,
    pub starting_balance: Decimal,
    pub cash_balance: Decimal,
    pub total_realized_pnl: Decimal,
    pub total_fees_paid: Decimal,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    #[serde(default)]
    pub hedge_blocks: u64,
    #[serde(default)]
    pub signals_seen: u64,
    pub positions: BTreeMap<String, Position>,
    pub trade_history: VecDeque<FillRecord>,
    pub pnl_snapshots: VecDeque<PnlSnapshot>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub last_snapshot_at: Option<DateTime<Utc>>,
}

impl Portfolio {
    pub fn fresh(starting_balance: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            version: STATE_VERSION,
            starting_balance,
            cash_balance: starting_balance,
            total_realized_pnl: Decimal::ZERO,
            total_fees_paid: Decimal::ZERO,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            hedge_blocks: 0,
            signals_seen: 0,
            positions: BTreeMap::new(),
            trade_history: VecDeque::new(),
            pnl_snapshots: VecDeque::new(),
            created_at: now,
            last_updated: now,
            last_snapshot_at: None,
        }
    }

    fn is_valid(&self) -> bool {
        self.version == STATE_VERSION
            && self.starting_balance > Decimal::ZERO
            && self.cash_balance >= Decimal::ZERO
    }

    fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(|p| p.is_open())
    }

    fn push_fill(&mut self, record: FillRecord, max_history: usize) {
        self.trade_history.push_back(record);
        while self.trade_history.len() > max_history {
            self.trade_history.pop_front();
        }
    }

    fn record_result(&mut self, pnl: Decimal) {
        self.total_realized_pnl += pnl;
        if pnl >= Decimal::ZERO {
            self.winning_trades += 1;
        } else {
            self.losing_trades += 1;
        }
    }

    /// Move a closed position out of the way of a fresh one on the same key.
    fn archive_closed(&mut self, storage_key: &str) {
        let closed = self
            .positions
            .get(storage_key)
            .is_some_and(|p| !p.is_open());
        if closed {
            if let Some(old) = self.positions.remove(storage_key) {
                let archived = format!("{storage_key}#{}", old.id.simple());
                self.positions.insert(archived, old);
            }
        }
    }

    fn valuation(&self) -> Valuation {
        let mut v = Valuation::default();
        for pos in self.open_positions() {
            if pos.is_paired() {
                let locked = pos.locked_shares() - pos.total_cost;
                v.pessimistic += locked;
                v.realistic += locked;
                v.optimistic += locked;
            } else {
                let size = pos.size();
                v.pessimistic -= pos.total_cost;
                v.realistic += size * Decimal::new(5, 1) - pos.total_cost;
                v.optimistic += size - pos.total_cost;
            }
        }
        v
    }
}

/// Unrealized PnL of open positions under three settlement assumptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Valuation {
    /// Every open copy pays nothing.
    pub pessimistic: Decimal,
    /// Every open copy pays half a dollar per share.
    pub realistic: Decimal,
    /// Every open copy pays a dollar per share.
    pub optimistic: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub pessimistic_value: Decimal,
    pub realistic_value: Decimal,
    pub optimistic_value: Decimal,
    pub pessimistic_pnl: Decimal,
    pub realistic_pnl: Decimal,
    pub optimistic_pnl: Decimal,
    pub open_copy_positions: usize,
    pub open_paired_positions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSummary {
    pub starting_balance: Decimal,
    pub cash_balance: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_value: Decimal,
    pub net_profit: Decimal,
    pub withdrawal_haircut: Decimal,
    pub net_after_haircut: Decimal,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    /// Percent of settled or closed positions that made money.
    pub win_rate: Decimal,
    pub total_fees_paid: Decimal,
    pub open_positions: usize,
    pub signals_seen: u64,
    pub hedge_blocks: u64,
    pub scenarios: ScenarioReport,
    pub stress: StressStats,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioMetrics {
    pub total_trades: u64,
    pub win_rate: Decimal,
    pub avg_profit_per_trade: Decimal,
    pub total_fees_paid: Decimal,
    /// Largest peak-to-trough fall of snapshot total value, in percent.
    pub max_drawdown_pct: Decimal,
    pub snapshots_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuationBasis {
    /// Marked at the latest venue price.
    Live,
    /// No mark yet: value if the held outcome wins.
    IfWin,
    /// Paired: the smaller leg pays out whichever side wins.
    Locked,
    Settled,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionView {
    #[serde(flatten)]
    pub position: Position,
    pub unrealized_pnl: Decimal,
    pub basis: ValuationBasis,
}

/// What one settlement pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettleReport {
    pub settled: usize,
    pub take_profits: usize,
    pub stop_losses: usize,
    /// Band exits the stress layer refused; retried next pass.
    pub exits_blocked: usize,
    pub lookup_errors: usize,
}

fn win_rate(wins: u64, losses: u64) -> Decimal {
    let settled = (wins + losses).max(1);
    (Decimal::from(wins) / Decimal::from(settled) * Decimal::ONE_HUNDRED).round_dp(1)
}

fn gauge_value(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Shared handle to the paper portfolio.
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<Mutex<Portfolio>>,
    store: Option<Arc<StateStore>>,
    /// Held from snapshot to durable write so writes land in snapshot order.
    persist_lock: Arc<Mutex<()>>,
    config: Arc<LedgerConfig>,
    risk: Arc<RiskGuard>,
    wallets: Arc<dyn WalletClassifier>,
}

impl Ledger {
    /// Ledger without persistence.
    pub fn new(config: LedgerConfig, risk: Arc<RiskGuard>, wallets: Arc<dyn WalletClassifier>) -> Self {
        let portfolio = Portfolio::fresh(config.starting_balance, Utc::now());
        Self::with_portfolio(portfolio, None, config, risk, wallets)
    }

    /// Load `ledger.json`, recovering from the newest valid backup. A missing
    /// file starts a fresh portfolio; an unrecoverable one does too, loudly.
    pub fn load(
        config: LedgerConfig,
        path: impl Into<PathBuf>,
        generations: usize,
        risk: Arc<RiskGuard>,
        wallets: Arc<dyn WalletClassifier>,
    ) -> Self {
        let store = StateStore::new(path, generations);
        let portfolio = match store.load::<Portfolio, _>(
            &["version", "cash_balance", "positions"],
            Portfolio::is_valid,
        ) {
            Ok(recovered) => {
                let p = &recovered.value;
                tracing::info!(
                    cash = %p.cash_balance,
                    positions = p.positions.len(),
                    trades = p.total_trades,
                    from_backup = recovered.from_backup(),
                    "Ledger loaded"
                );
                if recovered.from_backup() {
                    tracing::warn!(source = ?recovered.source, "Ledger primary file invalid, recovered from backup");
                }
                recovered.value
            }
            Err(StateError::Missing(_)) => {
                tracing::info!(balance = %config.starting_balance, "New paper portfolio");
                Portfolio::fresh(config.starting_balance, Utc::now())
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    balance = %config.starting_balance,
                    "Ledger unrecoverable from every generation, starting fresh"
                );
                Portfolio::fresh(config.starting_balance, Utc::now())
            }
        };
        Self::with_portfolio(portfolio, Some(Arc::new(store)), config, risk, wallets)
    }

    fn with_portfolio(
        portfolio: Portfolio,
        store: Option<Arc<StateStore>>,
        config: LedgerConfig,
        risk: Arc<RiskGuard>,
        wallets: Arc<dyn WalletClassifier>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(portfolio)),
            store,
            persist_lock: Arc::new(Mutex::new(())),
            config: Arc::new(config),
            risk,
            wallets,
        }
    }

    /// Write the current portfolio through the durable store. The file I/O
    /// runs on the blocking pool.
    pub async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _writing = self.persist_lock.lock().await;
        let snapshot = {
            let mut p = self.inner.lock().await;
            p.last_updated = Utc::now();
            p.clone()
        };
        if let Err(e) = store.save_off_thread(snapshot).await {
            tracing::error!(error = %e, "Failed to save ledger");
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn cash_balance(&self) -> Decimal {
        self.inner.lock().await.cash_balance
    }

    pub async fn starting_balance(&self) -> Decimal {
        self.inner.lock().await.starting_balance
    }

    pub async fn position(&self, key: &PositionKey) -> Option<Position> {
        self.inner.lock().await.positions.get(&key.storage_key()).cloned()
    }

    pub async fn open_position(&self, key: &PositionKey) -> Option<Position> {
        self.position(key).await.filter(|p| p.is_open())
    }

    /// Open directional position on the other outcome of the same market.
    pub async fn has_opposite_open(&self, market_id: &str, outcome: Outcome) -> bool {
        let key = PositionKey::directional(market_id, outcome.opposite());
        self.open_position(&key).await.is_some()
    }

    /// Cost committed to open positions in a market.
    pub async fn market_cost(&self, market_id: &str) -> Decimal {
        let p = self.inner.lock().await;
        p.open_positions()
            .filter(|pos| pos.market_id == market_id)
            .map(|pos| pos.total_cost)
            .sum()
    }

    /// Sum of cost of every open position.
    pub async fn open_cost(&self) -> Decimal {
        let p = self.inner.lock().await;
        p.open_positions().map(|pos| pos.total_cost).sum()
    }

    pub async fn open_count(&self) -> usize {
        self.inner.lock().await.open_positions().count()
    }

    pub async fn portfolio(&self) -> Portfolio {
        self.inner.lock().await.clone()
    }

    pub async fn record_hedge_block(&self) {
        self.inner.lock().await.hedge_blocks += 1;
    }

    pub async fn note_signal(&self) {
        self.inner.lock().await.signals_seen += 1;
    }

    // -----------------------------------------------------------------------
    // Entry
    // -----------------------------------------------------------------------

    /// Book an entry: open a new position or average into the open one on the
    /// same key. Fails closed when cash does not cover the total cost.
    pub async fn open_or_average(&self, fill: EntryFill) -> ExecutionResult {
        if let Err(rejection) = fill.validate() {
            return ExecutionResult::rejected(rejection);
        }
        let total_cost = fill.total_cost();
        let fees: Decimal = fill.legs.iter().map(|l| l.fee).sum::<Decimal>() + fill.gas;

        let averaged = {
            let mut guard = self.inner.lock().await;
            let p = &mut *guard;
            if p.cash_balance < total_cost {
                return ExecutionResult::rejected(Rejection::InsufficientBalance {
                    needed: total_cost.round_dp(4),
                    available: p.cash_balance.round_dp(4),
                });
            }

            p.cash_balance -= total_cost;
            p.total_fees_paid += fees;
            p.total_trades += 1;

            let storage_key = fill.key.storage_key();
            p.archive_closed(&storage_key);

            let averaged = match p.positions.get_mut(&storage_key) {
                Some(pos) => {
                    for leg in &fill.legs {
                        match pos.leg_mut(leg.outcome) {
                            Some(held) => held.average_in(leg.price, leg.size),
                            None => pos
                                .legs
                                .push(Leg::new(leg.outcome, &leg.asset_id, leg.price, leg.size)),
                        }
                    }
                    pos.total_cost += total_cost;
                    pos.total_fees += fees;
                    pos.fill_count += 1;
                    true
                }
                None => {
                    let position = Position {
                        id: Uuid::new_v4(),
                        key: fill.key.clone(),
                        market_id: fill.key.market_id().to_string(),
                        market_title: fill.market_title.clone(),
                        legs: fill
                            .legs
                            .iter()
                            .map(|l| Leg::new(l.outcome, &l.asset_id, l.price, l.size))
                            .collect(),
                        total_cost,
                        total_fees: fees,
                        status: PositionStatus::Open,
                        opened_at: fill.timestamp,
                        closed_at: None,
                        realized_pnl: None,
                        exit_price: None,
                        settlement_value: None,
                        source_wallet: fill.source_wallet.clone(),
                        category: fill.category,
                        mark_price: None,
                        fill_count: 1,
                    };
                    p.positions.insert(storage_key, position);
                    false
                }
            };

            let kind = if fill.key_is_paired() { FillKind::Paired } else { FillKind::Copy };
            for (i, leg) in fill.legs.iter().enumerate() {
                let gas = if i == 0 { fill.gas } else { Decimal::ZERO };
                let record = FillRecord {
                    fill_id: Uuid::new_v4(),
                    timestamp: fill.timestamp,
                    market_id: fill.key.market_id().to_string(),
                    market_title: fill.market_title.clone(),
                    asset_id: leg.asset_id.clone(),
                    outcome: leg.outcome,
                    side: Side::Buy,
                    kind,
                    price: leg.price,
                    size: leg.size,
                    fee: leg.fee + gas,
                    fee_rate_bps: leg.fee_rate_bps,
                    slippage: leg.price - leg.reference_price,
                    source_wallet: fill.source_wallet.clone(),
                    score: fill.score,
                    realized_pnl: None,
                };
                p.push_fill(record, self.config.max_history);
            }

            metrics::gauge!("cash_balance").set(gauge_value(p.cash_balance));
            metrics::gauge!("open_positions").set(p.open_positions().count() as f64);
            averaged
        };

        if let Some(wallet) = &fill.source_wallet {
            self.wallets.record_entry(wallet, fill.category, total_cost);
        }
        self.risk.add_exposure(total_cost);
        self.persist().await;

        let lead = &fill.legs[0];
        tracing::info!(
            key = %fill.key,
            price = %lead.price,
            size = %lead.size,
            cost = %total_cost.round_dp(4),
            averaged,
            wallet = fill.source_wallet.as_deref().unwrap_or(""),
            "Paper fill booked"
        );

        ExecutionResult::filled(total_cost, lead.price, lead.size, fees)
    }

    /// Book a two-sided position holding both outcomes of one market.
    pub async fn open_paired(&self, fill: EntryFill) -> ExecutionResult {
        if !fill.key_is_paired() {
            return ExecutionResult::rejected("paired entry needs a paired key");
        }
        self.open_or_average(fill).await
    }

    // -----------------------------------------------------------------------
    // Exit
    // -----------------------------------------------------------------------

    /// Sell a directional position: credit `price*size - fee - gas` and realize
    /// PnL against its total cost. Gas is charged only up to the proceeds, so an
    /// exit never debits cash.
    pub async fn close(
        &self,
        key: &PositionKey,
        quote: &ExitQuote,
        status: PositionStatus,
        now: DateTime<Utc>,
    ) -> ExecutionResult {
        let kind = match status {
            PositionStatus::ClosedExit => FillKind::CopyExit,
            PositionStatus::ClosedTakeProfit => FillKind::TakeProfit,
            PositionStatus::ClosedStopLoss => FillKind::StopLoss,
            _ => return ExecutionResult::rejected("close needs a closing status"),
        };
        if quote.price <= Decimal::ZERO || quote.price > Decimal::ONE {
            return ExecutionResult::rejected(Rejection::InvalidPrice(quote.price));
        }

        let storage_key = key.storage_key();
        let (size, fee, gas, net, pnl, cost, wallet, category) = {
            let mut guard = self.inner.lock().await;
            let p = &mut *guard;
            let max_history = self.config.max_history;
            let Some(pos) = p.positions.get_mut(&storage_key).filter(|pos| pos.is_open()) else {
                return ExecutionResult::rejected(Rejection::NoOpenPosition);
            };
            let Some(outcome) = pos.held_outcome() else {
                return ExecutionResult::rejected("paired positions close at settlement");
            };

            let size = pos.size();
            let gross = quote.price * size;
            let fee = trading_fee(quote.price, size, quote.fee_rate_bps).min(gross);
            let gas = quote.gas.min(gross - fee);
            let net = gross - fee - gas;
            let pnl = net - pos.total_cost;

            pos.status = status;
            pos.closed_at = Some(now);
            pos.realized_pnl = Some(pnl);
            pos.exit_price = Some(quote.price);

            let record = FillRecord {
                fill_id: Uuid::new_v4(),
                timestamp: now,
                market_id: pos.market_id.clone(),
                market_title: pos.market_title.clone(),
                asset_id: pos.leg(outcome).map(|l| l.asset_id.clone()).unwrap_or_default(),
                outcome,
                side: Side::Sell,
                kind,
                price: quote.price,
                size,
                fee: fee + gas,
                fee_rate_bps: quote.fee_rate_bps,
                slippage: quote.reference_price - quote.price,
                source_wallet: pos.source_wallet.clone(),
                score: None,
                realized_pnl: Some(pnl),
            };
            let cost = pos.total_cost;
            let wallet = pos.source_wallet.clone();
            let category = pos.category;

            p.cash_balance += net;
            p.total_fees_paid += fee + gas;
            p.record_result(pnl);
            p.push_fill(record, max_history);

            metrics::gauge!("cash_balance").set(gauge_value(p.cash_balance));
            metrics::gauge!("open_positions").set(p.open_positions().count() as f64);
            (size, fee, gas, net, pnl, cost, wallet, category)
        };

        self.after_realized(cost, pnl, wallet.as_deref(), category, now);
        self.persist().await;

        metrics::counter!("exits_total", "reason" => kind_label(kind)).increment(1);
        tracing::info!(
            key = %key,
            status = %status,
            price = %quote.price,
            size = %size,
            pnl = %pnl.round_dp(4),
            "Position closed"
        );

        ExecutionResult::filled(net, quote.price, size, fee + gas).with_pnl(pnl)
    }

    fn after_realized(
        &self,
        cost: Decimal,
        pnl: Decimal,
        wallet: Option<&str>,
        category: MarketCategory,
        now: DateTime<Utc>,
    ) {
        self.risk.remove_exposure(cost);
        if pnl < Decimal::ZERO {
            self.risk.record_loss(-pnl, now);
        }
        if let Some(wallet) = wallet {
            self.wallets.record_result(wallet, category, pnl);
        }
    }

    // -----------------------------------------------------------------------
    // Settlement
    // -----------------------------------------------------------------------

    /// Pay out a resolved market's position: a dollar per winning share.
    pub async fn settle(&self, storage_key: &str, winner: Outcome, now: DateTime<Utc>) -> Option<Decimal> {
        let (pnl, cost, wallet, category, payout) = {
            let mut guard = self.inner.lock().await;
            let p = &mut *guard;
            let pos = p.positions.get_mut(storage_key).filter(|pos| pos.is_open())?;

            let payout = match pos.held_outcome() {
                Some(held) if held == winner => pos.size(),
                Some(_) => Decimal::ZERO,
                None => pos.payout_for(winner),
            };
            let pnl = payout - pos.total_cost;

            pos.status = PositionStatus::settled(winner);
            pos.settlement_value = Some(payout);
            pos.realized_pnl = Some(pnl);
            pos.closed_at = Some(now);

            let cost = pos.total_cost;
            let wallet = pos.source_wallet.clone();
            let category = pos.category;

            p.cash_balance += payout;
            p.record_result(pnl);
            metrics::gauge!("cash_balance").set(gauge_value(p.cash_balance));
            (pnl, cost, wallet, category, payout)
        };

        self.after_realized(cost, pnl, wallet.as_deref(), category, now);
        tracing::info!(
            key = storage_key,
            winner = %winner,
            payout = %payout,
            pnl = %pnl.round_dp(4),
            "Position settled"
        );
        Some(pnl)
    }

    /// Settle resolved markets and apply take-profit / stop-loss bands to the
    /// rest. Band exits go through the stress layer; a refused exit stays open
    /// and is retried on the next pass.
    pub async fn check_and_settle(
        &self,
        lookup: &dyn ResolutionLookup,
        market_data: &dyn MarketDataService,
        stress: &std::sync::Mutex<StressSimulator>,
        now: DateTime<Utc>,
    ) -> SettleReport {
        let mut report = SettleReport::default();

        let open: Vec<(String, Position)> = {
            let p = self.inner.lock().await;
            p.positions
                .iter()
                .filter(|(_, pos)| pos.is_open())
                .map(|(k, pos)| (k.clone(), pos.clone()))
                .collect()
        };
        if open.is_empty() {
            return report;
        }

        let mut resolutions = HashMap::new();
        for (_, pos) in &open {
            if resolutions.contains_key(&pos.market_id) {
                continue;
            }
            match lookup.resolution(&pos.market_id).await {
                Ok(res) => {
                    resolutions.insert(pos.market_id.clone(), res);
                }
                Err(e) => {
                    report.lookup_errors += 1;
                    tracing::debug!(market = %pos.market_id, error = %e, "Resolution lookup failed");
                }
            }
        }

        let mut touched = false;
        for (storage_key, pos) in open {
            let Some(res) = resolutions.get(&pos.market_id) else {
                continue;
            };

            if let Some(winner) = res.winner {
                if self.settle(&storage_key, winner, now).await.is_some() {
                    report.settled += 1;
                    touched = true;
                }
                continue;
            }

            let Some(outcome) = pos.held_outcome() else {
                continue;
            };
            let Some(mark) = res.mark(outcome) else {
                continue;
            };
            self.set_mark(&storage_key, mark).await;
            touched = true;

            let Some(pnl_pct) = pos.pnl_pct_at(mark) else {
                continue;
            };
            let (take_profit, stop_loss) = self.config.exits.for_category(pos.category);
            let status = if pnl_pct >= take_profit {
                PositionStatus::ClosedTakeProfit
            } else if pnl_pct <= -stop_loss {
                PositionStatus::ClosedStopLoss
            } else {
                continue;
            };

            let exit = {
                let mut sim = stress.lock().unwrap_or_else(|e| e.into_inner());
                sim.stress_exit(mark, 0.0, now)
            };
            let exit = match exit {
                Ok(exit) => exit,
                Err(reason) => {
                    report.exits_blocked += 1;
                    tracing::info!(key = %storage_key, %reason, status = %status, "Band exit blocked, retrying next cycle");
                    continue;
                }
            };

            let asset_id = pos.leg(outcome).map(|l| l.asset_id.clone()).unwrap_or_default();
            let quote = ExitQuote {
                price: exit.adjusted_price,
                gas: exit.gas_fee,
                fee_rate_bps: market_data.fee_rate_bps(&asset_id).await,
                reference_price: mark,
            };
            let result = self.close(&pos.key, &quote, status, now).await;
            if result.success {
                match status {
                    PositionStatus::ClosedTakeProfit => report.take_profits += 1,
                    _ => report.stop_losses += 1,
                }
            }
        }

        if touched {
            self.persist().await;
        }
        report
    }

    async fn set_mark(&self, storage_key: &str, mark: Decimal) {
        let mut p = self.inner.lock().await;
        if let Some(pos) = p.positions.get_mut(storage_key) {
            pos.mark_price = Some(mark);
        }
    }

    // -----------------------------------------------------------------------
    // Snapshots and reporting
    // -----------------------------------------------------------------------

    /// Record a valuation snapshot, at most once per snapshot interval.
    pub async fn snapshot(&self, now: DateTime<Utc>) -> Option<PnlSnapshot> {
        let interval = chrono::Duration::from_std(self.config.snapshot_interval)
            .unwrap_or(chrono::Duration::seconds(60));
        let snapshot = {
            let mut p = self.inner.lock().await;
            if p.last_snapshot_at.is_some_and(|last| now - last < interval) {
                return None;
            }
            let unrealized = p.valuation().realistic;
            let snapshot = PnlSnapshot {
                timestamp: now,
                cash_balance: p.cash_balance.round_dp(2),
                unrealized_pnl: unrealized.round_dp(2),
                total_value: (p.cash_balance + unrealized).round_dp(2),
                open_positions: p.open_positions().count(),
            };
            p.last_snapshot_at = Some(now);
            p.pnl_snapshots.push_back(snapshot.clone());
            while p.pnl_snapshots.len() > self.config.max_snapshots {
                p.pnl_snapshots.pop_front();
            }
            snapshot
        };
        self.persist().await;
        Some(snapshot)
    }

    pub async fn valuation(&self) -> Valuation {
        self.inner.lock().await.valuation()
    }

    pub async fn summary(&self, stress: StressStats) -> PortfolioSummary {
        let p = self.inner.lock().await;
        let v = p.valuation();
        let total_value = p.cash_balance + v.realistic;
        let net_profit = total_value - p.starting_balance;
        let haircut = withdrawal_haircut(net_profit);
        let open_copy = p.open_positions().filter(|pos| !pos.is_paired()).count();
        let open_paired = p.open_positions().filter(|pos| pos.is_paired()).count();

        let scenario = |unrealized: Decimal| p.cash_balance + unrealized;
        PortfolioSummary {
            starting_balance: p.starting_balance,
            cash_balance: p.cash_balance.round_dp(2),
            realized_pnl: p.total_realized_pnl.round_dp(2),
            unrealized_pnl: v.realistic.round_dp(2),
            total_value: total_value.round_dp(2),
            net_profit: net_profit.round_dp(2),
            withdrawal_haircut: haircut.round_dp(2),
            net_after_haircut: (net_profit - haircut).round_dp(2),
            total_trades: p.total_trades,
            winning_trades: p.winning_trades,
            losing_trades: p.losing_trades,
            win_rate: win_rate(p.winning_trades, p.losing_trades),
            total_fees_paid: p.total_fees_paid.round_dp(4),
            open_positions: open_copy + open_paired,
            signals_seen: p.signals_seen,
            hedge_blocks: p.hedge_blocks,
            scenarios: ScenarioReport {
                pessimistic_value: scenario(v.pessimistic).round_dp(2),
                realistic_value: scenario(v.realistic).round_dp(2),
                optimistic_value: scenario(v.optimistic).round_dp(2),
                pessimistic_pnl: (scenario(v.pessimistic) - p.starting_balance).round_dp(2),
                realistic_pnl: (scenario(v.realistic) - p.starting_balance).round_dp(2),
                optimistic_pnl: (scenario(v.optimistic) - p.starting_balance).round_dp(2),
                open_copy_positions: open_copy,
                open_paired_positions: open_paired,
            },
            stress,
            created_at: p.created_at,
        }
    }

    pub async fn metrics(&self) -> PortfolioMetrics {
        let p = self.inner.lock().await;
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;
        for s in &p.pnl_snapshots {
            if s.total_value > peak {
                peak = s.total_value;
            }
            if peak > Decimal::ZERO {
                max_dd = max_dd.max((peak - s.total_value) / peak);
            }
        }
        PortfolioMetrics {
            total_trades: p.total_trades,
            win_rate: win_rate(p.winning_trades, p.losing_trades),
            avg_profit_per_trade: (p.total_realized_pnl / Decimal::from(p.total_trades.max(1))).round_dp(4),
            total_fees_paid: p.total_fees_paid.round_dp(4),
            max_drawdown_pct: (max_dd * Decimal::ONE_HUNDRED).round_dp(2),
            snapshots_count: p.pnl_snapshots.len(),
        }
    }

    /// Positions with their unrealized PnL, open ones first, newest first.
    pub async fn positions(&self) -> Vec<PositionView> {
        let p = self.inner.lock().await;
        let mut views: Vec<PositionView> = p
            .positions
            .values()
            .map(|pos| {
                let (unrealized_pnl, basis) = if !pos.is_open() {
                    (Decimal::ZERO, ValuationBasis::Settled)
                } else if pos.is_paired() {
                    (pos.locked_shares() - pos.total_cost, ValuationBasis::Locked)
                } else if let Some(mark) = pos.mark_price {
                    (mark * pos.size() - pos.total_cost, ValuationBasis::Live)
                } else {
                    (pos.size() - pos.total_cost, ValuationBasis::IfWin)
                };
                PositionView {
                    position: pos.clone(),
                    unrealized_pnl: unrealized_pnl.round_dp(4),
                    basis,
                }
            })
            .collect();
        views.sort_by(|a, b| {
            b.position
                .is_open()
                .cmp(&a.position.is_open())
                .then(b.position.opened_at.cmp(&a.position.opened_at))
        });
        views
    }

    /// Most recent fills, newest first.
    pub async fn trade_history(&self, limit: usize) -> Vec<FillRecord> {
        let p = self.inner.lock().await;
        p.trade_history.iter().rev().take(limit).cloned().collect()
    }

    pub async fn snapshots(&self) -> Vec<PnlSnapshot> {
        self.inner.lock().await.pnl_snapshots.iter().cloned().collect()
    }
}

impl EntryFill {
    fn key_is_paired(&self) -> bool {
        matches!(self.key, PositionKey::Paired { .. })
    }
}

fn kind_label(kind: FillKind) -> &'static str {
    match kind {
        FillKind::Copy => "copy",
        FillKind::CopyExit => "whale_exit",
        FillKind::TakeProfit => "take_profit",
        FillKind::StopLoss => "stop_loss",
        FillKind::Paired => "paired",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::intelligence::WalletBook;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
    }

    fn ledger(balance: i64) -> Ledger {
        let config = LedgerConfig {
            starting_balance: Decimal::from(balance),
            exits: ExitBands::default(),
            snapshot_interval: Duration::from_secs(60),
            max_history: 3,
            max_snapshots: 2,
        };
        let risk = Arc::new(RiskGuard::in_memory(
            RiskConfig::default(),
            Decimal::from(balance),
            t0(),
        ));
        Ledger::new(config, risk, Arc::new(WalletBook::in_memory()))
    }

    fn leg(outcome: Outcome, price: Decimal, size: i64) -> LegFill {
        LegFill {
            outcome,
            asset_id: format!("asset-{outcome}"),
            price,
            size: Decimal::from(size),
            fee: Decimal::new(1, 2),
            fee_rate_bps: 200,
            reference_price: price,
        }
    }

    fn buy(market: &str, price: Decimal, size: i64) -> EntryFill {
        EntryFill::directional(market, leg(Outcome::Yes, price, size), Decimal::new(5, 3), t0())
            .with_source("0xWhale", 2)
    }

    #[tokio::test]
    async fn test_entry_debits_exact_total_cost() {
        let l = ledger(100);
        let fill = buy("m1", Decimal::new(40, 2), 10);
        let expected = fill.total_cost();
        // 0.40 * 10 + 0.01 + 0.005
        assert_eq!(expected, Decimal::new(4015, 3));

        let r = l.open_or_average(fill).await;
        assert!(r.success);
        assert_eq!(l.cash_balance().await, Decimal::from(100) - expected);
        assert_eq!(l.risk.current_exposure(), expected);
    }

    #[tokio::test]
    async fn test_insufficient_balance_fails_closed() {
        let l = ledger(1);
        let r = l.open_or_average(buy("m1", Decimal::new(50, 2), 10)).await;
        assert!(!r.success);
        assert!(r.reason_str().starts_with("insufficient balance"));
        assert_eq!(l.cash_balance().await, Decimal::ONE);
        assert_eq!(l.open_count().await, 0);
        assert!(l.trade_history(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_second_fill_averages_in() {
        let l = ledger(100);
        l.open_or_average(buy("m1", Decimal::new(40, 2), 10)).await;
        l.open_or_average(buy("m1", Decimal::new(60, 2), 30)).await;

        let pos = l
            .open_position(&PositionKey::directional("m1", Outcome::Yes))
            .await
            .unwrap();
        assert_eq!(pos.size(), Decimal::from(40));
        assert_eq!(pos.avg_price(), Decimal::new(55, 2));
        assert_eq!(pos.fill_count, 2);
        // 4.015 + 18.015
        assert_eq!(pos.total_cost, Decimal::new(2203, 2));
        assert_eq!(l.open_count().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_fill_rejected() {
        let l = ledger(100);
        let bad = buy("m1", Decimal::ZERO, 10);
        assert!(!l.open_or_average(bad).await.success);

        let mut wrong_leg = buy("m1", Decimal::new(5, 1), 10);
        wrong_leg.legs[0].outcome = Outcome::No;
        assert!(!l.open_or_average(wrong_leg).await.success);
        assert_eq!(l.cash_balance().await, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_close_realizes_pnl() {
        let l = ledger(100);
        l.open_or_average(buy("m1", Decimal::new(40, 2), 10)).await;
        let key = PositionKey::directional("m1", Outcome::Yes);

        let quote = ExitQuote {
            price: Decimal::new(60, 2),
            gas: Decimal::new(5, 3),
            fee_rate_bps: 0,
            reference_price: Decimal::new(60, 2),
        };
        let r = l.close(&key, &quote, PositionStatus::ClosedExit, t0()).await;
        assert!(r.success);
        // net 6.00 - 0.005 = 5.995, cost 4.015 -> pnl 1.98
        assert_eq!(r.realized_pnl, Some(Decimal::new(198, 2)));
        assert_eq!(l.cash_balance().await, Decimal::new(101_98, 2));
        assert_eq!(l.risk.current_exposure(), Decimal::ZERO);

        let pos = l.position(&key).await.unwrap();
        assert_eq!(pos.status, PositionStatus::ClosedExit);

        let again = l.close(&key, &quote, PositionStatus::ClosedExit, t0()).await;
        assert_eq!(again.reason_str(), "no open position");
    }

    #[tokio::test]
    async fn test_losing_close_records_daily_loss() {
        let l = ledger(100);
        l.open_or_average(buy("m1", Decimal::new(50, 2), 10)).await;
        let quote = ExitQuote {
            price: Decimal::new(30, 2),
            gas: Decimal::ZERO,
            fee_rate_bps: 0,
            reference_price: Decimal::new(30, 2),
        };
        let key = PositionKey::directional("m1", Outcome::Yes);
        let r = l.close(&key, &quote, PositionStatus::ClosedStopLoss, t0()).await;
        assert!(r.realized_pnl.unwrap() < Decimal::ZERO);
        assert_eq!(l.risk.state().daily_loss, Decimal::new(2015, 3));
        assert_eq!(l.portfolio().await.losing_trades, 1);
    }

    #[tokio::test]
    async fn test_reopen_after_close_archives_old_position() {
        let l = ledger(100);
        let key = PositionKey::directional("m1", Outcome::Yes);
        l.open_or_average(buy("m1", Decimal::new(40, 2), 10)).await;
        let quote = ExitQuote {
            price: Decimal::new(50, 2),
            gas: Decimal::ZERO,
            fee_rate_bps: 0,
            reference_price: Decimal::new(50, 2),
        };
        l.close(&key, &quote, PositionStatus::ClosedExit, t0()).await;
        l.open_or_average(buy("m1", Decimal::new(45, 2), 4)).await;

        let fresh = l.open_position(&key).await.unwrap();
        assert_eq!(fresh.fill_count, 1);
        assert_eq!(fresh.size(), Decimal::from(4));
        assert_eq!(l.portfolio().await.positions.len(), 2);
    }

    #[tokio::test]
    async fn test_settlement_pays_winning_shares() {
        let l = ledger(100);
        l.open_or_average(buy("win", Decimal::new(40, 2), 10)).await;
        l.open_or_average(buy("lose", Decimal::new(40, 2), 10)).await;

        let won = l.settle("copy_win_YES", Outcome::Yes, t0()).await.unwrap();
        assert_eq!(won, Decimal::from(10) - Decimal::new(4015, 3));
        let lost = l.settle("copy_lose_YES", Outcome::No, t0()).await.unwrap();
        assert_eq!(lost, -Decimal::new(4015, 3));

        let p = l.portfolio().await;
        assert_eq!(p.winning_trades, 1);
        assert_eq!(p.losing_trades, 1);
        assert_eq!(p.positions["copy_win_YES"].status, PositionStatus::SettledYes);
        assert_eq!(p.positions["copy_lose_YES"].status, PositionStatus::SettledNo);
        assert!(l.settle("copy_win_YES", Outcome::Yes, t0()).await.is_none());
    }

    #[tokio::test]
    async fn test_paired_position_settles_winning_leg() {
        let l = ledger(100);
        let fill = EntryFill::paired(
            "pair",
            leg(Outcome::Yes, Decimal::new(45, 2), 10),
            leg(Outcome::No, Decimal::new(50, 2), 8),
            Decimal::ZERO,
            t0(),
        );
        assert!(l.open_paired(fill).await.success);

        let v = l.valuation().await;
        // min(10, 8) - (4.51 + 4.01)
        assert_eq!(v.pessimistic, Decimal::new(-52, 2));
        assert_eq!(v.pessimistic, v.optimistic);

        let pnl = l.settle("pair", Outcome::No, t0()).await.unwrap();
        assert_eq!(pnl, Decimal::from(8) - Decimal::new(852, 2));
    }

    #[tokio::test]
    async fn test_valuation_scenarios() {
        let l = ledger(100);
        l.open_or_average(buy("m1", Decimal::new(40, 2), 10)).await;
        let v = l.valuation().await;
        let cost = Decimal::new(4015, 3);
        assert_eq!(v.pessimistic, -cost);
        assert_eq!(v.realistic, Decimal::from(5) - cost);
        assert_eq!(v.optimistic, Decimal::from(10) - cost);

        let summary = l.summary(StressStats::default()).await;
        assert_eq!(summary.open_positions, 1);
        assert_eq!(summary.scenarios.open_copy_positions, 1);
    }

    #[tokio::test]
    async fn test_history_and_snapshots_bounded() {
        let l = ledger(100);
        for i in 0..5 {
            l.open_or_average(buy(&format!("m{i}"), Decimal::new(10, 2), 1)).await;
        }
        let history = l.trade_history(10).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].market_id, "m4");

        assert!(l.snapshot(t0()).await.is_some());
        assert!(l.snapshot(t0() + chrono::Duration::seconds(30)).await.is_none());
        assert!(l.snapshot(t0() + chrono::Duration::seconds(60)).await.is_some());
        assert!(l.snapshot(t0() + chrono::Duration::seconds(120)).await.is_some());
        assert_eq!(l.snapshots().await.len(), 2);
    }

    #[tokio::test]
    async fn test_max_drawdown() {
        let l = ledger(100);
        {
            let mut p = l.inner.lock().await;
            for (i, value) in [100, 120, 90, 110].into_iter().enumerate() {
                p.pnl_snapshots.push_back(PnlSnapshot {
                    timestamp: t0() + chrono::Duration::minutes(i as i64),
                    cash_balance: Decimal::from(value),
                    unrealized_pnl: Decimal::ZERO,
                    total_value: Decimal::from(value),
                    open_positions: 0,
                });
            }
        }
        // peak 120 -> trough 90 = 25%
        assert_eq!(l.metrics().await.max_drawdown_pct, Decimal::from(25));
    }
}
