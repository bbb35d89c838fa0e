use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;

use crate::config::AppConfig;
use crate::errors::Rejection;
use crate::ingestion::DedupStore;
use crate::intelligence::WalletClassifier;
use crate::models::{ExecutionResult, PositionKey, PositionStatus, Side, TradeSignal};
use crate::polymarket::{MarketDataService, ResolutionLookup};
use crate::services::health_monitor::{Liveness, StateFlusher};

use super::fees::{effective_fee_bps, trading_fee};
use super::ledger::{EntryFill, ExitQuote, Ledger, LegFill, SettleReport};
use super::position_sizer::{gas_conviction, size_copy, SizingInput};
use super::risk_guard::RiskGuard;
use super::stress::{EntryRequest, StressSimulator};

/// Reject an entry priced more than `cap` above the whale's price.
pub fn winners_curse(whale_price: Decimal, our_price: Decimal, cap: Decimal) -> Result<(), Rejection> {
    if whale_price <= Decimal::ZERO {
        return Ok(());
    }
    let premium = (our_price - whale_price) / whale_price;
    if premium > cap {
        return Err(Rejection::WinnersCurse {
            pct: (premium * Decimal::ONE_HUNDRED).round_dp(1),
        });
    }
    Ok(())
}

/// Reject markets already past their end time or closing within `block`.
/// Unknown end times pass.
pub fn expiry_check(minutes_to_expiry: Option<f64>, block: Duration) -> Result<(), Rejection> {
    match minutes_to_expiry {
        Some(m) if m <= 0.0 => Err(Rejection::PastExpiry),
        Some(m) if m <= block.as_secs_f64() / 60.0 => Err(Rejection::NearExpiry(m)),
        _ => Ok(()),
    }
}

/// The single consumer: turns deduplicated signals into ledger mutations.
pub struct CopyEngine {
    pub config: AppConfig,
    pub dedup: Arc<DedupStore>,
    pub ledger: Ledger,
    pub risk: Arc<RiskGuard>,
    pub wallets: Arc<dyn WalletClassifier>,
    pub market_data: Arc<dyn MarketDataService>,
    pub stress: Mutex<StressSimulator>,
    pub liveness: Arc<Liveness>,
}

/// What one main-loop cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub signals: usize,
    pub filled: usize,
    pub rejected: usize,
    pub settle: SettleReport,
}

impl CopyEngine {
    /// Run one signal through dedup, the entry/exit checks and the ledger.
    /// Never fails: every outcome is an `ExecutionResult`.
    pub async fn process_signal(&self, signal: &TradeSignal, now: DateTime<Utc>) -> ExecutionResult {
        if !self.dedup.record_or_reject(signal, now) {
            counter!("entries_rejected_total", "reason" => "duplicate").increment(1);
            return ExecutionResult::rejected("duplicate signal");
        }
        self.ledger.note_signal().await;

        let outcome = match signal.side {
            Side::Buy => self.enter(signal, now).await,
            Side::Sell => self.exit(signal, now).await,
        };

        match outcome {
            Ok(result) if result.success => {
                counter!("entries_filled_total", "side" => side_label(signal.side)).increment(1);
                self.liveness.stamp_trade(now);
                result
            }
            Ok(result) => {
                counter!("entries_rejected_total", "reason" => "ledger").increment(1);
                tracing::info!(
                    wallet = %signal.wallet,
                    market = %signal.market_id,
                    reason = result.reason_str(),
                    "Signal rejected by ledger"
                );
                result
            }
            Err(rejection) => {
                counter!("entries_rejected_total", "reason" => rejection.label()).increment(1);
                tracing::info!(
                    wallet = %signal.wallet,
                    market = %signal.market_id,
                    side = %signal.side,
                    reason = %rejection,
                    "Signal rejected"
                );
                ExecutionResult::rejected(rejection)
            }
        }
    }

    async fn enter(&self, signal: &TradeSignal, now: DateTime<Utc>) -> Result<ExecutionResult, Rejection> {
        // 1. Signal sanity
        if signal.price <= Decimal::ZERO || signal.price >= Decimal::ONE {
            return Err(Rejection::InvalidPrice(signal.price));
        }
        if signal.is_anonymous() && !self.config.stream.copy_anonymous {
            return Err(Rejection::Anonymous);
        }
        if self.risk.kill_switch_active() {
            return Err(super::risk_guard::RiskViolation::KillSwitch.into());
        }

        // 2. Wallet quality
        let category = self
            .wallets
            .market_category(&signal.market_id, signal.market_title.as_deref());
        let quality = self.wallets.quality(&signal.wallet, category);
        if quality.cut_off || quality.multiplier <= Decimal::ZERO {
            return Err(Rejection::WalletCutOff(signal.wallet.clone()));
        }

        // 3. Anti-hedge
        if self.ledger.has_opposite_open(&signal.market_id, signal.outcome).await {
            self.ledger.record_hedge_block().await;
            return Err(Rejection::HedgeBlocked);
        }

        // 4. Expiry and book health
        let minutes_to_expiry = match self.market_data.market_info(&signal.market_id).await {
            Ok(info) => info.minutes_to_expiry(now),
            Err(e) => {
                tracing::debug!(market = %signal.market_id, error = %e, "Market info unavailable");
                None
            }
        };
        expiry_check(minutes_to_expiry, self.config.sizing.expiry_block)?;

        let book = self.market_data.book_health(&signal.asset_id).await;
        if !book.healthy {
            return Err(Rejection::UnhealthyBook(book.reason.unwrap_or_default()));
        }

        // 5. Size
        let balance = self.ledger.cash_balance().await;
        let starting_balance = self.ledger.starting_balance().await;
        let market_cost = self.ledger.market_cost(&signal.market_id).await;
        self.risk.update_limits(balance, starting_balance);
        let decision = size_copy(
            &self.config.sizing,
            &self.config.risk,
            &SizingInput {
                usdc_value: signal.usdc_value,
                whale_price: signal.price,
                score: signal.score,
                quality: &quality,
                balance,
                starting_balance,
                current_exposure: self.risk.current_exposure(),
                market_cost,
            },
        )?;

        // 6. Friction
        let fill = {
            let mut sim = self.stress.lock().unwrap_or_else(|e| e.into_inner());
            sim.stress_entry(&EntryRequest {
                whale_price: signal.price,
                budget: decision.budget,
                market_id: &signal.market_id,
                score: signal.score,
                signal_age_secs: signal.age_secs(now),
                min_size: decision.limits.copy_min,
                minutes_to_expiry,
                now,
            })?
        };

        let (conviction, conviction_tag) = gas_conviction(&self.config.sizing, signal.gas_price_gwei);
        let budget = fill.adjusted_budget * conviction;

        // 7. Price
        winners_curse(signal.price, fill.adjusted_price, self.config.sizing.winners_curse_pct)?;

        let shares = budget / fill.adjusted_price;
        let fee_bps = effective_fee_bps(
            Some(self.market_data.fee_rate_bps(&signal.asset_id).await),
            self.config.sizing.default_fee_bps,
        );
        let leg = LegFill {
            outcome: signal.outcome,
            asset_id: signal.asset_id.clone(),
            price: fill.adjusted_price,
            size: shares,
            fee: trading_fee(fill.adjusted_price, shares, fee_bps),
            fee_rate_bps: fee_bps,
            reference_price: signal.price,
        };
        let entry = EntryFill::directional(&signal.market_id, leg, fill.gas_fee, now)
            .with_title(signal.market_title.clone())
            .with_source(&signal.wallet, signal.score)
            .with_category(category);

        // 8. Final risk gate on the all-in cost
        self.risk.check_open(entry.total_cost(), now)?;

        let tags: Vec<String> = fill
            .tags
            .iter()
            .chain(conviction_tag.iter())
            .map(ToString::to_string)
            .collect();
        tracing::info!(
            wallet = %signal.wallet,
            market = %signal.market_id,
            outcome = %signal.outcome,
            whale_price = %signal.price,
            our_price = %fill.adjusted_price,
            budget = %budget.round_dp(4),
            method = %decision.method,
            category = %category,
            tags = %tags.join(","),
            "Copy entry priced"
        );

        Ok(self.ledger.open_or_average(entry).await)
    }

    async fn exit(&self, signal: &TradeSignal, now: DateTime<Utc>) -> Result<ExecutionResult, Rejection> {
        if signal.price <= Decimal::ZERO || signal.price >= Decimal::ONE {
            return Err(Rejection::InvalidPrice(signal.price));
        }
        let key = PositionKey::directional(&signal.market_id, signal.outcome);
        if self.ledger.open_position(&key).await.is_none() {
            return Err(Rejection::NoOpenPosition);
        }

        let exit = {
            let mut sim = self.stress.lock().unwrap_or_else(|e| e.into_inner());
            sim.stress_exit(signal.price, signal.age_secs(now), now)?
        };
        let fee_bps = effective_fee_bps(
            Some(self.market_data.fee_rate_bps(&signal.asset_id).await),
            self.config.sizing.default_fee_bps,
        );
        let quote = ExitQuote {
            price: exit.adjusted_price,
            gas: exit.gas_fee,
            fee_rate_bps: fee_bps,
            reference_price: signal.price,
        };

        tracing::info!(
            wallet = %signal.wallet,
            market = %signal.market_id,
            outcome = %signal.outcome,
            whale_price = %signal.price,
            our_price = %exit.adjusted_price,
            "Whale exit, closing copy"
        );
        Ok(self.ledger.close(&key, &quote, PositionStatus::ClosedExit, now).await)
    }

    /// One main-loop pass: drain the inbound queue, settle, snapshot.
    pub async fn run_cycle(
        &self,
        rx: &mut mpsc::Receiver<TradeSignal>,
        resolution: &dyn ResolutionLookup,
        now: DateTime<Utc>,
    ) -> CycleReport {
        let started = Instant::now();
        self.liveness.stamp_main_loop(now);

        let balance = self.ledger.cash_balance().await;
        let starting = self.ledger.starting_balance().await;
        self.risk.update_limits(balance, starting);

        let mut report = CycleReport::default();
        while let Ok(signal) = rx.try_recv() {
            report.signals += 1;
            if self.process_signal(&signal, now).await.success {
                report.filled += 1;
            } else {
                report.rejected += 1;
            }
        }

        report.settle = self
            .ledger
            .check_and_settle(resolution, self.market_data.as_ref(), &self.stress, now)
            .await;
        self.ledger.snapshot(now).await;

        gauge!("cash_balance").set(self.ledger.cash_balance().await.to_f64().unwrap_or(0.0));
        gauge!("open_positions").set(self.ledger.open_count().await as f64);
        histogram!("cycle_latency_seconds").record(started.elapsed().as_secs_f64());

        if report.signals > 0 || report.settle.settled > 0 {
            tracing::debug!(
                signals = report.signals,
                filled = report.filled,
                rejected = report.rejected,
                settled = report.settle.settled,
                "Cycle complete"
            );
        }
        report
    }
}

#[async_trait]
impl StateFlusher for CopyEngine {
    async fn flush_all(&self) {
        self.ledger.persist().await;
        self.risk.persist();
        self.wallets.flush();
        tracing::info!("All state flushed");
    }
}

fn side_label(side: Side) -> &'static str {
    match side {
        Side::Buy => "buy",
        Side::Sell => "sell",
    }
}

/// Run the main cycle until the running flag drops, then flush everything.
pub async fn run_copy_engine(
    engine: Arc<CopyEngine>,
    mut rx: mpsc::Receiver<TradeSignal>,
    resolution: Arc<dyn ResolutionLookup>,
    mut running: watch::Receiver<bool>,
) {
    let cycle = engine.config.cycle_interval;
    let balance = engine.ledger.cash_balance().await;
    tracing::info!(
        cycle_secs = cycle.as_secs(),
        balance = %balance,
        "Copy engine started"
    );

    let mut timer = interval(cycle);
    loop {
        tokio::select! {
            _ = timer.tick() => {
                engine.run_cycle(&mut rx, resolution.as_ref(), Utc::now()).await;
            }
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
            }
        }
    }

    engine.flush_all().await;
    tracing::warn!("Copy engine stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_winners_curse_threshold() {
        let whale = Decimal::new(50, 2);
        let cap = Decimal::new(8, 2);
        let err = winners_curse(whale, Decimal::new(56, 2), cap).unwrap_err();
        assert_eq!(err, Rejection::WinnersCurse { pct: Decimal::from(12) });
        assert!(winners_curse(whale, Decimal::new(53, 2), cap).is_ok());
        assert!(winners_curse(whale, Decimal::new(54, 2), cap).is_ok());
    }

    #[test]
    fn test_expiry_check() {
        let block = Duration::from_secs(180);
        assert_eq!(expiry_check(Some(-1.0), block), Err(Rejection::PastExpiry));
        assert!(matches!(expiry_check(Some(2.5), block), Err(Rejection::NearExpiry(_))));
        assert!(expiry_check(Some(3.5), block).is_ok());
        assert!(expiry_check(None, block).is_ok());
    }
}
