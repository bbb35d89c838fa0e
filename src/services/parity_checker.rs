use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::interval;

use crate::config::ParityConfig;
use crate::models::{Outcome, Side, TradeSignal};

/// Pending observations kept per source before the oldest are dropped.
const MAX_PENDING: usize = 5000;

/// One decoded trade as seen by a single source.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub tx_hash: Option<String>,
    pub wallet: String,
    pub market_id: String,
    pub outcome: Outcome,
    pub side: Side,
    pub price: Decimal,
    pub whale_timestamp: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl Observation {
    fn from_signal(signal: &TradeSignal, now: DateTime<Utc>) -> Self {
        Self {
            tx_hash: signal.tx_hash.as_ref().map(|h| h.to_lowercase()),
            wallet: signal.wallet.to_lowercase(),
            market_id: signal.market_id.to_lowercase(),
            outcome: signal.outcome,
            side: signal.side,
            price: signal.price,
            whale_timestamp: signal.whale_timestamp,
            recorded_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParityKind {
    Matched,
    SideMismatch,
    PriceMismatch,
    UnmatchedChain,
    UnmatchedPoll,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParityResult {
    pub kind: ParityKind,
    pub chain: Option<Observation>,
    pub poll: Option<Observation>,
    /// |chain - poll| / poll, in percent.
    pub price_error_pct: Option<Decimal>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParityGrade {
    Excellent,
    Good,
    Marginal,
    Poor,
}

impl ParityGrade {
    /// Grade from match and side-error rates, both in percent.
    pub fn from_rates(match_rate: f64, side_error_rate: f64) -> Self {
        if match_rate >= 95.0 && side_error_rate <= 1.0 {
            ParityGrade::Excellent
        } else if match_rate >= 90.0 && side_error_rate <= 2.0 {
            ParityGrade::Good
        } else if match_rate >= 80.0 && side_error_rate <= 5.0 {
            ParityGrade::Marginal
        } else {
            ParityGrade::Poor
        }
    }
}

impl fmt::Display for ParityGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParityGrade::Excellent => "EXCELLENT",
            ParityGrade::Good => "GOOD",
            ParityGrade::Marginal => "MARGINAL",
            ParityGrade::Poor => "POOR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ParityStats {
    pub chain_observations: u64,
    pub poll_observations: u64,
    pub matched: u64,
    pub side_mismatches: u64,
    pub price_mismatches: u64,
    pub unmatched_chain: u64,
    pub unmatched_poll: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParityReport {
    pub generated_at: DateTime<Utc>,
    pub stats: ParityStats,
    pub match_rate_pct: f64,
    pub side_error_rate_pct: f64,
    pub price_error_rate_pct: f64,
    pub pending_chain: usize,
    pub pending_poll: usize,
    pub grade: ParityGrade,
    pub recent_side_mismatches: Vec<ParityResult>,
}

#[derive(Debug, Default)]
struct ParityInner {
    pending_chain: VecDeque<Observation>,
    pending_poll: VecDeque<Observation>,
    results: VecDeque<ParityResult>,
    stats: ParityStats,
}

/// Audits the chain decoder against the poller: both sources see the same
/// trades, so their decodes must agree on side, outcome and price.
#[derive(Debug)]
pub struct ParityChecker {
    config: ParityConfig,
    inner: Mutex<ParityInner>,
}

impl ParityChecker {
    pub fn new(config: ParityConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(ParityInner::default()),
        }
    }

    pub fn record_chain(&self, signal: &TradeSignal) {
        self.record_chain_at(signal, Utc::now());
    }

    pub fn record_poll(&self, signal: &TradeSignal) {
        self.record_poll_at(signal, Utc::now());
    }

    pub fn record_chain_at(&self, signal: &TradeSignal, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.stats.chain_observations += 1;
        push_bounded(&mut inner.pending_chain, Observation::from_signal(signal, now));
    }

    pub fn record_poll_at(&self, signal: &TradeSignal, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.stats.poll_observations += 1;
        push_bounded(&mut inner.pending_poll, Observation::from_signal(signal, now));
    }

    /// Match pending observations: exact tx hash first, then same wallet and
    /// market within the match window. Leftovers older than `unmatched_after`
    /// are reported as unmatched.
    pub fn check(&self, now: DateTime<Utc>) {
        let window = ChronoDuration::seconds(self.config.match_window_secs);
        let stale = ChronoDuration::from_std(self.config.unmatched_after)
            .unwrap_or(ChronoDuration::minutes(5));
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let chain: Vec<Observation> = inner.pending_chain.drain(..).collect();
        let mut leftover_chain = VecDeque::new();

        for c in chain {
            let exact = c.tx_hash.as_ref().and_then(|tx| {
                inner
                    .pending_poll
                    .iter()
                    .position(|p| p.tx_hash.as_ref() == Some(tx))
            });
            let found = exact.or_else(|| {
                inner.pending_poll.iter().position(|p| {
                    p.wallet == c.wallet
                        && p.market_id == c.market_id
                        && (p.whale_timestamp - c.whale_timestamp).abs() < window
                })
            });

            match found.and_then(|idx| inner.pending_poll.remove(idx)) {
                Some(p) => {
                    let result = self.compare(c, p, now);
                    match result.kind {
                        ParityKind::Matched => inner.stats.matched += 1,
                        ParityKind::SideMismatch => {
                            inner.stats.side_mismatches += 1;
                            tracing::warn!(
                                chain = ?result.chain,
                                poll = ?result.poll,
                                "Parity side/outcome mismatch"
                            );
                        }
                        ParityKind::PriceMismatch => inner.stats.price_mismatches += 1,
                        ParityKind::UnmatchedChain | ParityKind::UnmatchedPoll => {}
                    }
                    self.push_result(&mut inner, result);
                }
                None => leftover_chain.push_back(c),
            }
        }

        let mut still_pending = VecDeque::new();
        for c in leftover_chain {
            if now - c.recorded_at > stale {
                inner.stats.unmatched_chain += 1;
                let result = ParityResult {
                    kind: ParityKind::UnmatchedChain,
                    chain: Some(c),
                    poll: None,
                    price_error_pct: None,
                    at: now,
                };
                self.push_result(&mut inner, result);
            } else {
                still_pending.push_back(c);
            }
        }
        inner.pending_chain = still_pending;

        let polls: Vec<Observation> = inner.pending_poll.drain(..).collect();
        for p in polls {
            if now - p.recorded_at > stale {
                inner.stats.unmatched_poll += 1;
                let result = ParityResult {
                    kind: ParityKind::UnmatchedPoll,
                    chain: None,
                    poll: Some(p),
                    price_error_pct: None,
                    at: now,
                };
                self.push_result(&mut inner, result);
            } else {
                inner.pending_poll.push_back(p);
            }
        }
    }

    fn compare(&self, chain: Observation, poll: Observation, now: DateTime<Utc>) -> ParityResult {
        let denom = poll.price.max(Decimal::new(1, 3));
        let error = (chain.price - poll.price).abs() / denom;
        let kind = if chain.side != poll.side || chain.outcome != poll.outcome {
            ParityKind::SideMismatch
        } else if error > self.config.price_tolerance {
            ParityKind::PriceMismatch
        } else {
            ParityKind::Matched
        };
        ParityResult {
            kind,
            chain: Some(chain),
            poll: Some(poll),
            price_error_pct: Some((error * Decimal::ONE_HUNDRED).round_dp(2)),
            at: now,
        }
    }

    fn push_result(&self, inner: &mut ParityInner, result: ParityResult) {
        inner.results.push_back(result);
        while inner.results.len() > self.config.max_results {
            inner.results.pop_front();
        }
    }

    pub fn report(&self) -> ParityReport {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let s = &inner.stats;
        let attempts = (s.matched + s.side_mismatches + s.price_mismatches) as f64;
        let pct = |n: u64| if attempts > 0.0 { n as f64 / attempts * 100.0 } else { 0.0 };
        let match_rate = pct(s.matched);
        let side_rate = pct(s.side_mismatches);

        ParityReport {
            generated_at: Utc::now(),
            stats: s.clone(),
            match_rate_pct: (match_rate * 10.0).round() / 10.0,
            side_error_rate_pct: (side_rate * 10.0).round() / 10.0,
            price_error_rate_pct: (pct(s.price_mismatches) * 10.0).round() / 10.0,
            pending_chain: inner.pending_chain.len(),
            pending_poll: inner.pending_poll.len(),
            grade: ParityGrade::from_rates(match_rate, side_rate),
            recent_side_mismatches: inner
                .results
                .iter()
                .rev()
                .filter(|r| r.kind == ParityKind::SideMismatch)
                .take(5)
                .cloned()
                .collect(),
        }
    }

    pub fn results(&self) -> Vec<ParityResult> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.results.iter().cloned().collect()
    }
}

fn push_bounded(queue: &mut VecDeque<Observation>, obs: Observation) {
    queue.push_back(obs);
    while queue.len() > MAX_PENDING {
        queue.pop_front();
    }
}

/// Run matching every minute and log a report every `report_interval`.
pub async fn run_parity_reporter(checker: Arc<ParityChecker>, mut running: watch::Receiver<bool>) {
    let mut check_timer = interval(std::time::Duration::from_secs(60));
    let mut report_timer = interval(checker.config.report_interval);
    report_timer.tick().await;

    loop {
        tokio::select! {
            _ = check_timer.tick() => {
                checker.check(Utc::now());
            }
            _ = report_timer.tick() => {
                let report = checker.report();
                tracing::info!(
                    grade = %report.grade,
                    match_rate = report.match_rate_pct,
                    side_errors = report.side_error_rate_pct,
                    price_errors = report.price_error_rate_pct,
                    pending_chain = report.pending_chain,
                    pending_poll = report.pending_poll,
                    "Parity report"
                );
                metrics::gauge!("parity_match_rate").set(report.match_rate_pct);
            }
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
            }
        }
    }
}

/// Average price error across matched and price-mismatched results, in percent.
pub fn mean_price_error(results: &[ParityResult]) -> Option<f64> {
    let errors: Vec<f64> = results
        .iter()
        .filter_map(|r| r.price_error_pct)
        .filter_map(|d| d.to_f64())
        .collect();
    if errors.is_empty() {
        return None;
    }
    Some(errors.iter().sum::<f64>() / errors.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CanonicalId, SignalSource};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
    }

    fn signal(source: SignalSource, tx: Option<&str>, side: Side, price: Decimal, ts: DateTime<Utc>) -> TradeSignal {
        TradeSignal {
            source,
            wallet: "0xwhale".into(),
            market_id: "0xmarket".into(),
            asset_id: "111".into(),
            market_title: None,
            outcome: Outcome::Yes,
            side,
            price,
            raw_size: Decimal::from(100),
            usdc_value: Decimal::from(50),
            whale_timestamp: ts,
            detected_at: ts,
            canonical_id: CanonicalId::chain(137, tx.unwrap_or("0x0"), 0),
            score: 1,
            tx_hash: tx.map(String::from),
            gas_price_gwei: None,
        }
    }

    fn checker() -> ParityChecker {
        ParityChecker::new(ParityConfig::default())
    }

    #[test]
    fn test_exact_match_by_tx_hash() {
        let pc = checker();
        let p = Decimal::new(50, 2);
        pc.record_chain_at(&signal(SignalSource::Chain, Some("0xAA"), Side::Buy, p, t0()), t0());
        pc.record_poll_at(&signal(SignalSource::Poll, Some("0xaa"), Side::Buy, p, t0()), t0());
        pc.check(t0());
        let report = pc.report();
        assert_eq!(report.stats.matched, 1);
        assert_eq!(report.grade, ParityGrade::Excellent);
        assert_eq!(report.pending_chain, 0);
    }

    #[test]
    fn test_fuzzy_match_and_side_mismatch() {
        let pc = checker();
        let p = Decimal::new(50, 2);
        pc.record_chain_at(&signal(SignalSource::Chain, Some("0x1"), Side::Buy, p, t0()), t0());
        pc.record_poll_at(
            &signal(SignalSource::Poll, None, Side::Sell, p, t0() + ChronoDuration::seconds(12)),
            t0(),
        );
        pc.check(t0());
        let report = pc.report();
        assert_eq!(report.stats.side_mismatches, 1);
        assert_eq!(report.grade, ParityGrade::Poor);
        assert_eq!(report.recent_side_mismatches.len(), 1);
    }

    #[test]
    fn test_price_mismatch_over_one_percent() {
        let pc = checker();
        pc.record_chain_at(&signal(SignalSource::Chain, Some("0x1"), Side::Buy, Decimal::new(52, 2), t0()), t0());
        pc.record_poll_at(&signal(SignalSource::Poll, Some("0x1"), Side::Buy, Decimal::new(50, 2), t0()), t0());
        pc.check(t0());
        let results = pc.results();
        assert_eq!(results[0].kind, ParityKind::PriceMismatch);
        assert_eq!(results[0].price_error_pct, Some(Decimal::from(4)));
        assert_eq!(mean_price_error(&results), Some(4.0));
    }

    #[test]
    fn test_unmatched_after_timeout() {
        let pc = checker();
        let p = Decimal::new(50, 2);
        pc.record_chain_at(&signal(SignalSource::Chain, Some("0x1"), Side::Buy, p, t0()), t0());
        pc.check(t0() + ChronoDuration::seconds(60));
        assert_eq!(pc.report().pending_chain, 1);
        pc.check(t0() + ChronoDuration::seconds(301));
        let report = pc.report();
        assert_eq!(report.stats.unmatched_chain, 1);
        assert_eq!(report.pending_chain, 0);
    }

    #[test]
    fn test_grades() {
        assert_eq!(ParityGrade::from_rates(96.0, 0.5), ParityGrade::Excellent);
        assert_eq!(ParityGrade::from_rates(96.0, 1.5), ParityGrade::Good);
        assert_eq!(ParityGrade::from_rates(85.0, 4.0), ParityGrade::Marginal);
        assert_eq!(ParityGrade::from_rates(70.0, 0.0), ParityGrade::Poor);
    }
}
