use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use super::assets::AssetRegistry;
use super::parse_timestamp;
use crate::config::PollConfig;
use crate::errors::{DecodeError, FeedError};
use crate::intelligence::classify_market;
use crate::models::{AssetInfo, CanonicalId, MarketCategory, Outcome, Side, SignalSource, TradeSignal};
use crate::polymarket::types::ApiActivity;
use crate::polymarket::DataClient;
use crate::services::health_monitor::Liveness;
use crate::services::parity_checker::ParityChecker;

const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
/// Seen transaction hashes kept before the oldest are forgotten.
const MAX_SEEN_TX: usize = 10_000;
const MAX_CONSENSUS: usize = 3;

// ---------------------------------------------------------------------------
// Decoder state
// ---------------------------------------------------------------------------

/// Stateful decoder for Data API activity rows. Owns the seen-tx set, the
/// per-wallet last-seen cursor and the recent-buyer map used for consensus.
#[derive(Debug)]
pub struct PollDecoder {
    config: PollConfig,
    bucket_secs: i64,
    seen_tx: HashSet<String>,
    seen_order: VecDeque<String>,
    last_seen: HashMap<String, DateTime<Utc>>,
    /// (market, outcome) -> wallet -> latest buy time
    recent_buyers: HashMap<(String, Outcome), HashMap<String, DateTime<Utc>>>,
    seeded: HashSet<String>,
    slow_skips: u64,
    stale_skips: u64,
}

impl PollDecoder {
    pub fn new(config: PollConfig, bucket_secs: i64) -> Self {
        Self {
            config,
            bucket_secs,
            seen_tx: HashSet::new(),
            seen_order: VecDeque::new(),
            last_seen: HashMap::new(),
            recent_buyers: HashMap::new(),
            seeded: HashSet::new(),
            slow_skips: 0,
            stale_skips: 0,
        }
    }

    pub fn slow_skips(&self) -> u64 {
        self.slow_skips
    }

    pub fn stale_skips(&self) -> u64 {
        self.stale_skips
    }

    pub fn last_seen(&self, wallet: &str) -> Option<DateTime<Utc>> {
        self.last_seen.get(wallet).copied()
    }

    pub fn is_seeded(&self, wallet: &str) -> bool {
        self.seeded.contains(wallet)
    }

    /// Record a wallet's existing activity as history: its tx hashes become
    /// seen and the cursor moves to the newest row. Nothing is emitted.
    pub fn seed(&mut self, wallet: &str, rows: &[ApiActivity], now: DateTime<Utc>) -> usize {
        self.seeded.insert(wallet.to_string());
        let mut seeded = 0;
        for row in rows {
            let Some(tx_hash) = row.transaction_hash.as_deref().filter(|h| !h.is_empty()) else {
                continue;
            };
            if self.mark_seen(&tx_hash.to_lowercase()) {
                seeded += 1;
            }
            let at = row.timestamp.as_deref().and_then(parse_timestamp).unwrap_or(now);
            let cursor = self.last_seen.entry(wallet.to_string()).or_insert(at);
            if at > *cursor {
                *cursor = at;
            }
        }
        seeded
    }

    fn mark_seen(&mut self, tx_hash: &str) -> bool {
        if !self.seen_tx.insert(tx_hash.to_string()) {
            return false;
        }
        self.seen_order.push_back(tx_hash.to_string());
        while self.seen_order.len() > MAX_SEEN_TX {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen_tx.remove(&old);
            }
        }
        true
    }

    /// Other tracked wallets that bought this market/outcome within the window.
    fn consensus(&mut self, wallet: &str, market_id: &str, outcome: Outcome, now: DateTime<Utc>) -> usize {
        let window = ChronoDuration::from_std(self.config.consensus_window)
            .unwrap_or(ChronoDuration::minutes(10));
        let buyers = self
            .recent_buyers
            .entry((market_id.to_string(), outcome))
            .or_default();
        buyers.retain(|_, at| now - *at <= window);
        let others = buyers.keys().filter(|w| w.as_str() != wallet).count();
        buyers.insert(wallet.to_string(), now);
        others
    }

    /// Decode one activity row for `wallet` (lowercase, `rank` 1-based).
    ///
    /// `Ok(None)` covers rows that are valid but filtered: already seen, older
    /// than the wallet's cursor or `max_age`, too small, too expensive or in a
    /// slow market.
    pub fn decode(
        &mut self,
        wallet: &str,
        rank: Option<usize>,
        row: &ApiActivity,
        now: DateTime<Utc>,
    ) -> Result<Option<TradeSignal>, DecodeError> {
        let tx_hash = row
            .transaction_hash
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or(DecodeError::MissingField("transactionHash"))?
            .to_lowercase();
        if !self.mark_seen(&tx_hash) {
            return Ok(None);
        }

        let whale_timestamp = row
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(now);
        if let Some(cursor) = self.last_seen.get(wallet) {
            if whale_timestamp < *cursor {
                return Ok(None);
            }
        }
        let cursor = self.last_seen.entry(wallet.to_string()).or_insert(whale_timestamp);
        if whale_timestamp > *cursor {
            *cursor = whale_timestamp;
        }
        let max_age = ChronoDuration::from_std(self.config.max_age).unwrap_or(ChronoDuration::minutes(5));
        if now - whale_timestamp > max_age {
            self.stale_skips += 1;
            return Ok(None);
        }

        let market_id = row
            .condition_id
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(DecodeError::MissingField("conditionId"))?
            .to_lowercase();
        let asset_id = row
            .asset
            .clone()
            .filter(|a| !a.is_empty())
            .ok_or(DecodeError::MissingField("asset"))?;
        let side = row
            .side
            .as_deref()
            .and_then(Side::from_api_str)
            .ok_or(DecodeError::MissingField("side"))?;
        let outcome = row
            .outcome_index
            .and_then(Outcome::from_index)
            .or_else(|| row.outcome.as_deref().and_then(Outcome::from_api_str))
            .ok_or(DecodeError::MissingField("outcomeIndex"))?;
        let price = row.price.ok_or(DecodeError::MissingField("price"))?;
        if price <= Decimal::ZERO || price >= Decimal::ONE {
            return Err(DecodeError::PriceOutOfRange(price));
        }
        let size = row.size.unwrap_or(Decimal::ZERO);
        let usdc_value = row
            .usdc_size
            .filter(|u| *u > Decimal::ZERO)
            .unwrap_or(size * price)
            .round_dp(2);

        if usdc_value < self.config.min_buy_usdc {
            return Ok(None);
        }

        let score = match side {
            // Exits carry no conviction score.
            Side::Sell => 1,
            Side::Buy => {
                if price > self.config.max_price {
                    return Ok(None);
                }
                let title = row.title.as_deref().unwrap_or_default();
                if self.config.skip_slow && classify_market(title) == MarketCategory::Slow {
                    self.slow_skips += 1;
                    return Ok(None);
                }
                let consensus = self.consensus(wallet, &market_id, outcome, now);
                poll_score(consensus, price, rank, self.config.rank_cutoff)
            }
        };

        let canonical_id = CanonicalId::fingerprint(
            wallet,
            &market_id,
            outcome,
            price,
            whale_timestamp,
            self.bucket_secs,
        );

        Ok(Some(TradeSignal {
            source: SignalSource::Poll,
            wallet: wallet.to_string(),
            market_id,
            asset_id,
            market_title: row.title.clone(),
            outcome,
            side,
            price,
            raw_size: size,
            usdc_value,
            whale_timestamp,
            detected_at: now,
            canonical_id,
            score,
            tx_hash: Some(tx_hash),
            gas_price_gwei: None,
        }))
    }
}

/// Conviction score of a polled buy: base 1, +1 per other buyer (max 3),
/// +2 at or below 0.30 / +1 at or below 0.50, +1 for top-ranked wallets.
pub fn poll_score(consensus: usize, price: Decimal, rank: Option<usize>, rank_cutoff: usize) -> u8 {
    let mut score = 1 + consensus.min(MAX_CONSENSUS) as u8;
    if price <= Decimal::new(30, 2) {
        score += 2;
    } else if price <= Decimal::new(50, 2) {
        score += 1;
    }
    if rank.is_some_and(|r| r <= rank_cutoff) {
        score += 1;
    }
    score
}

// ---------------------------------------------------------------------------
// Poll loop
// ---------------------------------------------------------------------------

pub struct Poller {
    pub client: DataClient,
    pub decoder: PollDecoder,
    /// Tracked wallets, lowercase, in rank order.
    pub wallets: Vec<String>,
    pub registry: AssetRegistry,
    pub signal_tx: mpsc::Sender<TradeSignal>,
    pub liveness: Arc<Liveness>,
    pub parity: Arc<ParityChecker>,
}

/// Poll every tracked wallet's recent activity once per interval.
pub async fn run_poller(mut poller: Poller, mut running: watch::Receiver<bool>) {
    let interval = poller.decoder.config.interval;
    tracing::info!(
        wallets = poller.wallets.len(),
        interval_secs = interval.as_secs(),
        "Activity poller started"
    );

    let mut failures: u32 = 0;

    while *running.borrow() {
        let delay = match poller.poll_cycle().await {
            Ok(new_signals) => {
                failures = 0;
                if new_signals > 0 {
                    tracing::info!(new_signals, "Poll cycle found new trades");
                }
                interval
            }
            Err(e) => {
                let delay = (BASE_RECONNECT_DELAY * 2u32.saturating_pow(failures)).min(MAX_RECONNECT_DELAY);
                failures = failures.saturating_add(1);
                tracing::warn!(error = %e, delay_secs = delay.as_secs(), "Poll cycle failed, backing off");
                delay.max(interval)
            }
        };

        tokio::select! {
            _ = sleep(delay) => {}
            _ = running.changed() => {}
        }
    }

    tracing::info!(
        slow_skips = poller.decoder.slow_skips(),
        stale_skips = poller.decoder.stale_skips(),
        "Activity poller stopped"
    );
}

impl Poller {
    /// Returns the number of signals emitted. Fails only when every wallet
    /// request failed with a retryable error.
    async fn poll_cycle(&mut self) -> Result<usize, FeedError> {
        let mut emitted = 0usize;
        let mut last_error: Option<FeedError> = None;
        let mut any_ok = false;

        for (idx, wallet) in self.wallets.clone().iter().enumerate() {
            let rows = match self.client.get_activity(wallet, self.decoder.config.limit).await {
                Ok(rows) => {
                    any_ok = true;
                    rows
                }
                Err(e) => {
                    tracing::debug!(error = %e, wallet = %wallet, "Failed to fetch activity");
                    if e.is_retryable() {
                        last_error = Some(e);
                    } else {
                        metrics::counter!("decode_errors_total", "source" => "poll").increment(1);
                    }
                    continue;
                }
            };

            let now = Utc::now();
            if !self.decoder.is_seeded(wallet) {
                let seeded = self.decoder.seed(wallet, &rows, now);
                tracing::info!(wallet = %wallet, seeded, "Seeded wallet history, copying new trades only");
                continue;
            }
            // Oldest first so the cursor only moves forward.
            for row in rows.iter().rev() {
                match self.decoder.decode(wallet, Some(idx + 1), row, now) {
                    Ok(Some(signal)) => {
                        self.observe(&signal, row);
                        self.emit(signal, now).await;
                        emitted += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        metrics::counter!("decode_errors_total", "source" => "poll").increment(1);
                        tracing::debug!(error = %e, wallet = %wallet, "Activity row dropped");
                    }
                }
            }
        }

        match last_error {
            Some(e) if !any_ok => Err(e),
            _ => Ok(emitted),
        }
    }

    /// Teach the registry about the token so the stream subscribes to it.
    fn observe(&self, signal: &TradeSignal, row: &ApiActivity) {
        if self.registry.asset(&signal.asset_id).is_none() {
            self.registry.register_asset(AssetInfo {
                asset_id: signal.asset_id.clone(),
                market_id: signal.market_id.clone(),
                outcome: signal.outcome,
                title: row.title.clone(),
            });
        }
    }

    async fn emit(&self, signal: TradeSignal, now: DateTime<Utc>) {
        self.parity.record_poll(&signal);
        self.liveness.stamp_signal(now);
        metrics::counter!("signals_received_total", "source" => "poll").increment(1);
        tracing::info!(
            wallet = %signal.wallet,
            market = %signal.market_id,
            side = %signal.side,
            outcome = %signal.outcome,
            price = %signal.price,
            usdc = %signal.usdc_value,
            score = signal.score,
            "Whale trade detected via poller"
        );
        if let Err(e) = self.signal_tx.send(signal).await {
            tracing::error!(error = %e, "Failed to send poll signal to engine");
        }
    }
}
