//! Execution friction model for paper fills.
//!
//! Every entry runs through the layers below, in order; the first failing layer
//! rejects the fill:
//!
//! 1. API failure
//! 2. rate limiting (fills closer together than the venue allows)
//! 3. fill rejection, growing with per-market fatigue
//! 4. partial fill
//! 5. slippage: base + noise + drift + staleness + crowd + depletion + widening,
//!    scaled for off-hours and expiry proximity
//! 6. gas
//!
//! Randomness comes from the injected RNG and time from the request, so a seeded
//! simulator replays exactly.

use chrono::{DateTime, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::config::StressConfig;

/// Markets tracked for fatigue before fully decayed entries are dropped.
const MAX_TRACKED_MARKETS: usize = 2000;

fn max_buy_price() -> f64 {
    0.99
}

fn min_sell_price() -> f64 {
    0.01
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StressRejection {
    #[error("stress: api/network error")]
    ApiFailure,

    #[error("stress: rate limited (too fast)")]
    RateLimited,

    #[error("stress: order rejected (book changed)")]
    FillRejected,

    #[error("stress: partial fill too small")]
    PartialTooSmall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StressTag {
    Fast,
    /// Filled percentage of the requested budget.
    Partial(u32),
    Stale,
    Crowd,
    Depleted,
    WideSpread,
    OffHours,
    ExpiryDecay,
    HighGasConviction,
    LowGasConviction,
}

impl fmt::Display for StressTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StressTag::Fast => f.write_str("FAST"),
            StressTag::Partial(pct) => write!(f, "PARTIAL({pct}%)"),
            StressTag::Stale => f.write_str("STALE"),
            StressTag::Crowd => f.write_str("CROWD"),
            StressTag::Depleted => f.write_str("DEPLETED"),
            StressTag::WideSpread => f.write_str("WIDE_SPREAD"),
            StressTag::OffHours => f.write_str("OFF_HOURS"),
            StressTag::ExpiryDecay => f.write_str("EXPIRY_DECAY"),
            StressTag::HighGasConviction => f.write_str("HIGH_GAS_CONVICTION"),
            StressTag::LowGasConviction => f.write_str("LOW_GAS_CONVICTION"),
        }
    }
}

/// An entry to push through the friction layers.
#[derive(Debug, Clone)]
pub struct EntryRequest<'a> {
    pub whale_price: Decimal,
    pub budget: Decimal,
    pub market_id: &'a str,
    pub score: u8,
    pub signal_age_secs: f64,
    /// A partial fill below this budget is rejected.
    pub min_size: Decimal,
    pub minutes_to_expiry: Option<f64>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StressFill {
    pub adjusted_price: Decimal,
    pub adjusted_budget: Decimal,
    pub gas_fee: Decimal,
    /// Total slippage applied, as a fraction.
    pub slippage_pct: f64,
    pub tags: Vec<StressTag>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitFill {
    pub adjusted_price: Decimal,
    pub gas_fee: Decimal,
    pub slippage_pct: f64,
    pub tags: Vec<StressTag>,
}

/// Friction counters for the confidence report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StressStats {
    pub attempted: u64,
    pub passed: u64,
    pub fill_rejections: u64,
    pub partial_fills: u64,
    pub rate_limit_blocks: u64,
    pub api_failures: u64,
    pub crowd_hits: u64,
    pub spread_widen_hits: u64,
    pub off_hours_hits: u64,
    pub depletion_hits: u64,
    pub total_gas: f64,
    pub total_extra_slippage: f64,
    pub total_crowd_penalty: f64,
    pub worst_slippage: f64,
}

impl StressStats {
    pub fn rejected(&self) -> u64 {
        self.fill_rejections + self.rate_limit_blocks + self.api_failures
    }

    pub fn rejection_rate(&self) -> f64 {
        self.rejected() as f64 / self.attempted.max(1) as f64
    }

    /// Mean slippage per passed fill, base included.
    pub fn avg_slippage(&self, base: f64) -> f64 {
        self.total_extra_slippage / self.passed.max(1) as f64 + base
    }
}

#[derive(Debug, Clone, Copy)]
struct MarketActivity {
    count: u32,
    last_trade: DateTime<Utc>,
}

/// Seedable friction simulator. Not internally synchronized; share it behind a lock.
#[derive(Debug)]
pub struct StressSimulator<R: Rng = StdRng> {
    config: StressConfig,
    rng: R,
    last_trade: Option<DateTime<Utc>>,
    markets: HashMap<String, MarketActivity>,
    stats: StressStats,
}

impl StressSimulator<StdRng> {
    /// Seeded from `config.seed` when set, otherwise from OS entropy.
    pub fn new(config: StressConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(config, rng)
    }
}

impl<R: Rng> StressSimulator<R> {
    pub fn with_rng(config: StressConfig, rng: R) -> Self {
        Self {
            config,
            rng,
            last_trade: None,
            markets: HashMap::new(),
            stats: StressStats::default(),
        }
    }

    pub fn stats(&self) -> StressStats {
        self.stats.clone()
    }

    pub fn config(&self) -> &StressConfig {
        &self.config
    }

    pub fn stress_entry(&mut self, req: &EntryRequest<'_>) -> Result<StressFill, StressRejection> {
        self.stats.attempted += 1;
        let mut tags = Vec::new();
        let now = req.now;

        if self.chance(self.config.api_failure_rate) {
            self.stats.api_failures += 1;
            return Err(StressRejection::ApiFailure);
        }

        if let Some(last) = self.last_trade {
            let since = (now - last).num_milliseconds() as f64 / 1000.0;
            if since < self.config.rate_limit_window_secs {
                if self.chance(self.config.rate_limit_reject_rate) {
                    self.stats.rate_limit_blocks += 1;
                    return Err(StressRejection::RateLimited);
                }
                tags.push(StressTag::Fast);
            }
        }

        let fatigue = self.fatigue(req.market_id, now);
        let rejection = (self.config.base_fill_rejection
            + f64::from(fatigue) * self.config.fatigue_rejection_step)
            .min(self.config.max_fill_rejection);
        if self.chance(rejection) {
            self.stats.fill_rejections += 1;
            return Err(StressRejection::FillRejected);
        }

        let mut adjusted_budget = req.budget;
        if self.chance(self.config.partial_fill_rate) {
            let fill = self.uniform(self.config.partial_fill_min, self.config.partial_fill_max);
            adjusted_budget = (req.budget * to_decimal(fill, 6)).round_dp(4);
            self.stats.partial_fills += 1;
            tags.push(StressTag::Partial((fill * 100.0) as u32));
            if adjusted_budget < req.min_size {
                return Err(StressRejection::PartialTooSmall);
            }
        }

        let mut slip = self.config.base_slippage
            + self.uniform(0.0, self.config.slippage_noise)
            + self.uniform(0.0, self.config.slippage_drift);

        slip += self.staleness(req.signal_age_secs, &mut tags);

        if req.score >= self.config.crowd_score_threshold {
            let crowd = self.config.crowd_penalty * self.uniform(0.5, 1.5);
            slip += crowd;
            self.stats.crowd_hits += 1;
            self.stats.total_crowd_penalty += crowd;
            tags.push(StressTag::Crowd);
        }

        if fatigue > 0 {
            slip += (f64::from(fatigue) * self.config.depletion_step).min(self.config.depletion_cap);
            self.stats.depletion_hits += 1;
            tags.push(StressTag::Depleted);
        }

        slip += self.spread_widening(&mut tags);
        slip *= self.off_hours_factor(now, &mut tags);

        if let Some(minutes) = req.minutes_to_expiry {
            if minutes <= self.config.expiry_window_minutes {
                slip *= 1.0 + 2.0 * (-minutes.max(0.0) / 2.0).exp();
                tags.push(StressTag::ExpiryDecay);
            }
        }

        let whale = req.whale_price.to_f64().unwrap_or(0.0);
        let price = (whale * (1.0 + slip)).min(max_buy_price());
        self.track_slippage(slip);

        let gas = self.uniform(self.config.gas_min, self.config.gas_max);
        self.stats.total_gas += gas;

        self.last_trade = Some(now);
        self.record_market_trade(req.market_id, now);
        self.stats.passed += 1;

        Ok(StressFill {
            adjusted_price: to_decimal(price, 6),
            adjusted_budget,
            gas_fee: to_decimal(gas, 4),
            slippage_pct: slip,
            tags,
        })
    }

    /// Friction for selling a held position. Does not touch rate-limit or
    /// fatigue tracking.
    pub fn stress_exit(
        &mut self,
        reference_price: Decimal,
        signal_age_secs: f64,
        now: DateTime<Utc>,
    ) -> Result<ExitFill, StressRejection> {
        self.stats.attempted += 1;
        let mut tags = Vec::new();

        if self.chance(self.config.api_failure_rate) {
            self.stats.api_failures += 1;
            return Err(StressRejection::ApiFailure);
        }

        let mut slip = self.config.base_slippage
            + self.uniform(0.0, self.config.slippage_noise)
            + self.uniform(0.0, self.config.slippage_drift);
        slip += self.staleness(signal_age_secs, &mut tags);
        slip += self.spread_widening(&mut tags);
        slip *= self.off_hours_factor(now, &mut tags);

        let reference = reference_price.to_f64().unwrap_or(0.0);
        let price = (reference * (1.0 - slip)).max(min_sell_price());
        self.track_slippage(slip);

        let gas = self.uniform(self.config.gas_min, self.config.gas_max);
        self.stats.total_gas += gas;
        self.stats.passed += 1;

        Ok(ExitFill {
            adjusted_price: to_decimal(price, 6),
            gas_fee: to_decimal(gas, 4),
            slippage_pct: slip,
            tags,
        })
    }

    // -----------------------------------------------------------------------
    // Layers
    // -----------------------------------------------------------------------

    fn staleness(&self, age_secs: f64, tags: &mut Vec<StressTag>) -> f64 {
        if age_secs <= 0.0 {
            return 0.0;
        }
        let staleness = (age_secs * self.config.staleness_per_sec).min(self.config.staleness_cap);
        if staleness > 0.01 {
            tags.push(StressTag::Stale);
        }
        staleness
    }

    fn spread_widening(&mut self, tags: &mut Vec<StressTag>) -> f64 {
        if !self.chance(self.config.spread_widening_rate) {
            return 0.0;
        }
        self.stats.spread_widen_hits += 1;
        tags.push(StressTag::WideSpread);
        self.uniform(self.config.spread_widening_min, self.config.spread_widening_max)
    }

    fn off_hours_factor(&mut self, now: DateTime<Utc>, tags: &mut Vec<StressTag>) -> f64 {
        let hour = now.hour();
        if hour < self.config.off_hours_end_utc || hour >= self.config.off_hours_start_utc {
            self.stats.off_hours_hits += 1;
            tags.push(StressTag::OffHours);
            self.config.off_hours_multiplier
        } else {
            1.0
        }
    }

    fn track_slippage(&mut self, slip: f64) {
        self.stats.total_extra_slippage += slip - self.config.base_slippage;
        if slip > self.stats.worst_slippage {
            self.stats.worst_slippage = slip;
        }
    }

    // -----------------------------------------------------------------------
    // Market fatigue
    // -----------------------------------------------------------------------

    /// Recent fills in a market, decayed by one per `fatigue_decay_secs`.
    pub fn fatigue(&self, market_id: &str, now: DateTime<Utc>) -> u32 {
        self.markets
            .get(market_id)
            .map(|a| self.decayed(a, now))
            .unwrap_or(0)
    }

    fn decayed(&self, activity: &MarketActivity, now: DateTime<Utc>) -> u32 {
        let elapsed = (now - activity.last_trade).num_milliseconds().max(0) as f64 / 1000.0;
        let decay = (elapsed / self.config.fatigue_decay_secs.max(1.0)).floor() as u32;
        activity.count.saturating_sub(decay)
    }

    fn record_market_trade(&mut self, market_id: &str, now: DateTime<Utc>) {
        let count = self.fatigue(market_id, now) + 1;
        self.markets.insert(
            market_id.to_string(),
            MarketActivity {
                count,
                last_trade: now,
            },
        );
        if self.markets.len() > MAX_TRACKED_MARKETS {
            let decay_secs = self.config.fatigue_decay_secs;
            self.markets.retain(|_, a| {
                let elapsed = (now - a.last_trade).num_milliseconds().max(0) as f64 / 1000.0;
                (elapsed / decay_secs.max(1.0)).floor() < f64::from(a.count)
            });
        }
    }

    // -----------------------------------------------------------------------
    // Randomness
    // -----------------------------------------------------------------------

    fn chance(&mut self, p: f64) -> bool {
        p > 0.0 && self.rng.gen::<f64>() < p
    }

    fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        if hi <= lo {
            return lo;
        }
        lo + (hi - lo) * self.rng.gen::<f64>()
    }
}

fn to_decimal(x: f64, dp: u32) -> Decimal {
    Decimal::from_f64(x).unwrap_or_default().round_dp(dp)
}
