use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::Outcome;

/// Settlement-speed category of a market, as reported by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MarketCategory {
    CryptoFast,
    SportsFast,
    Slow,
    #[default]
    Unknown,
}

impl MarketCategory {
    /// Fast markets usually resolve within a day.
    pub fn is_fast(&self) -> bool {
        matches!(self, MarketCategory::CryptoFast | MarketCategory::SportsFast)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketCategory::CryptoFast => "crypto_fast",
            MarketCategory::SportsFast => "sports_fast",
            MarketCategory::Slow => "slow",
            MarketCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MarketCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which market and outcome an outcome token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetInfo {
    pub asset_id: String,
    pub market_id: String,
    pub outcome: Outcome,
    pub title: Option<String>,
}

/// Static market metadata used by entry checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketInfo {
    pub market_id: String,
    pub title: Option<String>,
    pub end_time: Option<DateTime<Utc>>,
    /// Outcome token ids, keyed by outcome.
    pub assets: HashMap<Outcome, String>,
}

impl MarketInfo {
    /// Minutes until the market's end time, negative once past.
    pub fn minutes_to_expiry(&self, now: DateTime<Utc>) -> Option<f64> {
        self.end_time
            .map(|end| (end - now).num_milliseconds() as f64 / 60_000.0)
    }
}

/// Current resolution state of a market.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketResolution {
    pub winner: Option<Outcome>,
    /// Latest mark price per outcome, when the venue reports one.
    pub prices: HashMap<Outcome, Decimal>,
}

impl MarketResolution {
    pub fn unresolved() -> Self {
        Self::default()
    }

    pub fn resolved(winner: Outcome) -> Self {
        Self {
            winner: Some(winner),
            prices: HashMap::new(),
        }
    }

    pub fn with_price(mut self, outcome: Outcome, price: Decimal) -> Self {
        self.prices.insert(outcome, price);
        self
    }

    pub fn mark(&self, outcome: Outcome) -> Option<Decimal> {
        self.prices.get(&outcome).copied().filter(|p| *p > Decimal::ZERO)
    }
}

/// Venue-reported order book condition for an outcome token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookHealth {
    pub healthy: bool,
    pub reason: Option<String>,
    pub spread: Option<Decimal>,
}

impl BookHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            reason: None,
            spread: None,
        }
    }

    pub fn unhealthy(reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            reason: Some(reason.into()),
            spread: None,
        }
    }
}
