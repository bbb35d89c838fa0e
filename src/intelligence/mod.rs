pub mod classifier;
pub mod scorer;

use rust_decimal::Decimal;

use crate::models::MarketCategory;

pub use classifier::classify_market;
pub use scorer::{WalletBook, WalletRanking};

/// Sizing inputs for one wallet in one market category.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletQuality {
    /// Budget multiplier in [0, 3].
    pub multiplier: Decimal,
    /// Proven loser: stop copying.
    pub cut_off: bool,
    /// Settled copies in this category, the Kelly gate.
    pub category_settled: u32,
    pub category_wins: u32,
    pub category_losses: u32,
}

impl WalletQuality {
    /// Quality of a wallet we know nothing about.
    pub fn neutral() -> Self {
        Self {
            multiplier: Decimal::ONE,
            cut_off: false,
            category_settled: 0,
            category_wins: 0,
            category_losses: 0,
        }
    }
}

/// Scores whales from the results of copying them.
pub trait WalletClassifier: Send + Sync {
    fn quality(&self, wallet: &str, category: MarketCategory) -> WalletQuality;

    /// Category of a market, cached by id once classified.
    fn market_category(&self, market_id: &str, title: Option<&str>) -> MarketCategory;

    fn record_entry(&self, wallet: &str, category: MarketCategory, cost: Decimal);

    fn record_result(&self, wallet: &str, category: MarketCategory, realized_pnl: Decimal);

    /// Write any durable state now.
    fn flush(&self) {}
}
