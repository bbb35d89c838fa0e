use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{MarketCategory, Outcome};

/// Identity of a position in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PositionKey {
    /// One-sided copy of a whale's outcome purchase.
    Directional { market_id: String, outcome: Outcome },
    /// Two-sided position holding both outcomes of one market.
    Paired { market_id: String },
}

impl PositionKey {
    pub fn directional(market_id: impl Into<String>, outcome: Outcome) -> Self {
        PositionKey::Directional {
            market_id: market_id.into(),
            outcome,
        }
    }

    pub fn paired(market_id: impl Into<String>) -> Self {
        PositionKey::Paired {
            market_id: market_id.into(),
        }
    }

    pub fn market_id(&self) -> &str {
        match self {
            PositionKey::Directional { market_id, .. } | PositionKey::Paired { market_id } => {
                market_id
            }
        }
    }

    /// Stable string form used as the key of the persisted position map.
    pub fn storage_key(&self) -> String {
        match self {
            PositionKey::Directional { market_id, outcome } => {
                format!("copy_{market_id}_{outcome}")
            }
            PositionKey::Paired { market_id } => market_id.clone(),
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    ClosedTakeProfit,
    ClosedStopLoss,
    ClosedExit,
    SettledYes,
    SettledNo,
}

impl PositionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, PositionStatus::Open)
    }

    pub fn settled(winner: Outcome) -> Self {
        match winner {
            Outcome::Yes => PositionStatus::SettledYes,
            Outcome::No => PositionStatus::SettledNo,
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::ClosedTakeProfit => "CLOSED_TAKE_PROFIT",
            PositionStatus::ClosedStopLoss => "CLOSED_STOP_LOSS",
            PositionStatus::ClosedExit => "CLOSED_EXIT",
            PositionStatus::SettledYes => "SETTLED_YES",
            PositionStatus::SettledNo => "SETTLED_NO",
        };
        f.write_str(s)
    }
}

/// Holdings in one outcome token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub outcome: Outcome,
    pub asset_id: String,
    pub size: Decimal,
    /// Volume-weighted average fill price.
    pub avg_price: Decimal,
}

impl Leg {
    pub fn new(outcome: Outcome, asset_id: impl Into<String>, price: Decimal, size: Decimal) -> Self {
        Self {
            outcome,
            asset_id: asset_id.into(),
            size,
            avg_price: price,
        }
    }

    /// Average a new fill into this leg.
    pub fn average_in(&mut self, price: Decimal, size: Decimal) {
        let new_size = self.size + size;
        if new_size > Decimal::ZERO {
            self.avg_price = (self.avg_price * self.size + price * size) / new_size;
        }
        self.size = new_size;
    }
}

/// A ledger position. Directional positions have one leg, paired positions two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub key: PositionKey,
    pub market_id: String,
    pub market_title: Option<String>,
    pub legs: Vec<Leg>,
    /// Sum of price * size + fee over every fill.
    pub total_cost: Decimal,
    pub total_fees: Decimal,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub realized_pnl: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub settlement_value: Option<Decimal>,
    pub source_wallet: Option<String>,
    #[serde(default)]
    pub category: MarketCategory,
    /// Most recent mark price of the held outcome.
    #[serde(default)]
    pub mark_price: Option<Decimal>,
    pub fill_count: u32,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn is_paired(&self) -> bool {
        matches!(self.key, PositionKey::Paired { .. })
    }

    pub fn leg(&self, outcome: Outcome) -> Option<&Leg> {
        self.legs.iter().find(|l| l.outcome == outcome)
    }

    pub fn leg_mut(&mut self, outcome: Outcome) -> Option<&mut Leg> {
        self.legs.iter_mut().find(|l| l.outcome == outcome)
    }

    /// Outcome held by a directional position.
    pub fn held_outcome(&self) -> Option<Outcome> {
        match &self.key {
            PositionKey::Directional { outcome, .. } => Some(*outcome),
            PositionKey::Paired { .. } => None,
        }
    }

    /// Shares of the held outcome (directional) or of the smaller leg (paired).
    pub fn size(&self) -> Decimal {
        match self.held_outcome() {
            Some(outcome) => self.leg(outcome).map(|l| l.size).unwrap_or(Decimal::ZERO),
            None => self.locked_shares(),
        }
    }

    pub fn avg_price(&self) -> Decimal {
        match self.held_outcome() {
            Some(outcome) => self.leg(outcome).map(|l| l.avg_price).unwrap_or(Decimal::ZERO),
            None => self.legs.iter().map(|l| l.avg_price).sum(),
        }
    }

    /// Shares guaranteed to pay out on a paired position, whichever side wins.
    pub fn locked_shares(&self) -> Decimal {
        self.legs
            .iter()
            .map(|l| l.size)
            .min()
            .unwrap_or(Decimal::ZERO)
    }

    /// Settlement payout at 1 USDC per winning share.
    pub fn payout_for(&self, winner: Outcome) -> Decimal {
        self.leg(winner).map(|l| l.size).unwrap_or(Decimal::ZERO)
    }

    /// Mark-to-market return on cost for a directional position.
    pub fn pnl_pct_at(&self, mark: Decimal) -> Option<Decimal> {
        if self.total_cost <= Decimal::ZERO {
            return None;
        }
        Some((mark * self.size() - self.total_cost) / self.total_cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directional(size: i64, price: Decimal, cost: Decimal) -> Position {
        Position {
            id: Uuid::new_v4(),
            key: PositionKey::directional("0xmarket", Outcome::Yes),
            market_id: "0xmarket".into(),
            market_title: None,
            legs: vec![Leg::new(Outcome::Yes, "111", price, Decimal::from(size))],
            total_cost: cost,
            total_fees: Decimal::ZERO,
            status: PositionStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
            realized_pnl: None,
            exit_price: None,
            settlement_value: None,
            source_wallet: None,
            category: MarketCategory::Unknown,
            mark_price: None,
            fill_count: 1,
        }
    }

    #[test]
    fn test_leg_average_in() {
        let mut leg = Leg::new(Outcome::Yes, "1", Decimal::new(40, 2), Decimal::from(10));
        leg.average_in(Decimal::new(60, 2), Decimal::from(30));
        // (0.40*10 + 0.60*30) / 40 = 22 / 40 = 0.55
        assert_eq!(leg.avg_price, Decimal::new(55, 2));
        assert_eq!(leg.size, Decimal::from(40));
    }

    #[test]
    fn test_storage_keys() {
        assert_eq!(
            PositionKey::directional("0xabc", Outcome::No).storage_key(),
            "copy_0xabc_NO"
        );
        assert_eq!(PositionKey::paired("0xabc").storage_key(), "0xabc");
    }

    #[test]
    fn test_pnl_pct() {
        let pos = directional(100, Decimal::new(50, 2), Decimal::from(50));
        // mark 0.60 -> value 60, cost 50 -> +20%
        assert_eq!(pos.pnl_pct_at(Decimal::new(60, 2)), Some(Decimal::new(2, 1)));
    }

    #[test]
    fn test_paired_locked_shares_and_payout() {
        let mut pos = directional(10, Decimal::new(45, 2), Decimal::from(9));
        pos.key = PositionKey::paired("0xmarket");
        pos.legs.push(Leg::new(Outcome::No, "222", Decimal::new(50, 2), Decimal::from(8)));
        assert_eq!(pos.locked_shares(), Decimal::from(8));
        assert_eq!(pos.payout_for(Outcome::Yes), Decimal::from(10));
        assert_eq!(pos.payout_for(Outcome::No), Decimal::from(8));
        assert_eq!(pos.held_outcome(), None);
    }
}
