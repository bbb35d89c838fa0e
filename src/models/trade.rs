use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Outcome, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FillKind {
    Copy,
    CopyExit,
    TakeProfit,
    StopLoss,
    Paired,
}

/// One simulated fill, kept in the ledger's bounded trade history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillRecord {
    pub fill_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub market_id: String,
    pub market_title: Option<String>,
    pub asset_id: String,
    pub outcome: Outcome,
    pub side: Side,
    pub kind: FillKind,
    pub price: Decimal,
    pub size: Decimal,
    /// Trading fee plus gas.
    pub fee: Decimal,
    pub fee_rate_bps: u32,
    /// Our price minus the reference (whale or mark) price, signed against us.
    pub slippage: Decimal,
    pub source_wallet: Option<String>,
    pub score: Option<u8>,
    pub realized_pnl: Option<Decimal>,
}

/// Outcome of every entry/exit request. Rejections carry a reason and never
/// mutate state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fees: Option<Decimal>,
    /// Realized PnL for exits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<Decimal>,
}

impl ExecutionResult {
    pub fn rejected(reason: impl ToString) -> Self {
        Self {
            success: false,
            reason: Some(reason.to_string()),
            cost: None,
            price: None,
            size: None,
            fees: None,
            realized_pnl: None,
        }
    }

    pub fn filled(cost: Decimal, price: Decimal, size: Decimal, fees: Decimal) -> Self {
        Self {
            success: true,
            reason: None,
            cost: Some(cost),
            price: Some(price),
            size: Some(size),
            fees: Some(fees),
            realized_pnl: None,
        }
    }

    pub fn with_pnl(mut self, pnl: Decimal) -> Self {
        self.realized_pnl = Some(pnl);
        self
    }

    pub fn reason_str(&self) -> &str {
        self.reason.as_deref().unwrap_or("")
    }
}

/// Point-in-time portfolio valuation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cash_balance: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_value: Decimal,
    pub open_positions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_result_serializes_without_amounts() {
        let r = ExecutionResult::rejected("insufficient balance");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["reason"], "insufficient balance");
        assert!(json.get("cost").is_none());
    }

    #[test]
    fn test_filled_result() {
        let r = ExecutionResult::filled(Decimal::from(10), Decimal::new(5, 1), Decimal::from(19), Decimal::new(5, 1))
            .with_pnl(Decimal::ONE);
        assert!(r.success);
        assert_eq!(r.reason_str(), "");
        assert_eq!(r.realized_pnl, Some(Decimal::ONE));
    }
}
