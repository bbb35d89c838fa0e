use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

use crate::config::{RiskConfig, SizingConfig};
use crate::errors::Rejection;
use crate::intelligence::WalletQuality;

use super::stress::StressTag;

/// How the copy budget was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizingMethod {
    /// Fraction of the whale's notional scaled by signal score.
    Proportional,
    /// Half-Kelly from the wallet's settled record in the category.
    Kelly,
}

impl fmt::Display for SizingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizingMethod::Proportional => write!(f, "proportional"),
            SizingMethod::Kelly => write!(f, "kelly"),
        }
    }
}

/// Balance-proportional caps for the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DynamicLimits {
    pub growth: Decimal,
    pub max_exposure: Decimal,
    pub max_per_market: Decimal,
    pub copy_min: Decimal,
    pub copy_max: Decimal,
}

/// Risk percentages step up as the account grows past its starting balance.
pub fn growth_multiplier(balance: Decimal, starting_balance: Decimal) -> Decimal {
    let growth = balance / starting_balance.max(Decimal::ONE);
    if growth >= Decimal::from(3) {
        Decimal::TWO
    } else if growth >= Decimal::TWO {
        Decimal::new(15, 1)
    } else if growth >= Decimal::new(15, 1) {
        Decimal::new(125, 2)
    } else {
        Decimal::ONE
    }
}

pub fn compute_limits(risk: &RiskConfig, balance: Decimal, starting_balance: Decimal) -> DynamicLimits {
    let growth = growth_multiplier(balance, starting_balance);
    DynamicLimits {
        growth,
        max_exposure: balance * risk.exposure_pct * growth,
        max_per_market: balance * risk.market_pct * growth,
        copy_min: (balance * risk.min_trade_pct * growth).max(risk.min_trade_floor),
        copy_max: (balance * risk.max_trade_pct * growth).max(risk.max_trade_floor),
    }
}

/// Full Kelly fraction `(p*b - q) / b` with a Beta(2, 2) posterior win rate.
/// `None` when the price leaves no upside.
pub fn kelly_fraction(wins: u32, losses: u32, price: Decimal) -> Option<Decimal> {
    if price <= Decimal::ZERO || price >= Decimal::ONE {
        return None;
    }
    let p = (Decimal::TWO + Decimal::from(wins)) / (Decimal::from(4 + wins + losses));
    let q = Decimal::ONE - p;
    let b = Decimal::ONE / price - Decimal::ONE;
    if b <= Decimal::ZERO {
        return None;
    }
    Some((p * b - q) / b)
}

/// 1.0 for a score of 1, +0.25 per point, capped at 2.0.
pub fn score_multiplier(score: u8) -> Decimal {
    let steps = score.saturating_sub(1).min(4);
    Decimal::ONE + Decimal::from(steps) * Decimal::new(25, 2)
}

/// Everything the sizer needs to know about one entry.
#[derive(Debug, Clone)]
pub struct SizingInput<'a> {
    pub usdc_value: Decimal,
    pub whale_price: Decimal,
    pub score: u8,
    pub quality: &'a WalletQuality,
    pub balance: Decimal,
    pub starting_balance: Decimal,
    pub current_exposure: Decimal,
    /// Cost already committed to open positions in this market.
    pub market_cost: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizeDecision {
    pub budget: Decimal,
    pub method: SizingMethod,
    pub limits: DynamicLimits,
}

/// Copy budget for an entry, clamped to the trade band and to the remaining
/// exposure and per-market room.
pub fn size_copy(
    sizing: &SizingConfig,
    risk: &RiskConfig,
    input: &SizingInput<'_>,
) -> Result<SizeDecision, Rejection> {
    let limits = compute_limits(risk, input.balance, input.starting_balance);

    if input.current_exposure >= limits.max_exposure {
        return Err(Rejection::ExposureFull);
    }
    if input.market_cost >= limits.max_per_market {
        return Err(Rejection::MarketCapReached);
    }

    let wallet_mult = input.quality.multiplier;
    let kelly = if input.quality.category_settled >= sizing.kelly_min_settled {
        kelly_fraction(
            input.quality.category_wins,
            input.quality.category_losses,
            input.whale_price,
        )
        .map(|k| (k * sizing.kelly_scale).max(Decimal::ZERO))
        .filter(|scaled| *scaled > Decimal::ZERO)
    } else {
        None
    };

    let (raw, method) = match kelly {
        Some(fraction) => (input.balance * fraction * wallet_mult, SizingMethod::Kelly),
        None if input.usdc_value > Decimal::ZERO => (
            input.usdc_value * sizing.copy_ratio * score_multiplier(input.score) * wallet_mult,
            SizingMethod::Proportional,
        ),
        None => (limits.copy_min, SizingMethod::Proportional),
    };
    let mut budget = raw.clamp(limits.copy_min, limits.copy_max.max(limits.copy_min));

    let room = limits.max_exposure - input.current_exposure;
    budget = budget.min(room);
    if budget < limits.copy_min {
        return Err(Rejection::BelowMinimum {
            budget: budget.round_dp(4),
            min: limits.copy_min,
        });
    }

    let market_room = limits.max_per_market - input.market_cost;
    budget = budget.min(market_room);
    if budget < limits.copy_min {
        return Err(Rejection::BelowMinimum {
            budget: budget.round_dp(4),
            min: limits.copy_min,
        });
    }

    Ok(SizeDecision {
        budget,
        method,
        limits,
    })
}

/// Scale a budget by the whale's gas bid: a premium bid signals conviction.
pub fn gas_conviction(sizing: &SizingConfig, gas_price_gwei: Option<Decimal>) -> (Decimal, Option<StressTag>) {
    match gas_price_gwei {
        Some(gwei) if gwei > sizing.high_gas_gwei => {
            (sizing.high_gas_multiplier, Some(StressTag::HighGasConviction))
        }
        Some(gwei) if gwei > Decimal::ZERO && gwei < sizing.low_gas_gwei => {
            (sizing.low_gas_multiplier, Some(StressTag::LowGasConviction))
        }
        _ => (Decimal::ONE, None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(quality: &'a WalletQuality) -> SizingInput<'a> {
        SizingInput {
            usdc_value: Decimal::from(100),
            whale_price: Decimal::new(50, 2),
            score: 1,
            quality,
            balance: Decimal::from(100),
            starting_balance: Decimal::from(100),
            current_exposure: Decimal::ZERO,
            market_cost: Decimal::ZERO,
        }
    }

    #[test]
    fn test_growth_steps() {
        let start = Decimal::from(100);
        assert_eq!(growth_multiplier(Decimal::from(149), start), Decimal::ONE);
        assert_eq!(growth_multiplier(Decimal::from(150), start), Decimal::new(125, 2));
        assert_eq!(growth_multiplier(Decimal::from(200), start), Decimal::new(15, 1));
        assert_eq!(growth_multiplier(Decimal::from(300), start), Decimal::TWO);
    }

    #[test]
    fn test_limits_floor_small_balances() {
        let limits = compute_limits(&RiskConfig::default(), Decimal::from(10), Decimal::from(10));
        // 1% of 10 = 0.10 -> floored to 0.25; 3% = 0.30 -> floored to 0.50
        assert_eq!(limits.copy_min, Decimal::new(25, 2));
        assert_eq!(limits.copy_max, Decimal::new(50, 2));
        assert_eq!(limits.max_exposure, Decimal::from(5));
    }

    #[test]
    fn test_kelly_fraction() {
        // p = (2+8)/(4+10) = 5/7, b = 1 at price 0.5 -> kelly = 2p - 1 = 3/7
        let k = kelly_fraction(8, 2, Decimal::new(5, 1)).unwrap();
        assert_eq!(k.round_dp(6), Decimal::new(428571, 6));
        // Losing record gives a negative edge.
        assert!(kelly_fraction(1, 9, Decimal::new(5, 1)).unwrap() < Decimal::ZERO);
        assert!(kelly_fraction(5, 0, Decimal::ONE).is_none());
    }

    #[test]
    fn test_score_multiplier() {
        assert_eq!(score_multiplier(0), Decimal::ONE);
        assert_eq!(score_multiplier(1), Decimal::ONE);
        assert_eq!(score_multiplier(3), Decimal::new(15, 1));
        assert_eq!(score_multiplier(9), Decimal::TWO);
    }

    #[test]
    fn test_proportional_budget_clamped_to_band() {
        let quality = WalletQuality::neutral();
        let decision = size_copy(&SizingConfig::default(), &RiskConfig::default(), &input(&quality)).unwrap();
        // 100 * 0.01 = 1.00, inside [1, 3]
        assert_eq!(decision.method, SizingMethod::Proportional);
        assert_eq!(decision.budget, Decimal::ONE);

        let mut big = input(&quality);
        big.usdc_value = Decimal::from(10_000);
        let decision = size_copy(&SizingConfig::default(), &RiskConfig::default(), &big).unwrap();
        assert_eq!(decision.budget, Decimal::from(3));
    }

    #[test]
    fn test_kelly_used_with_enough_history() {
        let quality = WalletQuality {
            category_settled: 10,
            category_wins: 8,
            category_losses: 2,
            ..WalletQuality::neutral()
        };
        let decision = size_copy(&SizingConfig::default(), &RiskConfig::default(), &input(&quality)).unwrap();
        assert_eq!(decision.method, SizingMethod::Kelly);
        // 100 * 3/14 = 21.4 -> clamped to copy_max 3
        assert_eq!(decision.budget, Decimal::from(3));
    }

    #[test]
    fn test_negative_kelly_falls_back() {
        let quality = WalletQuality {
            category_settled: 10,
            category_wins: 1,
            category_losses: 9,
            ..WalletQuality::neutral()
        };
        let decision = size_copy(&SizingConfig::default(), &RiskConfig::default(), &input(&quality)).unwrap();
        assert_eq!(decision.method, SizingMethod::Proportional);
    }

    #[test]
    fn test_room_clamps() {
        let quality = WalletQuality::neutral();
        let mut near_full = input(&quality);
        near_full.usdc_value = Decimal::from(10_000);
        near_full.current_exposure = Decimal::new(485, 1); // room 1.5
        let decision = size_copy(&SizingConfig::default(), &RiskConfig::default(), &near_full).unwrap();
        assert_eq!(decision.budget, Decimal::new(15, 1));

        near_full.current_exposure = Decimal::new(495, 1); // room 0.5 < min 1
        assert!(matches!(
            size_copy(&SizingConfig::default(), &RiskConfig::default(), &near_full),
            Err(Rejection::BelowMinimum { .. })
        ));

        near_full.current_exposure = Decimal::from(50);
        assert!(matches!(
            size_copy(&SizingConfig::default(), &RiskConfig::default(), &near_full),
            Err(Rejection::ExposureFull)
        ));

        let mut crowded = input(&quality);
        crowded.market_cost = Decimal::from(6);
        assert!(matches!(
            size_copy(&SizingConfig::default(), &RiskConfig::default(), &crowded),
            Err(Rejection::MarketCapReached)
        ));
    }

    #[test]
    fn test_gas_conviction() {
        let cfg = SizingConfig::default();
        assert_eq!(
            gas_conviction(&cfg, Some(Decimal::from(250))),
            (Decimal::new(15, 1), Some(StressTag::HighGasConviction))
        );
        assert_eq!(
            gas_conviction(&cfg, Some(Decimal::from(30))),
            (Decimal::new(75, 2), Some(StressTag::LowGasConviction))
        );
        assert_eq!(gas_conviction(&cfg, Some(Decimal::from(100))), (Decimal::ONE, None));
        assert_eq!(gas_conviction(&cfg, None), (Decimal::ONE, None));
    }
}
