use rust_decimal::Decimal;

const BPS_DENOMINATOR: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

/// Share of positive net profit lost when cashing out.
pub fn withdrawal_haircut_rate() -> Decimal {
    Decimal::new(2, 2)
}

/// Venue taker fee for `size` shares at `price`.
///
/// The fee scales with `p * (1 - p)`, so it peaks at 0.50 and vanishes toward
/// the extremes of the book.
pub fn trading_fee(price: Decimal, size: Decimal, fee_rate_bps: u32) -> Decimal {
    if price <= Decimal::ZERO || price >= Decimal::ONE || size <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let rate = Decimal::from(fee_rate_bps) / BPS_DENOMINATOR;
    rate * price * (Decimal::ONE - price) * size
}

/// Fee rate to charge when the venue lookup fails or reports zero.
pub fn effective_fee_bps(reported: Option<u32>, default_bps: u32) -> u32 {
    match reported {
        Some(bps) if bps > 0 => bps,
        _ => default_bps,
    }
}

/// Amount withheld from a withdrawal of `net_profit`. Losses are never charged.
pub fn withdrawal_haircut(net_profit: Decimal) -> Decimal {
    if net_profit <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    net_profit * withdrawal_haircut_rate()
}
