use rust_decimal::Decimal;
use std::path::PathBuf;
use thiserror::Error;

use crate::execution::risk_guard::RiskViolation;
use crate::execution::stress::StressRejection;

/// A raw event that could not be turned into a `TradeSignal`. Always terminal:
/// the event is dropped and counted.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid number in {field}: {value}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("exactly one side of a fill must be USDC")]
    AmbiguousAssets,

    #[error("zero fill amount")]
    ZeroAmount,

    #[error("price {0} outside (0, 1)")]
    PriceOutOfRange(Decimal),

    #[error("unknown asset: {0}")]
    UnknownAsset(String),

    #[error("wallet is not a party to the fill")]
    NotTracked,

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures of a feed worker's transport. Retryable kinds back off and reconnect.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("connection closed by server")]
    Closed,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("unexpected payload: {0}")]
    Schema(String),
}

impl FeedError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FeedError::WebSocket(_) | FeedError::Closed | FeedError::Timeout(_) => true,
            FeedError::Http(e) => match e.status() {
                Some(status) => status.is_server_error() || status.as_u16() == 429,
                None => true,
            },
            FeedError::Rpc(_) => true,
            FeedError::Schema(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("market not found: {0}")]
    NotFound(String),

    #[error("parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("no state file at {0}")]
    Missing(PathBuf),

    #[error("no valid state for {path} after trying {tried} candidates")]
    NoValidState { path: PathBuf, tried: usize },

    #[error("state writer task failed: {0}")]
    Writer(#[from] tokio::task::JoinError),
}

impl StateError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Business reasons for declining an entry or exit. Carried as the `reason` of a
/// failed `ExecutionResult`; never mutates state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("invalid price {0}")]
    InvalidPrice(Decimal),

    #[error("anonymous signal")]
    Anonymous,

    #[error("hedge blocked: open position on the opposite outcome")]
    HedgeBlocked,

    #[error("wallet {0} cut off")]
    WalletCutOff(String),

    #[error("budget {budget} below minimum {min}")]
    BelowMinimum { budget: Decimal, min: Decimal },

    #[error("exposure cap reached")]
    ExposureFull,

    #[error("per-market cap reached")]
    MarketCapReached,

    #[error("unhealthy book: {0}")]
    UnhealthyBook(String),

    #[error("market past expiry")]
    PastExpiry,

    #[error("market expires in {0:.1} minutes")]
    NearExpiry(f64),

    #[error("winner's curse: {pct}% above whale price")]
    WinnersCurse { pct: Decimal },

    #[error("insufficient balance: need {needed}, have {available}")]
    InsufficientBalance { needed: Decimal, available: Decimal },

    #[error("no open position")]
    NoOpenPosition,

    #[error(transparent)]
    Risk(#[from] RiskViolation),

    #[error(transparent)]
    Stress(#[from] StressRejection),
}

impl Rejection {
    /// Short stable label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::InvalidPrice(_) => "invalid_price",
            Rejection::Anonymous => "anonymous",
            Rejection::HedgeBlocked => "hedge",
            Rejection::WalletCutOff(_) => "wallet_cutoff",
            Rejection::BelowMinimum { .. } => "below_minimum",
            Rejection::ExposureFull => "exposure",
            Rejection::MarketCapReached => "market_cap",
            Rejection::UnhealthyBook(_) => "book",
            Rejection::PastExpiry | Rejection::NearExpiry(_) => "expiry",
            Rejection::WinnersCurse { .. } => "winners_curse",
            Rejection::InsufficientBalance { .. } => "balance",
            Rejection::NoOpenPosition => "no_position",
            Rejection::Risk(_) => "risk",
            Rejection::Stress(_) => "stress",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_reasons() {
        assert!(Rejection::WalletCutOff("0xabc".into())
            .to_string()
            .contains("cut off"));
        let r = Rejection::InsufficientBalance {
            needed: Decimal::from(10),
            available: Decimal::from(5),
        };
        assert!(r.to_string().starts_with("insufficient balance"));
        assert_eq!(Rejection::NoOpenPosition.to_string(), "no open position");
    }

    #[test]
    fn test_feed_error_retryable() {
        assert!(FeedError::Closed.is_retryable());
        assert!(FeedError::Timeout("pong").is_retryable());
        assert!(!FeedError::Schema("bad".into()).is_retryable());
    }
}
