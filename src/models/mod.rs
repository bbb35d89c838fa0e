pub mod market;
pub mod position;
pub mod signal;
pub mod trade;

pub use market::{AssetInfo, BookHealth, MarketCategory, MarketInfo, MarketResolution};
pub use position::{Leg, Position, PositionKey, PositionStatus};
pub use signal::{CanonicalId, TradeSignal};
pub use trade::{ExecutionResult, FillKind, FillRecord, PnlSnapshot};

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" | "0" => Some(Side::Buy),
            "SELL" | "1" => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// One of the two outcome tokens of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    /// Parse an outcome label. Binary "Up/Down" markets map Up to the first token.
    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "YES" | "UP" | "0" => Some(Outcome::Yes),
            "NO" | "DOWN" | "1" => Some(Outcome::No),
            _ => None,
        }
    }

    /// Outcome for a token index within a market's token list.
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Outcome::Yes),
            1 => Some(Outcome::No),
            _ => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Yes => write!(f, "YES"),
            Outcome::No => write!(f, "NO"),
        }
    }
}

// ---------------------------------------------------------------------------
// SignalSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    Chain,
    Stream,
    Poll,
}

impl SignalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSource::Chain => "chain",
            SignalSource::Stream => "stream",
            SignalSource::Poll => "poll",
        }
    }
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_parsing() {
        assert_eq!(Outcome::from_api_str("Yes"), Some(Outcome::Yes));
        assert_eq!(Outcome::from_api_str(" no "), Some(Outcome::No));
        assert_eq!(Outcome::from_api_str("Up"), Some(Outcome::Yes));
        assert_eq!(Outcome::from_api_str("Lakers"), None);
        assert_eq!(Outcome::from_index(1), Some(Outcome::No));
        assert_eq!(Outcome::from_index(2), None);
    }

    #[test]
    fn test_outcome_opposite() {
        assert_eq!(Outcome::Yes.opposite(), Outcome::No);
        assert_eq!(Outcome::No.opposite(), Outcome::Yes);
    }

    #[test]
    fn test_side_parsing() {
        assert_eq!(Side::from_api_str("buy"), Some(Side::Buy));
        assert_eq!(Side::from_api_str("1"), Some(Side::Sell));
        assert_eq!(Side::from_api_str("hold"), None);
    }
}
