use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::{Outcome, Side, SignalSource};

/// Characters of the wallet address that participate in a fingerprint.
const WALLET_PREFIX_LEN: usize = 12;
/// Characters of the market id that participate in a fingerprint.
const MARKET_PREFIX_LEN: usize = 18;

/// Identity of an observed trade, used for cross-source deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CanonicalId {
    /// On-chain fill: exact identity from the log position.
    Chain {
        chain_id: u64,
        tx_hash: String,
        log_index: u64,
    },
    /// Hash of (wallet prefix, market prefix, outcome, rounded price, time bucket).
    Hashed { digest: String },
}

impl CanonicalId {
    pub fn chain(chain_id: u64, tx_hash: &str, log_index: u64) -> Self {
        CanonicalId::Chain {
            chain_id,
            tx_hash: tx_hash.to_lowercase(),
            log_index,
        }
    }

    /// Fingerprint a trade observation. Two observations of the same trade from
    /// different sources land on the same digest as long as their timestamps fall
    /// into the same bucket.
    pub fn fingerprint(
        wallet: &str,
        market_id: &str,
        outcome: Outcome,
        price: Decimal,
        timestamp: DateTime<Utc>,
        bucket_secs: i64,
    ) -> Self {
        let bucket = time_bucket(timestamp, bucket_secs);
        Self::fingerprint_for_bucket(wallet, market_id, outcome, price, bucket)
    }

    pub fn fingerprint_for_bucket(
        wallet: &str,
        market_id: &str,
        outcome: Outcome,
        price: Decimal,
        bucket: i64,
    ) -> Self {
        let wallet = wallet.to_lowercase();
        let market = market_id.to_lowercase();
        let material = format!(
            "{}|{}|{}|{}|{}",
            prefix(&wallet, WALLET_PREFIX_LEN),
            prefix(&market, MARKET_PREFIX_LEN),
            outcome,
            price.round_dp(2).normalize(),
            bucket,
        );
        Self::hashed(&material)
    }

    /// Hash arbitrary identity material, e.g. for prints with no wallet.
    pub fn hashed(material: &str) -> Self {
        let digest = Sha256::digest(material.as_bytes());
        CanonicalId::Hashed {
            digest: format!("{digest:x}"),
        }
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanonicalId::Chain {
                chain_id,
                tx_hash,
                log_index,
            } => write!(f, "chain:{chain_id}:{tx_hash}:{log_index}"),
            CanonicalId::Hashed { digest } => write!(f, "fp:{}", prefix(digest, 16)),
        }
    }
}

pub fn time_bucket(timestamp: DateTime<Utc>, bucket_secs: i64) -> i64 {
    timestamp.timestamp().div_euclid(bucket_secs.max(1))
}

fn prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// A normalized whale trade observation, identical in shape for every source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub source: SignalSource,
    /// Whale wallet, lowercase. Empty for anonymous stream prints.
    pub wallet: String,
    /// Market condition id.
    pub market_id: String,
    /// Outcome token id.
    pub asset_id: String,
    pub market_title: Option<String>,
    pub outcome: Outcome,
    pub side: Side,
    /// Whale's price per outcome token, in (0, 1).
    pub price: Decimal,
    /// Outcome tokens traded by the whale.
    pub raw_size: Decimal,
    /// USDC notional of the whale's trade.
    pub usdc_value: Decimal,
    pub whale_timestamp: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub canonical_id: CanonicalId,
    pub score: u8,
    pub tx_hash: Option<String>,
    pub gas_price_gwei: Option<Decimal>,
}

impl TradeSignal {
    pub fn is_anonymous(&self) -> bool {
        self.wallet.is_empty()
    }

    /// Seconds between the whale's trade and `now`, never negative.
    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        let ms = (now - self.whale_timestamp).num_milliseconds().max(0);
        ms as f64 / 1000.0
    }

    /// Hashed fingerprint of this observation, independent of its source.
    pub fn fingerprint(&self, bucket_secs: i64) -> CanonicalId {
        CanonicalId::fingerprint(
            &self.wallet,
            &self.market_id,
            self.outcome,
            self.price,
            self.whale_timestamp,
            bucket_secs,
        )
    }
}

impl fmt::Display for TradeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Signal[{}]: wallet={} market={} {} {} price={} usdc={}",
            self.source,
            prefix(&self.wallet, 10),
            prefix(&self.market_id, 10),
            self.side,
            self.outcome,
            self.price,
            self.usdc_value,
        )
    }
}
