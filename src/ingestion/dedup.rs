use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::DedupConfig;
use crate::models::signal::time_bucket;
use crate::models::{CanonicalId, TradeSignal};

#[derive(Debug, Default)]
struct DedupInner {
    /// canonical id -> first-seen time
    seen: HashMap<CanonicalId, DateTime<Utc>>,
    accepted: u64,
    duplicates: u64,
}

impl DedupInner {
    fn purge_expired(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.seen.retain(|_, first_seen| now - *first_seen < ttl);
    }

    fn is_live(&self, id: &CanonicalId) -> bool {
        self.seen.contains_key(id)
    }
}

/// Cross-source at-most-once filter. Every accepted signal records both its
/// canonical id and its source-independent fingerprint for `ttl`.
#[derive(Debug)]
pub struct DedupStore {
    inner: Mutex<DedupInner>,
    ttl: Duration,
    bucket_secs: i64,
}

impl DedupStore {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            inner: Mutex::new(DedupInner::default()),
            ttl: Duration::from_std(config.ttl).unwrap_or(Duration::minutes(30)),
            bucket_secs: config.bucket_secs.max(1),
        }
    }

    /// Accept `signal` if neither its id nor its fingerprint (in the current,
    /// previous or next time bucket) has been seen within the TTL.
    pub fn record_or_reject(&self, signal: &TradeSignal, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.purge_expired(now, self.ttl);

        let bucket = time_bucket(signal.whale_timestamp, self.bucket_secs);
        let fingerprints: Vec<CanonicalId> = if signal.is_anonymous() {
            Vec::new()
        } else {
            (bucket - 1..=bucket + 1)
                .map(|b| {
                    CanonicalId::fingerprint_for_bucket(
                        &signal.wallet,
                        &signal.market_id,
                        signal.outcome,
                        signal.price,
                        b,
                    )
                })
                .collect()
        };

        let duplicate =
            inner.is_live(&signal.canonical_id) || fingerprints.iter().any(|f| inner.is_live(f));
        if duplicate {
            inner.duplicates += 1;
            metrics::counter!("signals_duplicate_total").increment(1);
            tracing::debug!(
                id = %signal.canonical_id,
                source = %signal.source,
                wallet = %signal.wallet,
                "Duplicate signal rejected"
            );
            return false;
        }

        inner.seen.insert(signal.canonical_id.clone(), now);
        if let Some(own) = fingerprints.get(1) {
            inner.seen.insert(own.clone(), now);
        }
        inner.accepted += 1;
        true
    }

    /// Probe without recording; decoders use this to skip re-decoding.
    pub fn is_known(&self, id: &CanonicalId, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.purge_expired(now, self.ttl);
        inner.is_live(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (accepted, duplicates) since start.
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        (inner.accepted, inner.duplicates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Outcome, Side, SignalSource};
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn signal(source: SignalSource, id: CanonicalId, ts: DateTime<Utc>) -> TradeSignal {
        TradeSignal {
            source,
            wallet: "0xwhale".into(),
            market_id: "0xmarket".into(),
            asset_id: "111".into(),
            market_title: None,
            outcome: Outcome::Yes,
            side: Side::Buy,
            price: Decimal::new(52, 2),
            raw_size: Decimal::from(100),
            usdc_value: Decimal::from(52),
            whale_timestamp: ts,
            detected_at: ts,
            canonical_id: id,
            score: 1,
            tx_hash: None,
            gas_price_gwei: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
    }

    #[test]
    fn test_same_id_rejected_within_ttl() {
        let store = DedupStore::new(&DedupConfig::default());
        let id = CanonicalId::chain(137, "0xabc", 1);
        let s = signal(SignalSource::Chain, id, t0());
        assert!(store.record_or_reject(&s, t0()));
        assert!(!store.record_or_reject(&s, t0() + Duration::seconds(10)));
        assert_eq!(store.stats(), (1, 1));
    }

    #[test]
    fn test_expired_id_accepted_again() {
        let store = DedupStore::new(&DedupConfig::default());
        let id = CanonicalId::chain(137, "0xabc", 1);
        let s = signal(SignalSource::Chain, id.clone(), t0());
        assert!(store.record_or_reject(&s, t0()));
        let later = t0() + Duration::seconds(1801);
        assert!(!store.is_known(&id, later));
        assert!(store.record_or_reject(&s, later));
    }

    #[test]
    fn test_cross_source_fingerprint_match_across_bucket_edge() {
        let store = DedupStore::new(&DedupConfig::default());
        // Chain sees the trade at :59, the poller reports it at :01 of the next minute.
        let chain_ts = Utc.timestamp_opt(1_700_000_039, 0).single().unwrap();
        let poll_ts = chain_ts + Duration::seconds(2);
        let chain = signal(SignalSource::Chain, CanonicalId::chain(137, "0xabc", 1), chain_ts);
        let poll = signal(
            SignalSource::Poll,
            CanonicalId::fingerprint("0xwhale", "0xmarket", Outcome::Yes, Decimal::new(52, 2), poll_ts, 60),
            poll_ts,
        );
        assert!(store.record_or_reject(&chain, chain_ts));
        assert!(!store.record_or_reject(&poll, poll_ts));
    }

    #[test]
    fn test_different_outcome_not_duplicate() {
        let store = DedupStore::new(&DedupConfig::default());
        let a = signal(SignalSource::Chain, CanonicalId::chain(137, "0xabc", 1), t0());
        let mut b = signal(SignalSource::Chain, CanonicalId::chain(137, "0xabc", 2), t0());
        b.outcome = Outcome::No;
        assert!(store.record_or_reject(&a, t0()));
        assert!(store.record_or_reject(&b, t0()));
    }
}
