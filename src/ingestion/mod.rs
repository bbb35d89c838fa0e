pub mod assets;
pub mod chain_decoder;
pub mod chain_listener;
pub mod dedup;
pub mod poller;
pub mod reorg;
pub mod ws_listener;

use chrono::{DateTime, Utc};

pub use assets::AssetRegistry;
pub use dedup::DedupStore;

/// Parse a venue timestamp: epoch seconds, epoch milliseconds or RFC 3339.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        // If >1e12, it's milliseconds
        return if n > 1_000_000_000_000 {
            DateTime::from_timestamp_millis(n)
        } else {
            DateTime::from_timestamp(n, 0)
        };
    }
    if let Ok(f) = raw.parse::<f64>() {
        return DateTime::from_timestamp_millis((f * 1000.0) as i64);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
