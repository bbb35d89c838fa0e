use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::assets::AssetRegistry;
use super::parse_timestamp;
use crate::config::StreamConfig;
use crate::errors::{DecodeError, FeedError};
use crate::models::{CanonicalId, Side, SignalSource, TradeSignal};
use crate::polymarket::types::{WsSubscribe, WsTrade};
use crate::services::health_monitor::Liveness;

const PING_INTERVAL: Duration = Duration::from_secs(25);
const RESUBSCRIBE_CHECK: Duration = Duration::from_secs(60);
const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

pub struct StreamListener {
    pub config: StreamConfig,
    pub tracked: HashSet<String>,
    pub registry: AssetRegistry,
    pub signal_tx: mpsc::Sender<TradeSignal>,
    pub liveness: Arc<Liveness>,
    pub bucket_secs: i64,
}

/// Run the market-channel WebSocket listener. Subscribes to every token in the
/// registry and re-subscribes when the registry grows.
pub async fn run_ws_listener(listener: StreamListener, mut running: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;

    while *running.borrow() {
        tracing::info!(url = %listener.config.ws_url, "Connecting to Polymarket WebSocket...");

        match listener.run_session(&mut attempt, &mut running).await {
            Ok(()) => {
                if !*running.borrow() {
                    break;
                }
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(error = %e, "WebSocket session ended");
            }
            Err(e) => {
                tracing::error!(error = %e, "WebSocket listener stopped on non-retryable error");
                return;
            }
        }

        // Exponential backoff with cap
        let delay = BASE_RECONNECT_DELAY * 2u32.saturating_pow(attempt);
        let delay = delay.min(MAX_RECONNECT_DELAY);
        attempt = attempt.saturating_add(1);
        tracing::info!(delay_secs = delay.as_secs(), attempt, "Reconnecting...");
        tokio::select! {
            _ = sleep(delay) => {}
            _ = running.changed() => {}
        }
    }

    tracing::info!("WebSocket listener stopped");
}

impl StreamListener {
    async fn run_session(
        &self,
        attempt: &mut u32,
        running: &mut watch::Receiver<bool>,
    ) -> Result<(), FeedError> {
        let (ws_stream, _response) = connect_async(&self.config.ws_url).await?;
        tracing::info!("WebSocket connected successfully");
        *attempt = 0;

        let (mut write, mut read) = ws_stream.split();

        let mut subscribed = self.registry.asset_ids();
        let sub = serde_json::to_string(&WsSubscribe::market(&subscribed))
            .map_err(|e| FeedError::Schema(e.to_string()))?;
        write.send(Message::Text(sub.into())).await?;
        tracing::info!(token_count = subscribed.len(), "Subscribed to initial token list");

        let mut ping_timer = interval(PING_INTERVAL);
        ping_timer.tick().await;
        let mut resub_timer = interval(RESUBSCRIBE_CHECK);
        resub_timer.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text_message(text.as_ref()).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::warn!("WebSocket server sent close frame");
                            return Err(FeedError::Closed);
                        }
                        Some(Ok(_)) => {} // Binary, Pong, Frame
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(FeedError::Closed),
                    }
                }
                _ = ping_timer.tick() => {
                    write.send(Message::Ping(vec![].into())).await?;
                }
                _ = resub_timer.tick() => {
                    let current = self.registry.asset_ids();
                    if current != subscribed {
                        let sub = serde_json::to_string(&WsSubscribe::market(&current))
                            .map_err(|e| FeedError::Schema(e.to_string()))?;
                        write.send(Message::Text(sub.into())).await?;
                        tracing::info!(token_count = current.len(), "Token list changed, resubscribed");
                        subscribed = current;
                    }
                }
                _ = running.changed() => {
                    if !*running.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_text_message(&self, text: &str) {
        let now = Utc::now();
        for result in decode_stream_message(text, self, now) {
            match result {
                Ok(Some(signal)) => {
                    self.liveness.stamp_signal(now);
                    metrics::counter!("signals_received_total", "source" => "stream").increment(1);
                    tracing::info!(
                        wallet = %signal.wallet,
                        market = %signal.market_id,
                        side = %signal.side,
                        outcome = %signal.outcome,
                        price = %signal.price,
                        usdc = %signal.usdc_value,
                        "Stream trade detected"
                    );
                    if let Err(e) = self.signal_tx.send(signal).await {
                        tracing::error!(error = %e, "Failed to send stream signal to engine");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    metrics::counter!("decode_errors_total", "source" => "stream").increment(1);
                    tracing::debug!(error = %e, "Stream event dropped");
                }
            }
        }
    }
}

/// Split a frame into trade objects. A frame may be a JSON array of trades, a
/// single trade object, or a wrapper with a `data` array. Non-trade events (acks,
/// book snapshots) and keepalive text yield nothing; a frame that is not JSON, or a
/// trade object that does not fit [`WsTrade`], yields an error entry.
pub fn parse_trades(text: &str) -> Vec<Result<WsTrade, DecodeError>> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("pong") {
        return Vec::new();
    }
    let value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => return vec![Err(e.into())],
    };

    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(ref obj) => match obj.get("data") {
            Some(serde_json::Value::Array(items)) => items.clone(),
            _ => vec![value],
        },
        _ => return Vec::new(),
    };

    items
        .into_iter()
        .filter(is_trade_event)
        .map(|v| serde_json::from_value::<WsTrade>(v).map_err(DecodeError::from))
        .collect()
}

fn is_trade_event(v: &serde_json::Value) -> bool {
    match v.get("event_type").and_then(|e| e.as_str()) {
        Some(et) => et == "last_trade_price" || et == "trade",
        // Bare trade objects carry a price and size but no book arrays.
        None => v.get("price").is_some() && v.get("size").is_some() && v.get("bids").is_none(),
    }
}

/// Decode every trade in a frame. `Ok(None)` marks trades that are valid but not
/// copy candidates (unknown market, small notional, untracked or anonymous wallet).
pub fn decode_stream_message(
    text: &str,
    listener: &StreamListener,
    now: DateTime<Utc>,
) -> Vec<Result<Option<TradeSignal>, DecodeError>> {
    parse_trades(text)
        .into_iter()
        .map(|t| {
            decode_trade(
                &t?,
                &listener.registry,
                &listener.tracked,
                &listener.config,
                listener.bucket_secs,
                now,
            )
        })
        .collect()
}

pub fn decode_trade(
    trade: &WsTrade,
    registry: &AssetRegistry,
    tracked: &HashSet<String>,
    config: &StreamConfig,
    bucket_secs: i64,
    now: DateTime<Utc>,
) -> Result<Option<TradeSignal>, DecodeError> {
    let asset_id = trade
        .asset_id
        .as_deref()
        .ok_or(DecodeError::MissingField("asset_id"))?;
    let price = trade.price.ok_or(DecodeError::MissingField("price"))?;
    let size = trade.size.ok_or(DecodeError::MissingField("size"))?;
    if price <= Decimal::ZERO || price >= Decimal::ONE {
        return Err(DecodeError::PriceOutOfRange(price));
    }

    let Some(asset) = registry.asset(asset_id) else {
        return Ok(None);
    };
    registry.set_mark(asset_id, price, now);

    let usdc_value = (size * price).round_dp(2);
    if usdc_value < config.min_notional {
        return Ok(None);
    }

    let side = trade
        .side
        .as_deref()
        .and_then(Side::from_api_str)
        .ok_or(DecodeError::MissingField("side"))?;

    let wallet = trade
        .taker_address
        .as_deref()
        .or(trade.maker_address.as_deref())
        .or(trade.owner.as_deref())
        .map(str::to_lowercase)
        .unwrap_or_default();

    if wallet.is_empty() {
        if !config.copy_anonymous {
            return Ok(None);
        }
    } else if !tracked.contains(&wallet) {
        return Ok(None);
    }

    let whale_timestamp = trade
        .timestamp
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(now);

    let canonical_id = if wallet.is_empty() {
        CanonicalId::hashed(&format!(
            "stream|{asset_id}|{price}|{size}|{}",
            whale_timestamp.timestamp_millis()
        ))
    } else {
        CanonicalId::fingerprint(
            &wallet,
            &asset.market_id,
            asset.outcome,
            price,
            whale_timestamp,
            bucket_secs,
        )
    };

    Ok(Some(TradeSignal {
        source: SignalSource::Stream,
        wallet,
        market_id: asset.market_id,
        asset_id: asset_id.to_string(),
        market_title: asset.title,
        outcome: asset.outcome,
        side,
        price,
        raw_size: size,
        usdc_value,
        whale_timestamp,
        detected_at: now,
        canonical_id,
        score: 1,
        tx_hash: trade.transaction_hash.clone(),
        gas_price_gwei: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetInfo, Outcome};

    fn registry() -> AssetRegistry {
        let reg = AssetRegistry::new();
        reg.register_asset(AssetInfo {
            asset_id: "111".into(),
            market_id: "0xcond".into(),
            outcome: Outcome::No,
            title: Some("Lakers vs Celtics".into()),
        });
        reg
    }

    fn decode(text: &str, config: &StreamConfig, tracked: &HashSet<String>) -> Vec<Result<Option<TradeSignal>, DecodeError>> {
        let reg = registry();
        parse_trades(text)
            .into_iter()
            .map(|t| decode_trade(&t?, &reg, tracked, config, 60, Utc::now()))
            .collect()
    }

    #[test]
    fn test_parse_trades_shapes() {
        let single = r#"{"event_type":"last_trade_price","asset_id":"111","price":"0.5","size":"200","side":"BUY"}"#;
        assert_eq!(parse_trades(single).len(), 1);
        let array = format!("[{single},{single}]");
        assert_eq!(parse_trades(&array).len(), 2);
        let wrapped = format!(r#"{{"data":[{single}]}}"#);
        assert_eq!(parse_trades(&wrapped).len(), 1);
        let book = r#"{"event_type":"book","asset_id":"111","bids":[],"asks":[]}"#;
        assert!(parse_trades(book).is_empty());
        assert!(parse_trades("PONG").is_empty());
    }

    #[test]
    fn test_malformed_trades_surface_as_errors() {
        let good = r#"{"event_type":"last_trade_price","asset_id":"111","price":"0.5","size":"200","side":"BUY"}"#;
        let bad = r#"{"event_type":"last_trade_price","asset_id":"111","price":"0.5","size":"200","side":5}"#;
        let frame = format!("[{good},{bad},{good}]");
        let parsed = parse_trades(&frame);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed.iter().filter(|r| r.is_err()).count(), 1);
        assert!(matches!(parsed[1], Err(DecodeError::Json(_))));

        let truncated = parse_trades(r#"[{"event_type":"trade","price":"0.5""#);
        assert_eq!(truncated.len(), 1);
        assert!(truncated[0].is_err());

        let on = StreamConfig {
            copy_anonymous: true,
            ..StreamConfig::default()
        };
        let decoded = decode(&frame, &on, &HashSet::new());
        assert_eq!(decoded.iter().filter(|r| r.is_err()).count(), 1);
        assert_eq!(decoded.iter().filter(|r| matches!(r, Ok(Some(_)))).count(), 2);
    }

    #[test]
    fn test_anonymous_print_gated_by_config() {
        let text = r#"{"event_type":"last_trade_price","asset_id":"111","price":"0.5","size":"200","side":"BUY"}"#;
        let tracked = HashSet::new();
        let off = StreamConfig::default();
        assert!(matches!(decode(text, &off, &tracked)[0], Ok(None)));

        let on = StreamConfig {
            copy_anonymous: true,
            ..StreamConfig::default()
        };
        let signal = decode(text, &on, &tracked).remove(0).unwrap().unwrap();
        assert!(signal.is_anonymous());
        assert_eq!(signal.outcome, Outcome::No);
        assert_eq!(signal.usdc_value, Decimal::from(100));
    }

    #[test]
    fn test_tracked_wallet_trade() {
        let text = r#"{"asset_id":"111","price":0.4,"size":500,"side":"buy","taker_address":"0xWHALE","timestamp":"1700000000"}"#;
        let tracked: HashSet<String> = ["0xwhale".to_string()].into_iter().collect();
        let signal = decode(text, &StreamConfig::default(), &tracked)
            .remove(0)
            .unwrap()
            .unwrap();
        assert_eq!(signal.wallet, "0xwhale");
        assert_eq!(signal.market_id, "0xcond");
        assert_eq!(signal.whale_timestamp.timestamp(), 1_700_000_000);
        assert!(matches!(signal.canonical_id, CanonicalId::Hashed { .. }));
    }

    #[test]
    fn test_small_or_unknown_ignored_and_bad_price_errors() {
        let tracked = HashSet::new();
        let cfg = StreamConfig {
            copy_anonymous: true,
            ..StreamConfig::default()
        };
        let small = r#"{"asset_id":"111","price":"0.5","size":"10","side":"BUY"}"#;
        assert!(matches!(decode(small, &cfg, &tracked)[0], Ok(None)));
        let unknown = r#"{"asset_id":"999","price":"0.5","size":"1000","side":"BUY"}"#;
        assert!(matches!(decode(unknown, &cfg, &tracked)[0], Ok(None)));
        let bad = r#"{"asset_id":"111","price":"1.5","size":"1000","side":"BUY"}"#;
        assert!(matches!(decode(bad, &cfg, &tracked)[0], Err(DecodeError::PriceOutOfRange(_))));
    }
}
