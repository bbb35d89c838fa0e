use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

/// Accept a decimal encoded either as a JSON number or as a string.
fn lenient_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Decimal::from_str(s.trim()).ok(),
        Some(serde_json::Value::Number(n)) => Decimal::from_str(&n.to_string())
            .ok()
            .or_else(|| n.as_f64().and_then(|f| Decimal::try_from(f).ok())),
        _ => None,
    })
}

/// Accept a timestamp encoded as a number or a string (seconds, ms or RFC 3339).
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Market (CLOB API)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiToken {
    pub token_id: String,
    pub outcome: String,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub winner: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiMarket {
    pub condition_id: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub tokens: Vec<ApiToken>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub closed: Option<bool>,
    #[serde(default)]
    pub end_date_iso: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiFeeRate {
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub base_fee: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Order Book (CLOB API)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiOrderBookLevel {
    #[serde(deserialize_with = "lenient_decimal_required")]
    pub price: Decimal,
    #[serde(deserialize_with = "lenient_decimal_required")]
    pub size: Decimal,
}

fn lenient_decimal_required<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_decimal(deserializer)?
        .ok_or_else(|| serde::de::Error::custom("expected a decimal"))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiOrderBook {
    pub market: Option<String>,
    pub asset_id: Option<String>,
    #[serde(default)]
    pub bids: Vec<ApiOrderBookLevel>,
    #[serde(default)]
    pub asks: Vec<ApiOrderBookLevel>,
}

impl ApiOrderBook {
    pub fn best_bid(&self) -> Option<&ApiOrderBookLevel> {
        self.bids.iter().max_by(|a, b| a.price.cmp(&b.price))
    }

    pub fn best_ask(&self) -> Option<&ApiOrderBookLevel> {
        self.asks.iter().min_by(|a, b| a.price.cmp(&b.price))
    }
}

// ---------------------------------------------------------------------------
// Market (Gamma API)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GammaMarket {
    #[serde(alias = "conditionId")]
    pub condition_id: String,
    #[serde(default)]
    pub question: Option<String>,
    /// Stringified JSON array of outcome labels, e.g. "[\"Yes\",\"No\"]".
    #[serde(default)]
    pub outcomes: Option<String>,
    /// Stringified JSON array of token IDs, e.g. "[\"token1\", \"token2\"]".
    #[serde(default, alias = "clobTokenIds")]
    pub clob_token_ids: Option<String>,
    #[serde(default, alias = "endDate", alias = "endDateIso")]
    pub end_date: Option<String>,
    #[serde(default)]
    pub closed: Option<bool>,
}

impl GammaMarket {
    /// Parse the stringified clobTokenIds into a Vec of token ID strings.
    pub fn parse_token_ids(&self) -> Vec<String> {
        self.clob_token_ids
            .as_deref()
            .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
            .unwrap_or_default()
    }

    pub fn parse_outcomes(&self) -> Vec<String> {
        self.outcomes
            .as_deref()
            .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Activity (Data API)
// ---------------------------------------------------------------------------

/// One row of `GET /activity?user=<wallet>&type=TRADE`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiActivity {
    #[serde(default)]
    pub proxy_wallet: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub condition_id: Option<String>,
    #[serde(default, rename = "type")]
    pub activity_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub size: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub usdc_size: Option<Decimal>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub outcome_index: Option<usize>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
}

// ---------------------------------------------------------------------------
// Trade (WebSocket)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WsTrade {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub size: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_decimal")]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub maker_address: Option<String>,
    #[serde(default)]
    pub taker_address: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// WebSocket subscribe message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct WsSubscribe {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub assets_ids: Vec<String>,
}

impl WsSubscribe {
    /// Polymarket WS format: {"type": "market", "assets_ids": ["id1", "id2", ...]}
    pub fn market(asset_ids: &[String]) -> Self {
        Self {
            msg_type: "market".into(),
            assets_ids: asset_ids.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_accepts_numeric_and_string_fields() {
        let raw = r#"{
            "proxyWallet": "0xABC",
            "timestamp": 1700000000,
            "conditionId": "0xcond",
            "type": "TRADE",
            "size": 100,
            "usdcSize": "52.5",
            "transactionHash": "0xtx",
            "price": 0.525,
            "asset": "123",
            "side": "BUY",
            "outcomeIndex": 0,
            "title": "Will it rain?",
            "outcome": "Yes"
        }"#;
        let a: ApiActivity = serde_json::from_str(raw).unwrap();
        assert_eq!(a.timestamp.as_deref(), Some("1700000000"));
        assert_eq!(a.usdc_size, Some(Decimal::new(525, 1)));
        assert_eq!(a.price, Some(Decimal::new(525, 3)));
        assert_eq!(a.outcome_index, Some(0));
    }

    #[test]
    fn test_gamma_token_ids() {
        let m = GammaMarket {
            condition_id: "0x1".into(),
            question: None,
            outcomes: Some(r#"["Up","Down"]"#.into()),
            clob_token_ids: Some(r#"["111","222"]"#.into()),
            end_date: None,
            closed: None,
        };
        assert_eq!(m.parse_token_ids(), vec!["111", "222"]);
        assert_eq!(m.parse_outcomes(), vec!["Up", "Down"]);
    }

    #[test]
    fn test_book_best_levels() {
        let raw = r#"{"market":"m","asset_id":"a",
            "bids":[{"price":"0.40","size":"10"},{"price":"0.45","size":"3"}],
            "asks":[{"price":"0.52","size":"8"},{"price":"0.50","size":"20"}]}"#;
        let book: ApiOrderBook = serde_json::from_str(raw).unwrap();
        assert_eq!(book.best_bid().unwrap().price, Decimal::new(45, 2));
        assert_eq!(book.best_ask().unwrap().price, Decimal::new(50, 2));
    }
}
