use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;

use super::clob_client::{ClobClient, ClobClientError};
use super::gamma_client::GammaClient;
use super::types::{ApiMarket, GammaMarket};
use crate::config::MarketDataConfig;
use crate::errors::MarketDataError;
use crate::ingestion::assets::AssetRegistry;
use crate::models::{AssetInfo, BookHealth, MarketInfo, MarketResolution, Outcome};

/// Venue data consumed by entry checks.
#[async_trait]
pub trait MarketDataService: Send + Sync {
    /// Taker fee rate in basis points. Never fails: falls back to a default.
    async fn fee_rate_bps(&self, asset_id: &str) -> u32;

    /// Order book condition. Lookup failures report a healthy book.
    async fn book_health(&self, asset_id: &str) -> BookHealth;

    async fn market_info(&self, market_id: &str) -> Result<MarketInfo, MarketDataError>;

    async fn asset_info(&self, asset_id: &str) -> Result<AssetInfo, MarketDataError>;
}

/// Settlement state and mark prices for open positions.
#[async_trait]
pub trait ResolutionLookup: Send + Sync {
    async fn resolution(&self, market_id: &str) -> Result<MarketResolution, MarketDataError>;
}

impl From<ClobClientError> for MarketDataError {
    fn from(e: ClobClientError) -> Self {
        match e {
            ClobClientError::Http(e) => MarketDataError::Http(e),
            ClobClientError::NotFound(id) => MarketDataError::NotFound(id),
        }
    }
}

impl From<super::gamma_client::GammaClientError> for MarketDataError {
    fn from(e: super::gamma_client::GammaClientError) -> Self {
        match e {
            super::gamma_client::GammaClientError::Http(e) => MarketDataError::Http(e),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// `MarketDataService` and `ResolutionLookup` over the public CLOB and Gamma APIs,
/// caching market metadata in the shared `AssetRegistry`.
pub struct PolymarketService {
    clob: ClobClient,
    gamma: GammaClient,
    registry: AssetRegistry,
    max_spread: Decimal,
    min_depth_usdc: Decimal,
    default_fee_bps: u32,
}

impl PolymarketService {
    pub fn new(
        http: Client,
        config: &MarketDataConfig,
        registry: AssetRegistry,
        default_fee_bps: u32,
    ) -> Self {
        Self {
            clob: ClobClient::with_base_url(http.clone(), &config.clob_url),
            gamma: GammaClient::with_base_url(http, &config.gamma_url),
            registry,
            max_spread: config.max_spread,
            min_depth_usdc: config.min_depth_usdc,
            default_fee_bps,
        }
    }

    pub fn registry(&self) -> &AssetRegistry {
        &self.registry
    }
}

#[async_trait]
impl MarketDataService for PolymarketService {
    async fn fee_rate_bps(&self, asset_id: &str) -> u32 {
        match self.clob.get_fee_rate(asset_id).await {
            Ok(fee) => {
                let bps = fee
                    .base_fee
                    .and_then(|d| d.trunc().to_u32())
                    .unwrap_or(0);
                if bps == 0 {
                    self.default_fee_bps
                } else {
                    bps
                }
            }
            Err(e) => {
                tracing::debug!(asset = %asset_id, error = %e, "Fee rate lookup failed, using default");
                self.default_fee_bps
            }
        }
    }

    async fn book_health(&self, asset_id: &str) -> BookHealth {
        match self.clob.get_order_book(asset_id).await {
            Ok(book) => {
                let (bid, ask) = match (book.best_bid(), book.best_ask()) {
                    (Some(b), Some(a)) => (b, a),
                    _ => return BookHealth::unhealthy("empty book side"),
                };
                let spread = ask.price - bid.price;
                if spread > self.max_spread {
                    let mut health = BookHealth::unhealthy(format!("spread {spread} too wide"));
                    health.spread = Some(spread);
                    return health;
                }
                let depth = ask.price * ask.size;
                if depth < self.min_depth_usdc {
                    return BookHealth::unhealthy(format!("top-of-book depth ${depth} too thin"));
                }
                BookHealth {
                    healthy: true,
                    reason: None,
                    spread: Some(spread),
                }
            }
            Err(ClobClientError::NotFound(_)) => BookHealth::unhealthy("market resolved (no order book)"),
            Err(e) => {
                tracing::debug!(asset = %asset_id, error = %e, "Book lookup failed, proceeding");
                BookHealth::healthy()
            }
        }
    }

    async fn market_info(&self, market_id: &str) -> Result<MarketInfo, MarketDataError> {
        if let Some(info) = self.registry.market(market_id) {
            return Ok(info);
        }
        let market = self
            .gamma
            .market_by_condition(market_id)
            .await?
            .ok_or_else(|| MarketDataError::NotFound(market_id.to_string()))?;
        let info = gamma_to_market_info(&market)?;
        self.registry.register_market(info.clone());
        Ok(info)
    }

    async fn asset_info(&self, asset_id: &str) -> Result<AssetInfo, MarketDataError> {
        if let Some(info) = self.registry.asset(asset_id) {
            return Ok(info);
        }
        let market = self
            .gamma
            .market_by_token(asset_id)
            .await?
            .ok_or_else(|| MarketDataError::NotFound(asset_id.to_string()))?;
        let info = gamma_to_market_info(&market)?;
        self.registry.register_market(info);
        self.registry
            .asset(asset_id)
            .ok_or_else(|| MarketDataError::NotFound(asset_id.to_string()))
    }
}

#[async_trait]
impl ResolutionLookup for PolymarketService {
    async fn resolution(&self, market_id: &str) -> Result<MarketResolution, MarketDataError> {
        let market = self.clob.get_market(market_id).await?;
        let mut resolution = api_market_resolution(&market);

        // Fresher marks from the trade stream override the REST snapshot.
        for (i, token) in market.tokens.iter().enumerate() {
            if let (Some(outcome), Some((mark, _))) =
                (token_outcome(&token.outcome, i), self.registry.mark(&token.token_id))
            {
                resolution.prices.insert(outcome, mark);
            }
        }
        Ok(resolution)
    }
}

fn token_outcome(label: &str, index: usize) -> Option<Outcome> {
    Outcome::from_api_str(label).or_else(|| Outcome::from_index(index))
}

/// Winner and prices from a CLOB market. A winner is only reported once the
/// market is closed.
pub fn api_market_resolution(market: &ApiMarket) -> MarketResolution {
    let mut resolution = MarketResolution::unresolved();
    for (i, token) in market.tokens.iter().enumerate() {
        let Some(outcome) = token_outcome(&token.outcome, i) else {
            continue;
        };
        if let Some(price) = token.price {
            resolution.prices.insert(outcome, price);
        }
        if market.closed.unwrap_or(false) && token.winner == Some(true) {
            resolution.winner = Some(outcome);
        }
    }
    resolution
}

pub fn gamma_to_market_info(market: &GammaMarket) -> Result<MarketInfo, MarketDataError> {
    let token_ids = market.parse_token_ids();
    if token_ids.len() != 2 {
        return Err(MarketDataError::Parse(format!(
            "market {} has {} tokens, expected 2",
            market.condition_id,
            token_ids.len()
        )));
    }
    let labels = market.parse_outcomes();

    let mut assets = HashMap::new();
    for (i, token) in token_ids.into_iter().enumerate() {
        let outcome = labels
            .get(i)
            .and_then(|l| Outcome::from_api_str(l))
            .or_else(|| Outcome::from_index(i))
            .ok_or_else(|| MarketDataError::Parse(format!("no outcome for token index {i}")))?;
        assets.insert(outcome, token);
    }

    let end_time = market
        .end_date
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Ok(MarketInfo {
        market_id: market.condition_id.to_lowercase(),
        title: market.question.clone(),
        end_time,
        assets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::polymarket::types::ApiToken;

    #[test]
    fn test_gamma_to_market_info_maps_labels() {
        let gm = GammaMarket {
            condition_id: "0xABC".into(),
            question: Some("Lakers vs Celtics".into()),
            outcomes: Some(r#"["Lakers","Celtics"]"#.into()),
            clob_token_ids: Some(r#"["1","2"]"#.into()),
            end_date: Some("2026-01-01T00:00:00Z".into()),
            closed: None,
        };
        let info = gamma_to_market_info(&gm).unwrap();
        assert_eq!(info.market_id, "0xabc");
        assert_eq!(info.assets.get(&Outcome::Yes).map(String::as_str), Some("1"));
        assert_eq!(info.assets.get(&Outcome::No).map(String::as_str), Some("2"));
        assert!(info.end_time.is_some());
    }

    #[test]
    fn test_resolution_requires_closed_market() {
        let mut market = ApiMarket {
            condition_id: "0x1".into(),
            question: None,
            tokens: vec![
                ApiToken {
                    token_id: "1".into(),
                    outcome: "Yes".into(),
                    price: Some(Decimal::ONE),
                    winner: Some(true),
                },
                ApiToken {
                    token_id: "2".into(),
                    outcome: "No".into(),
                    price: Some(Decimal::ZERO),
                    winner: Some(false),
                },
            ],
            active: Some(true),
            closed: Some(false),
            end_date_iso: None,
        };
        assert_eq!(api_market_resolution(&market).winner, None);
        market.closed = Some(true);
        let res = api_market_resolution(&market);
        assert_eq!(res.winner, Some(Outcome::Yes));
        assert_eq!(res.mark(Outcome::No), None);
    }
}
