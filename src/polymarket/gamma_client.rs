use reqwest::Client;
use thiserror::Error;

use super::types::GammaMarket;

const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";

#[derive(Debug, Error)]
pub enum GammaClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct GammaClient {
    http: Client,
    base_url: String,
}

impl GammaClient {
    pub fn new(http: Client) -> Self {
        Self::with_base_url(http, GAMMA_API_BASE)
    }

    pub fn with_base_url(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Look up a market by condition id.
    pub async fn market_by_condition(
        &self,
        condition_id: &str,
    ) -> Result<Option<GammaMarket>, GammaClientError> {
        self.query_one(&[("condition_ids", condition_id)]).await
    }

    /// Look up the market an outcome token belongs to.
    pub async fn market_by_token(
        &self,
        token_id: &str,
    ) -> Result<Option<GammaMarket>, GammaClientError> {
        self.query_one(&[("clob_token_ids", token_id)]).await
    }

    async fn query_one(
        &self,
        query: &[(&str, &str)],
    ) -> Result<Option<GammaMarket>, GammaClientError> {
        let url = format!("{}/markets", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await?
            .error_for_status()?;

        let markets: Vec<GammaMarket> = resp.json().await?;
        Ok(markets.into_iter().next())
    }
}
