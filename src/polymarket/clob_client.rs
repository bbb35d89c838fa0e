use reqwest::{Client, StatusCode};
use thiserror::Error;

use super::types::{ApiFeeRate, ApiMarket, ApiOrderBook};

const CLOB_API_BASE: &str = "https://clob.polymarket.com";

#[derive(Debug, Error)]
pub enum ClobClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Read-only client for the public CLOB endpoints.
#[derive(Debug, Clone)]
pub struct ClobClient {
    http: Client,
    base_url: String,
}

impl ClobClient {
    pub fn new(http: Client) -> Self {
        Self::with_base_url(http, CLOB_API_BASE)
    }

    pub fn with_base_url(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Fetch a single market, including per-token prices and winner flags.
    pub async fn get_market(&self, condition_id: &str) -> Result<ApiMarket, ClobClientError> {
        let url = format!("{}/markets/{}", self.base_url, condition_id);
        let resp = self.http.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ClobClientError::NotFound(condition_id.to_string()));
        }
        let market: ApiMarket = resp.error_for_status()?.json().await?;
        Ok(market)
    }

    /// Fetch order book for a specific token. A 404 means no book exists.
    pub async fn get_order_book(&self, token_id: &str) -> Result<ApiOrderBook, ClobClientError> {
        let url = format!("{}/book", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("token_id", token_id)])
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ClobClientError::NotFound(token_id.to_string()));
        }
        let book: ApiOrderBook = resp.error_for_status()?.json().await?;
        Ok(book)
    }

    pub async fn get_fee_rate(&self, token_id: &str) -> Result<ApiFeeRate, ClobClientError> {
        let url = format!("{}/fee-rate", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("token_id", token_id)])
            .send()
            .await?
            .error_for_status()?;
        let fee: ApiFeeRate = resp.json().await?;
        Ok(fee)
    }
}
