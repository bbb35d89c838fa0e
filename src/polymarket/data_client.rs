use reqwest::Client;

use super::types::ApiActivity;
use crate::errors::FeedError;

const DATA_API_BASE: &str = "https://data-api.polymarket.com";

#[derive(Debug, Clone)]
pub struct DataClient {
    http: Client,
    base_url: String,
}

impl DataClient {
    pub fn new(http: Client) -> Self {
        Self::with_base_url(http, DATA_API_BASE)
    }

    pub fn with_base_url(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Fetch a wallet's most recent trades, newest first.
    pub async fn get_activity(&self, wallet: &str, limit: u32) -> Result<Vec<ApiActivity>, FeedError> {
        let url = format!("{}/activity", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("user", wallet),
                ("type", "TRADE"),
                ("limit", &limit.to_string()),
                ("sortBy", "TIMESTAMP"),
                ("sortDirection", "DESC"),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body: serde_json::Value = resp.json().await?;
        match body {
            serde_json::Value::Array(_) => serde_json::from_value(body)
                .map_err(|e| FeedError::Schema(format!("activity: {e}"))),
            other => Err(FeedError::Schema(format!(
                "activity: expected array, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
