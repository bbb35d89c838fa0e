use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::models::{AssetInfo, MarketInfo};

#[derive(Debug, Default)]
struct RegistryInner {
    assets: HashMap<String, AssetInfo>,
    markets: HashMap<String, MarketInfo>,
    marks: HashMap<String, (Decimal, DateTime<Utc>)>,
}

/// Shared cache mapping outcome tokens to their market and outcome, plus the
/// latest observed trade price per token.
#[derive(Debug, Clone, Default)]
pub struct AssetRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl AssetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every outcome token of a market.
    pub fn register_market(&self, market: MarketInfo) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for (outcome, asset_id) in &market.assets {
            inner.assets.insert(
                asset_id.clone(),
                AssetInfo {
                    asset_id: asset_id.clone(),
                    market_id: market.market_id.clone(),
                    outcome: *outcome,
                    title: market.title.clone(),
                },
            );
        }
        inner.markets.insert(market.market_id.clone(), market);
    }

    pub fn register_asset(&self, info: AssetInfo) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.assets.insert(info.asset_id.clone(), info);
    }

    pub fn asset(&self, asset_id: &str) -> Option<AssetInfo> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.assets.get(asset_id).cloned()
    }

    pub fn market(&self, market_id: &str) -> Option<MarketInfo> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.markets.get(market_id).cloned()
    }

    pub fn set_mark(&self, asset_id: &str, price: Decimal, at: DateTime<Utc>) {
        if price <= Decimal::ZERO || price >= Decimal::ONE {
            return;
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.marks.insert(asset_id.to_string(), (price, at));
    }

    pub fn mark(&self, asset_id: &str) -> Option<(Decimal, DateTime<Utc>)> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.marks.get(asset_id).copied()
    }

    /// All registered token ids, for stream subscriptions.
    pub fn asset_ids(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = inner.assets.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
