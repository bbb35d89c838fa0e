use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use whalecopy::config::{AppConfig, StressConfig};
use whalecopy::errors::MarketDataError;
use whalecopy::execution::{CopyEngine, Ledger, LedgerConfig, RiskGuard, StressSimulator};
use whalecopy::ingestion::DedupStore;
use whalecopy::intelligence::{WalletBook, WalletClassifier, WalletQuality};
use whalecopy::models::{
    AssetInfo, BookHealth, CanonicalId, MarketCategory, MarketInfo, MarketResolution, Outcome, Side,
    SignalSource, TradeSignal,
};
use whalecopy::polymarket::{MarketDataService, ResolutionLookup};
use whalecopy::services::Liveness;

static DIR_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Fresh, empty directory under the system temp dir.
#[allow(dead_code)]
pub fn make_test_dir(name: &str) -> PathBuf {
    let n = DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!("whalecopy-{name}-{}-{n}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create test dir");
    dir
}

/// 2023-11-14 16:00 UTC: inside trading hours.
#[allow(dead_code)]
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 11, 14, 16, 0, 0).single().unwrap()
}

/// Friction-free stress config: fills at the whale price with no gas.
#[allow(dead_code)]
pub fn frictionless() -> StressConfig {
    StressConfig {
        api_failure_rate: 0.0,
        rate_limit_reject_rate: 0.0,
        base_fill_rejection: 0.0,
        fatigue_rejection_step: 0.0,
        max_fill_rejection: 0.0,
        partial_fill_rate: 0.0,
        base_slippage: 0.0,
        slippage_noise: 0.0,
        slippage_drift: 0.0,
        staleness_per_sec: 0.0,
        crowd_penalty: 0.0,
        depletion_step: 0.0,
        spread_widening_rate: 0.0,
        off_hours_multiplier: 1.0,
        gas_min: 0.0,
        gas_max: 0.0,
        seed: Some(7),
        ..StressConfig::default()
    }
}

#[allow(dead_code)]
pub fn buy_signal(wallet: &str, market: &str, outcome: Outcome, price: Decimal, at: DateTime<Utc>) -> TradeSignal {
    let n = DIR_COUNTER.fetch_add(1, Ordering::SeqCst);
    TradeSignal {
        source: SignalSource::Chain,
        wallet: wallet.to_lowercase(),
        market_id: market.into(),
        asset_id: format!("{market}-{outcome}"),
        market_title: Some(format!("Will {market} happen?")),
        outcome,
        side: Side::Buy,
        price,
        raw_size: Decimal::from(1000),
        usdc_value: price * Decimal::from(1000),
        whale_timestamp: at,
        detected_at: at,
        canonical_id: CanonicalId::chain(137, &format!("0xtx{n:060}"), 0),
        score: 1,
        tx_hash: None,
        gas_price_gwei: None,
    }
}

#[allow(dead_code)]
pub fn sell_signal(wallet: &str, market: &str, outcome: Outcome, price: Decimal, at: DateTime<Utc>) -> TradeSignal {
    TradeSignal {
        side: Side::Sell,
        ..buy_signal(wallet, market, outcome, price, at)
    }
}

// ---------------------------------------------------------------------------
// Stub collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct StubMarketData {
    pub fee_bps: u32,
    pub unhealthy: Mutex<HashSet<String>>,
    pub end_times: Mutex<HashMap<String, DateTime<Utc>>>,
}

#[allow(dead_code)]
impl StubMarketData {
    pub fn with_fee(fee_bps: u32) -> Self {
        Self {
            fee_bps,
            ..Default::default()
        }
    }

    pub fn set_end_time(&self, market: &str, end: DateTime<Utc>) {
        self.end_times.lock().unwrap().insert(market.into(), end);
    }

    pub fn mark_unhealthy(&self, asset: &str) {
        self.unhealthy.lock().unwrap().insert(asset.into());
    }
}

#[async_trait]
impl MarketDataService for StubMarketData {
    async fn fee_rate_bps(&self, _asset_id: &str) -> u32 {
        self.fee_bps
    }

    async fn book_health(&self, asset_id: &str) -> BookHealth {
        if self.unhealthy.lock().unwrap().contains(asset_id) {
            BookHealth::unhealthy("spread too wide")
        } else {
            BookHealth::healthy()
        }
    }

    async fn market_info(&self, market_id: &str) -> Result<MarketInfo, MarketDataError> {
        let end_time = self.end_times.lock().unwrap().get(market_id).copied();
        match end_time {
            Some(end) => Ok(MarketInfo {
                market_id: market_id.into(),
                end_time: Some(end),
                ..Default::default()
            }),
            None => Err(MarketDataError::NotFound(market_id.into())),
        }
    }

    async fn asset_info(&self, asset_id: &str) -> Result<AssetInfo, MarketDataError> {
        Err(MarketDataError::NotFound(asset_id.into()))
    }
}

#[derive(Default)]
pub struct StubResolution {
    pub markets: Mutex<HashMap<String, MarketResolution>>,
}

#[allow(dead_code)]
impl StubResolution {
    pub fn set(&self, market: &str, resolution: MarketResolution) {
        self.markets.lock().unwrap().insert(market.into(), resolution);
    }
}

#[async_trait]
impl ResolutionLookup for StubResolution {
    async fn resolution(&self, market_id: &str) -> Result<MarketResolution, MarketDataError> {
        Ok(self
            .markets
            .lock()
            .unwrap()
            .get(market_id)
            .cloned()
            .unwrap_or_else(MarketResolution::unresolved))
    }
}

/// Classifier that reports a fixed quality for every wallet.
pub struct FixedQuality {
    pub quality: WalletQuality,
    pub category: MarketCategory,
}

#[allow(dead_code)]
impl FixedQuality {
    pub fn cut_off() -> Self {
        Self {
            quality: WalletQuality {
                multiplier: Decimal::ZERO,
                cut_off: true,
                category_settled: 6,
                category_wins: 0,
                category_losses: 6,
            },
            category: MarketCategory::Unknown,
        }
    }
}

impl WalletClassifier for FixedQuality {
    fn quality(&self, _wallet: &str, _category: MarketCategory) -> WalletQuality {
        self.quality.clone()
    }

    fn market_category(&self, _market_id: &str, _title: Option<&str>) -> MarketCategory {
        self.category
    }

    fn record_entry(&self, _wallet: &str, _category: MarketCategory, _cost: Decimal) {}

    fn record_result(&self, _wallet: &str, _category: MarketCategory, _realized_pnl: Decimal) {}
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

#[allow(dead_code)]
pub struct Harness {
    pub engine: CopyEngine,
    pub market_data: Arc<StubMarketData>,
    pub resolution: StubResolution,
}

/// In-memory engine with a 100 USDC balance, no fees and the given friction.
#[allow(dead_code)]
pub fn harness(stress: StressConfig, wallets: Arc<dyn WalletClassifier>) -> Harness {
    let config = AppConfig {
        stress: stress.clone(),
        ..AppConfig::default()
    };
    let risk = Arc::new(RiskGuard::in_memory(config.risk.clone(), config.starting_balance, t0()));
    let ledger = Ledger::new(LedgerConfig::from_app(&config), Arc::clone(&risk), Arc::clone(&wallets));
    let market_data = Arc::new(StubMarketData::with_fee(0));

    let mut config = config;
    config.sizing.default_fee_bps = 0;

    let engine = CopyEngine {
        dedup: Arc::new(DedupStore::new(&config.dedup)),
        ledger,
        risk,
        wallets,
        market_data: market_data.clone(),
        stress: Mutex::new(StressSimulator::new(stress)),
        liveness: Arc::new(Liveness::new(t0())),
        config,
    };
    Harness {
        engine,
        market_data,
        resolution: StubResolution::default(),
    }
}

#[allow(dead_code)]
pub fn neutral_book() -> Arc<dyn WalletClassifier> {
    Arc::new(WalletBook::in_memory())
}

#[allow(dead_code)]
pub fn minutes(n: i64) -> Duration {
    Duration::minutes(n)
}
