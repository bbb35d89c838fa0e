use rust_decimal::Decimal;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::models::MarketCategory;

const DEFAULT_CHAIN_WS_URL: &str = "wss://polygon-bor-rpc.publicnode.com";
const DEFAULT_STREAM_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";
const DEFAULT_CLOB_URL: &str = "https://clob.polymarket.com";
const DEFAULT_GAMMA_URL: &str = "https://gamma-api.polymarket.com";
const DEFAULT_DATA_API_URL: &str = "https://data-api.polymarket.com";

/// Every tunable of the engine. `Default` is the single source of default values;
/// `from_env` overlays environment variables on top of it.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub starting_balance: Decimal,
    pub cycle_interval: Duration,
    pub metrics_addr: Option<String>,
    pub log_format: String,
    /// Tracked whale wallets, lowercase, in rank order.
    pub tracked_wallets: Vec<String>,

    pub risk: RiskConfig,
    pub sizing: SizingConfig,
    pub stress: StressConfig,
    pub exits: ExitBands,
    pub dedup: DedupConfig,
    pub chain: ChainConfig,
    pub stream: StreamConfig,
    pub poll: PollConfig,
    pub market_data: MarketDataConfig,
    pub parity: ParityConfig,
    pub health: HealthConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub exposure_pct: Decimal,
    pub market_pct: Decimal,
    pub min_trade_pct: Decimal,
    pub max_trade_pct: Decimal,
    pub min_trade_floor: Decimal,
    pub max_trade_floor: Decimal,
    pub daily_loss_pct: Decimal,
    pub day_window: Duration,
    pub kill_switch_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SizingConfig {
    pub copy_ratio: Decimal,
    /// Settled outcomes in a category before Kelly sizing takes over.
    pub kelly_min_settled: u32,
    pub kelly_scale: Decimal,
    pub winners_curse_pct: Decimal,
    pub expiry_block: Duration,
    pub high_gas_gwei: Decimal,
    pub low_gas_gwei: Decimal,
    pub high_gas_multiplier: Decimal,
    pub low_gas_multiplier: Decimal,
    pub default_fee_bps: u32,
}

#[derive(Debug, Clone)]
pub struct StressConfig {
    pub api_failure_rate: f64,
    pub rate_limit_window_secs: f64,
    pub rate_limit_reject_rate: f64,
    pub base_fill_rejection: f64,
    pub fatigue_rejection_step: f64,
    pub max_fill_rejection: f64,
    pub partial_fill_rate: f64,
    pub partial_fill_min: f64,
    pub partial_fill_max: f64,
    pub base_slippage: f64,
    pub slippage_noise: f64,
    pub slippage_drift: f64,
    pub staleness_per_sec: f64,
    pub staleness_cap: f64,
    pub crowd_penalty: f64,
    pub crowd_score_threshold: u8,
    pub depletion_step: f64,
    pub depletion_cap: f64,
    pub spread_widening_rate: f64,
    pub spread_widening_min: f64,
    pub spread_widening_max: f64,
    pub off_hours_multiplier: f64,
    pub off_hours_start_utc: u32,
    pub off_hours_end_utc: u32,
    pub expiry_window_minutes: f64,
    pub gas_min: f64,
    pub gas_max: f64,
    pub fatigue_decay_secs: f64,
    pub seed: Option<u64>,
}

/// Take-profit / stop-loss bands, as fractions of cost.
#[derive(Debug, Clone)]
pub struct ExitBands {
    pub fast_take_profit: Decimal,
    pub fast_stop_loss: Decimal,
    pub slow_take_profit: Decimal,
    pub slow_stop_loss: Decimal,
}

impl ExitBands {
    /// (take_profit, stop_loss) for a market category.
    pub fn for_category(&self, category: MarketCategory) -> (Decimal, Decimal) {
        if category.is_fast() {
            (self.fast_take_profit, self.fast_stop_loss)
        } else {
            (self.slow_take_profit, self.slow_stop_loss)
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub ttl: Duration,
    pub bucket_secs: i64,
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub enabled: bool,
    pub ws_url: String,
    pub chain_id: u64,
    pub confirmations: u64,
    pub max_pending: Duration,
    pub backfill_blocks: u64,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub enabled: bool,
    pub ws_url: String,
    pub min_notional: Decimal,
    pub copy_anonymous: bool,
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub enabled: bool,
    pub data_api_url: String,
    pub interval: Duration,
    pub limit: u32,
    pub min_buy_usdc: Decimal,
    pub max_price: Decimal,
    pub consensus_window: Duration,
    pub rank_cutoff: usize,
    pub skip_slow: bool,
    /// Rows older than this are history, not copyable trades.
    pub max_age: Duration,
}

#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    pub clob_url: String,
    pub gamma_url: String,
    pub max_spread: Decimal,
    pub min_depth_usdc: Decimal,
}

#[derive(Debug, Clone)]
pub struct ParityConfig {
    pub match_window_secs: i64,
    pub price_tolerance: Decimal,
    pub unmatched_after: Duration,
    pub max_results: usize,
    pub report_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub check_interval: Duration,
    pub main_loop_timeout: Duration,
    pub block_stall: Duration,
    pub event_drought: Duration,
    pub signal_drought: Duration,
    pub max_issues: usize,
    pub watchdog_interval: Duration,
    pub heartbeat_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub data_dir: PathBuf,
    pub ledger_file: String,
    pub risk_file: String,
    pub wallet_file: String,
    pub generations: usize,
    pub snapshot_interval: Duration,
    pub max_history: usize,
    pub max_snapshots: usize,
}

impl PersistenceConfig {
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(&self.ledger_file)
    }

    pub fn risk_path(&self) -> PathBuf {
        self.data_dir.join(&self.risk_file)
    }

    pub fn wallet_path(&self) -> PathBuf {
        self.data_dir.join(&self.wallet_file)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            starting_balance: Decimal::from(100),
            cycle_interval: Duration::from_secs(5),
            metrics_addr: None,
            log_format: "pretty".into(),
            tracked_wallets: Vec::new(),
            risk: RiskConfig::default(),
            sizing: SizingConfig::default(),
            stress: StressConfig::default(),
            exits: ExitBands::default(),
            dedup: DedupConfig::default(),
            chain: ChainConfig::default(),
            stream: StreamConfig::default(),
            poll: PollConfig::default(),
            market_data: MarketDataConfig::default(),
            parity: ParityConfig::default(),
            health: HealthConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            exposure_pct: Decimal::new(50, 2),
            market_pct: Decimal::new(6, 2),
            min_trade_pct: Decimal::new(1, 2),
            max_trade_pct: Decimal::new(3, 2),
            min_trade_floor: Decimal::new(25, 2),
            max_trade_floor: Decimal::new(50, 2),
            daily_loss_pct: Decimal::new(30, 2),
            day_window: Duration::from_secs(86_400),
            kill_switch_file: PathBuf::from("STOP_TRADING"),
        }
    }
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            copy_ratio: Decimal::new(1, 2),
            kelly_min_settled: 5,
            kelly_scale: Decimal::new(5, 1),
            winners_curse_pct: Decimal::new(8, 2),
            expiry_block: Duration::from_secs(180),
            high_gas_gwei: Decimal::from(200),
            low_gas_gwei: Decimal::from(50),
            high_gas_multiplier: Decimal::new(15, 1),
            low_gas_multiplier: Decimal::new(75, 2),
            default_fee_bps: 200,
        }
    }
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            api_failure_rate: 0.03,
            rate_limit_window_secs: 3.0,
            rate_limit_reject_rate: 0.15,
            base_fill_rejection: 0.08,
            fatigue_rejection_step: 0.05,
            max_fill_rejection: 0.40,
            partial_fill_rate: 0.12,
            partial_fill_min: 0.35,
            partial_fill_max: 0.85,
            base_slippage: 0.015,
            slippage_noise: 0.025,
            slippage_drift: 0.03,
            staleness_per_sec: 0.001,
            staleness_cap: 0.05,
            crowd_penalty: 0.02,
            crowd_score_threshold: 4,
            depletion_step: 0.01,
            depletion_cap: 0.05,
            spread_widening_rate: 0.10,
            spread_widening_min: 0.01,
            spread_widening_max: 0.04,
            off_hours_multiplier: 1.4,
            off_hours_start_utc: 21,
            off_hours_end_utc: 14,
            expiry_window_minutes: 5.0,
            gas_min: 0.001,
            gas_max: 0.008,
            fatigue_decay_secs: 30.0,
            seed: None,
        }
    }
}

impl Default for ExitBands {
    fn default() -> Self {
        Self {
            fast_take_profit: Decimal::new(20, 2),
            fast_stop_loss: Decimal::new(12, 2),
            slow_take_profit: Decimal::new(30, 2),
            slow_stop_loss: Decimal::new(15, 2),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(1800),
            bucket_secs: 60,
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ws_url: DEFAULT_CHAIN_WS_URL.into(),
            chain_id: 137,
            confirmations: 1,
            max_pending: Duration::from_secs(300),
            backfill_blocks: 5,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ws_url: DEFAULT_STREAM_WS_URL.into(),
            min_notional: Decimal::from(50),
            copy_anonymous: false,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_api_url: DEFAULT_DATA_API_URL.into(),
            interval: Duration::from_secs(15),
            limit: 20,
            min_buy_usdc: Decimal::from(25),
            max_price: Decimal::new(90, 2),
            consensus_window: Duration::from_secs(600),
            rank_cutoff: 50,
            skip_slow: true,
            max_age: Duration::from_secs(300),
        }
    }
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            clob_url: DEFAULT_CLOB_URL.into(),
            gamma_url: DEFAULT_GAMMA_URL.into(),
            max_spread: Decimal::new(10, 2),
            min_depth_usdc: Decimal::from(5),
        }
    }
}

impl Default for ParityConfig {
    fn default() -> Self {
        Self {
            match_window_secs: 30,
            price_tolerance: Decimal::new(1, 2),
            unmatched_after: Duration::from_secs(300),
            max_results: 1000,
            report_interval: Duration::from_secs(300),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            main_loop_timeout: Duration::from_secs(120),
            block_stall: Duration::from_secs(300),
            event_drought: Duration::from_secs(3600),
            signal_drought: Duration::from_secs(7200),
            max_issues: 100,
            watchdog_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(120),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            ledger_file: "ledger.json".into(),
            risk_file: "risk_state.json".into(),
            wallet_file: "wallet_scores.json".into(),
            generations: 5,
            snapshot_interval: Duration::from_secs(60),
            max_history: 1000,
            max_snapshots: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment overlay
// ---------------------------------------------------------------------------

/// Parse an environment variable, keeping `default` when unset or malformed.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Unparseable config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_or(key, default.as_secs()))
}

fn env_string(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();

        let tracked_wallets: Vec<String> = env::var("TRACKED_WALLETS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        let starting_balance: Decimal = env_or("STARTING_BALANCE", d.starting_balance);
        if starting_balance <= Decimal::ZERO {
            anyhow::bail!("STARTING_BALANCE must be positive, got {starting_balance}");
        }

        Ok(Self {
            starting_balance,
            cycle_interval: env_secs("CYCLE_INTERVAL_SECS", d.cycle_interval),
            metrics_addr: env::var("METRICS_ADDR").ok(),
            log_format: env_string("LOG_FORMAT", d.log_format),
            tracked_wallets,

            risk: RiskConfig {
                exposure_pct: env_or("MAX_EXPOSURE_PCT", d.risk.exposure_pct),
                market_pct: env_or("MAX_PER_MARKET_PCT", d.risk.market_pct),
                min_trade_pct: env_or("MIN_TRADE_PCT", d.risk.min_trade_pct),
                max_trade_pct: env_or("MAX_TRADE_PCT", d.risk.max_trade_pct),
                min_trade_floor: env_or("MIN_TRADE_FLOOR", d.risk.min_trade_floor),
                max_trade_floor: env_or("MAX_TRADE_FLOOR", d.risk.max_trade_floor),
                daily_loss_pct: env_or("DAILY_LOSS_PCT", d.risk.daily_loss_pct),
                day_window: env_secs("DAILY_LOSS_WINDOW_SECS", d.risk.day_window),
                kill_switch_file: env::var("KILL_SWITCH_FILE")
                    .map(PathBuf::from)
                    .unwrap_or(d.risk.kill_switch_file),
            },

            sizing: SizingConfig {
                copy_ratio: env_or("COPY_RATIO", d.sizing.copy_ratio),
                kelly_min_settled: env_or("KELLY_MIN_SETTLED", d.sizing.kelly_min_settled),
                kelly_scale: env_or("KELLY_SCALE", d.sizing.kelly_scale),
                winners_curse_pct: env_or("WINNERS_CURSE_PCT", d.sizing.winners_curse_pct),
                expiry_block: env_secs("EXPIRY_BLOCK_SECS", d.sizing.expiry_block),
                high_gas_gwei: env_or("HIGH_GAS_GWEI", d.sizing.high_gas_gwei),
                low_gas_gwei: env_or("LOW_GAS_GWEI", d.sizing.low_gas_gwei),
                high_gas_multiplier: d.sizing.high_gas_multiplier,
                low_gas_multiplier: d.sizing.low_gas_multiplier,
                default_fee_bps: env_or("DEFAULT_FEE_BPS", d.sizing.default_fee_bps),
            },

            stress: StressConfig {
                base_fill_rejection: env_or("STRESS_FILL_REJECTION", d.stress.base_fill_rejection),
                api_failure_rate: env_or("STRESS_API_FAILURE", d.stress.api_failure_rate),
                partial_fill_rate: env_or("STRESS_PARTIAL_FILL", d.stress.partial_fill_rate),
                seed: env::var("STRESS_SEED").ok().and_then(|s| s.parse().ok()),
                ..d.stress
            },

            exits: ExitBands {
                fast_take_profit: env_or("FAST_TAKE_PROFIT", d.exits.fast_take_profit),
                fast_stop_loss: env_or("FAST_STOP_LOSS", d.exits.fast_stop_loss),
                slow_take_profit: env_or("SLOW_TAKE_PROFIT", d.exits.slow_take_profit),
                slow_stop_loss: env_or("SLOW_STOP_LOSS", d.exits.slow_stop_loss),
            },

            dedup: DedupConfig {
                ttl: env_secs("DEDUP_TTL_SECS", d.dedup.ttl),
                bucket_secs: env_or("DEDUP_BUCKET_SECS", d.dedup.bucket_secs),
            },

            chain: ChainConfig {
                enabled: env_or("CHAIN_ENABLED", d.chain.enabled),
                ws_url: env_string("POLYGON_WS_URL", d.chain.ws_url),
                chain_id: env_or("CHAIN_ID", d.chain.chain_id),
                confirmations: env_or("MIN_BLOCKCHAIN_CONFIRMATIONS", d.chain.confirmations),
                max_pending: env_secs("CHAIN_MAX_PENDING_SECS", d.chain.max_pending),
                backfill_blocks: env_or("CHAIN_BACKFILL_BLOCKS", d.chain.backfill_blocks),
            },

            stream: StreamConfig {
                enabled: env_or("STREAM_ENABLED", d.stream.enabled),
                ws_url: env_string("POLYMARKET_WS_URL", d.stream.ws_url),
                min_notional: env_or("STREAM_MIN_NOTIONAL", d.stream.min_notional),
                copy_anonymous: env_or("STREAM_COPY_ANONYMOUS", d.stream.copy_anonymous),
            },

            poll: PollConfig {
                enabled: env_or("POLL_ENABLED", d.poll.enabled),
                data_api_url: env_string("DATA_API_URL", d.poll.data_api_url),
                interval: env_secs("POLL_INTERVAL_SECS", d.poll.interval),
                limit: env_or("POLL_LIMIT", d.poll.limit),
                min_buy_usdc: env_or("POLL_MIN_BUY_USDC", d.poll.min_buy_usdc),
                max_price: env_or("POLL_MAX_PRICE", d.poll.max_price),
                consensus_window: env_secs("CONSENSUS_WINDOW_SECS", d.poll.consensus_window),
                rank_cutoff: env_or("POLL_RANK_CUTOFF", d.poll.rank_cutoff),
                skip_slow: env_or("POLL_SKIP_SLOW", d.poll.skip_slow),
                max_age: env_secs("POLL_MAX_AGE_SECS", d.poll.max_age),
            },

            market_data: MarketDataConfig {
                clob_url: env_string("CLOB_URL", d.market_data.clob_url),
                gamma_url: env_string("GAMMA_URL", d.market_data.gamma_url),
                max_spread: env_or("BOOK_MAX_SPREAD", d.market_data.max_spread),
                min_depth_usdc: env_or("BOOK_MIN_DEPTH_USDC", d.market_data.min_depth_usdc),
            },

            parity: ParityConfig {
                match_window_secs: env_or("PARITY_MATCH_WINDOW_SECS", d.parity.match_window_secs),
                price_tolerance: env_or("PARITY_PRICE_TOLERANCE", d.parity.price_tolerance),
                unmatched_after: env_secs("PARITY_UNMATCHED_SECS", d.parity.unmatched_after),
                max_results: env_or("PARITY_MAX_RESULTS", d.parity.max_results),
                report_interval: env_secs("PARITY_REPORT_SECS", d.parity.report_interval),
            },

            health: HealthConfig {
                check_interval: env_secs("HEALTH_CHECK_SECS", d.health.check_interval),
                main_loop_timeout: env_secs("MAIN_LOOP_TIMEOUT_SECS", d.health.main_loop_timeout),
                heartbeat_timeout: env_secs("HEARTBEAT_TIMEOUT_SECS", d.health.heartbeat_timeout),
                ..d.health
            },

            persistence: PersistenceConfig {
                data_dir: env::var("DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(d.persistence.data_dir),
                generations: env_or("STATE_BACKUP_GENERATIONS", d.persistence.generations),
                ..d.persistence
            },
        })
    }

    /// Rank (1-based) of a tracked wallet, if tracked.
    pub fn wallet_rank(&self, wallet: &str) -> Option<usize> {
        let wallet = wallet.to_lowercase();
        self.tracked_wallets
            .iter()
            .position(|w| *w == wallet)
            .map(|i| i + 1)
    }
}
