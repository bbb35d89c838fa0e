use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use super::classifier::classify_market;
use super::{WalletClassifier, WalletQuality};
use crate::errors::StateError;
use crate::models::MarketCategory;
use crate::persistence::StateStore;

const STATE_VERSION: u32 = 1;
/// Copies required before the composite score replaces the neutral 1.0.
const MIN_COPIES_FOR_SCORE: u32 = 3;
/// Settled results required in a category before its own score is used.
const MIN_CATEGORY_SETTLED: u32 = 3;
/// Settled results after which a low score cuts a wallet off.
const CUTOFF_MIN_SETTLED: u32 = 5;
const MAX_SCORE: Decimal = Decimal::from_parts(3, 0, 0, false, 0);
const MAX_CACHED_MARKETS: usize = 500;

fn cutoff_score() -> Decimal {
    Decimal::new(3, 1)
}

fn prior() -> Decimal {
    Decimal::TWO
}

// ---------------------------------------------------------------------------
// Persisted state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryStats {
    pub copies: u32,
    pub wins: u32,
    pub losses: u32,
    pub pnl: Decimal,
}

impl CategoryStats {
    pub fn settled(&self) -> u32 {
        self.wins + self.losses
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletStats {
    pub wallet: String,
    pub total_copies: u32,
    pub total_invested: Decimal,
    pub wins: u32,
    pub losses: u32,
    pub net_pnl: Decimal,
    pub best_trade_pnl: Decimal,
    pub worst_trade_pnl: Decimal,
    /// Positive for consecutive wins, negative for consecutive losses.
    pub streak: i32,
    /// Beta(2, 2) posterior counts.
    pub bayes_alpha: Decimal,
    pub bayes_beta: Decimal,
    pub categories: HashMap<MarketCategory, CategoryStats>,
    pub score: Decimal,
    pub first_copy_at: DateTime<Utc>,
    pub last_copy_at: Option<DateTime<Utc>>,
}

impl WalletStats {
    fn new(wallet: &str, now: DateTime<Utc>) -> Self {
        Self {
            wallet: wallet.to_string(),
            total_copies: 0,
            total_invested: Decimal::ZERO,
            wins: 0,
            losses: 0,
            net_pnl: Decimal::ZERO,
            best_trade_pnl: Decimal::ZERO,
            worst_trade_pnl: Decimal::ZERO,
            streak: 0,
            bayes_alpha: prior(),
            bayes_beta: prior(),
            categories: HashMap::new(),
            score: Decimal::ONE,
            first_copy_at: now,
            last_copy_at: None,
        }
    }

    pub fn settled(&self) -> u32 {
        self.wins + self.losses
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalletBookState {
    version: u32,
    wallets: HashMap<String, WalletStats>,
    market_categories: HashMap<String, MarketCategory>,
}

impl Default for WalletBookState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            wallets: HashMap::new(),
            market_categories: HashMap::new(),
        }
    }
}

/// One row of the wallet leaderboard, ranked by what copying the wallet earned us.
#[derive(Debug, Clone, Serialize)]
pub struct WalletRanking {
    pub wallet: String,
    pub total_copies: u32,
    pub settled: u32,
    pub wins: u32,
    pub losses: u32,
    pub net_pnl: Decimal,
    pub roi: Decimal,
    pub score: Decimal,
    pub streak: i32,
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Composite score in [0, 3]: 50% posterior win rate, 35% ROI, 15% volume.
fn composite(win_rate: Decimal, roi: Decimal, confidence: Decimal) -> Decimal {
    let wr_score = win_rate * Decimal::TWO;
    let roi_score = (roi * Decimal::from(5)).clamp(Decimal::NEGATIVE_ONE, Decimal::ONE);
    let vol_score = confidence * Decimal::new(5, 1);
    let raw = Decimal::ONE
        + (wr_score - Decimal::ONE) * Decimal::new(50, 2)
        + roi_score * Decimal::new(35, 2)
        + vol_score * Decimal::new(15, 2);
    raw.clamp(Decimal::ZERO, MAX_SCORE).round_dp(2)
}

/// Overall score of a wallet.
pub fn overall_score(stats: &WalletStats) -> Decimal {
    let settled = stats.settled();
    if stats.total_copies < MIN_COPIES_FOR_SCORE || settled == 0 {
        return Decimal::ONE;
    }
    let posterior = stats.bayes_alpha / (stats.bayes_alpha + stats.bayes_beta);
    let invested = stats.total_invested.max(Decimal::new(1, 2));
    let roi = stats.net_pnl / invested;
    let confidence = (Decimal::from(settled) / Decimal::from(20)).min(Decimal::ONE);
    composite(posterior, roi, confidence)
}

/// Category-specific score, or the overall score while the category is thin.
pub fn category_score(stats: &WalletStats, category: MarketCategory) -> Decimal {
    let Some(cat) = stats.categories.get(&category) else {
        return stats.score;
    };
    let settled = cat.settled();
    if settled < MIN_CATEGORY_SETTLED {
        return stats.score;
    }
    let alpha = prior() + Decimal::from(cat.wins);
    let beta = prior() + Decimal::from(cat.losses);
    let win_rate = alpha / (alpha + beta);

    let avg_cost = (stats.total_invested / Decimal::from(stats.total_copies.max(1)))
        .max(Decimal::new(1, 2));
    let invested = (Decimal::from(cat.copies) * avg_cost).max(Decimal::new(1, 2));
    let roi = cat.pnl / invested;
    let confidence = (Decimal::from(settled) / Decimal::from(10)).min(Decimal::ONE);
    composite(win_rate, roi, confidence)
}

// ---------------------------------------------------------------------------
// WalletBook
// ---------------------------------------------------------------------------

/// Default wallet classifier: learns from our own copy results and persists
/// them with the durable-state utility.
#[derive(Debug)]
pub struct WalletBook {
    state: Mutex<WalletBookState>,
    store: Option<StateStore>,
}

impl WalletBook {
    /// Book without persistence.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(WalletBookState::default()),
            store: None,
        }
    }

    /// Load the book from `path`, starting fresh when nothing valid is on disk.
    pub fn load(path: impl Into<PathBuf>, generations: usize) -> Self {
        let store = StateStore::new(path, generations);
        let state = match store.load::<WalletBookState, _>(&["version", "wallets"], |s| {
            s.version == STATE_VERSION
        }) {
            Ok(recovered) => {
                let scored = recovered
                    .value
                    .wallets
                    .values()
                    .filter(|w| w.total_copies >= MIN_COPIES_FOR_SCORE)
                    .count();
                tracing::info!(
                    wallets = recovered.value.wallets.len(),
                    scored,
                    from_backup = recovered.from_backup(),
                    "Wallet book loaded"
                );
                recovered.value
            }
            Err(StateError::Missing(_)) => {
                tracing::info!("No wallet book on disk, starting fresh");
                WalletBookState::default()
            }
            Err(e) => {
                tracing::error!(error = %e, "Wallet book unrecoverable, starting fresh");
                WalletBookState::default()
            }
        };
        Self {
            state: Mutex::new(state),
            store: Some(store),
        }
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = self.state.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Err(e) = store.save_blocking(&snapshot) {
            tracing::error!(error = %e, "Failed to save wallet book");
        }
    }

    pub fn stats(&self, wallet: &str) -> Option<WalletStats> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.wallets.get(&wallet.to_lowercase()).cloned()
    }

    /// Wallets ranked by net PnL from copying them.
    pub fn rankings(&self, top_n: usize) -> Vec<WalletRanking> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut ranked: Vec<WalletRanking> = state
            .wallets
            .values()
            .map(|s| WalletRanking {
                wallet: s.wallet.clone(),
                total_copies: s.total_copies,
                settled: s.settled(),
                wins: s.wins,
                losses: s.losses,
                net_pnl: s.net_pnl,
                roi: (s.net_pnl / s.total_invested.max(Decimal::new(1, 2))).round_dp(4),
                score: s.score,
                streak: s.streak,
            })
            .collect();
        ranked.sort_by(|a, b| b.net_pnl.cmp(&a.net_pnl));
        ranked.truncate(top_n);
        ranked
    }

    /// Number of wallets currently cut off.
    pub fn cut_off_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .wallets
            .values()
            .filter(|s| s.settled() >= CUTOFF_MIN_SETTLED && s.score < cutoff_score())
            .count()
    }
}

impl WalletClassifier for WalletBook {
    fn quality(&self, wallet: &str, category: MarketCategory) -> WalletQuality {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(stats) = state.wallets.get(&wallet.to_lowercase()) else {
            return WalletQuality::neutral();
        };

        let score = category_score(stats, category);
        let cut_off = stats.settled() >= CUTOFF_MIN_SETTLED && score < cutoff_score();
        let cat = stats.categories.get(&category).cloned().unwrap_or_default();

        WalletQuality {
            multiplier: if cut_off { Decimal::ZERO } else { score },
            cut_off,
            category_settled: cat.settled(),
            category_wins: cat.wins,
            category_losses: cat.losses,
        }
    }

    fn market_category(&self, market_id: &str, title: Option<&str>) -> MarketCategory {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = state.market_categories.get(market_id) {
            return *cached;
        }
        let category = classify_market(title.unwrap_or_default());
        // Unknown titles may be filled in later, so only cache real classifications.
        if title.is_some() {
            if state.market_categories.len() >= MAX_CACHED_MARKETS {
                state.market_categories.clear();
            }
            state.market_categories.insert(market_id.to_string(), category);
        }
        category
    }

    fn record_entry(&self, wallet: &str, category: MarketCategory, cost: Decimal) {
        if wallet.is_empty() {
            return;
        }
        {
            let now = Utc::now();
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let key = wallet.to_lowercase();
            let stats = state
                .wallets
                .entry(key.clone())
                .or_insert_with(|| WalletStats::new(&key, now));
            stats.total_copies += 1;
            stats.total_invested += cost;
            stats.last_copy_at = Some(now);
            stats.categories.entry(category).or_default().copies += 1;
        }
        self.persist();
    }

    fn record_result(&self, wallet: &str, category: MarketCategory, realized_pnl: Decimal) {
        if wallet.is_empty() {
            return;
        }
        {
            let now = Utc::now();
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let key = wallet.to_lowercase();
            let stats = state
                .wallets
                .entry(key.clone())
                .or_insert_with(|| WalletStats::new(&key, now));

            let won = realized_pnl >= Decimal::ZERO;
            if won {
                stats.wins += 1;
                stats.streak = stats.streak.max(0) + 1;
                stats.bayes_alpha += Decimal::ONE;
            } else {
                stats.losses += 1;
                stats.streak = stats.streak.min(0) - 1;
                stats.bayes_beta += Decimal::ONE;
            }
            stats.net_pnl += realized_pnl;
            stats.best_trade_pnl = stats.best_trade_pnl.max(realized_pnl);
            stats.worst_trade_pnl = stats.worst_trade_pnl.min(realized_pnl);

            if let Some(cat) = stats.categories.get_mut(&category) {
                if won {
                    cat.wins += 1;
                } else {
                    cat.losses += 1;
                }
                cat.pnl += realized_pnl;
            }

            stats.score = overall_score(stats);
            tracing::info!(
                wallet = %key,
                category = %category,
                pnl = %realized_pnl,
                score = %stats.score,
                wins = stats.wins,
                losses = stats.losses,
                "Wallet result recorded"
            );
        }
        self.persist();
    }

    fn flush(&self) {
        self.persist();
    }
}
