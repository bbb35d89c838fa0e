use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

use super::position_sizer::growth_multiplier;
use crate::config::RiskConfig;
use crate::errors::StateError;
use crate::persistence::StateStore;

const STATE_VERSION: u32 = 1;

/// Reason the guard refuses a new entry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RiskViolation {
    #[error("kill switch active")]
    KillSwitch,

    #[error("daily loss limit reached: lost {loss}, limit {limit}")]
    DailyLoss { loss: Decimal, limit: Decimal },

    #[error("exposure limit: {current} + {cost} exceeds {limit}")]
    Exposure {
        current: Decimal,
        cost: Decimal,
        limit: Decimal,
    },
}

/// Persisted risk counters (`risk_state.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub version: u32,
    pub current_exposure: Decimal,
    pub daily_loss: Decimal,
    pub day_started_at: DateTime<Utc>,
}

impl RiskState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            version: STATE_VERSION,
            current_exposure: Decimal::ZERO,
            daily_loss: Decimal::ZERO,
            day_started_at: now,
        }
    }
}

/// Caps derived from the current balance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskLimits {
    pub max_exposure: Decimal,
    pub max_daily_loss: Decimal,
    pub growth: Decimal,
}

impl RiskLimits {
    pub fn for_balance(config: &RiskConfig, balance: Decimal, starting: Decimal) -> Self {
        let growth = growth_multiplier(balance, starting);
        Self {
            max_exposure: balance * config.exposure_pct * growth,
            max_daily_loss: balance * config.daily_loss_pct * growth,
            growth,
        }
    }
}

struct RiskInner {
    state: RiskState,
    limits: RiskLimits,
}

/// Exposure and daily-loss tracker. Every mutation is persisted after the lock
/// is released.
pub struct RiskGuard {
    config: RiskConfig,
    inner: Mutex<RiskInner>,
    store: Option<StateStore>,
    kill_flag: AtomicBool,
}

impl RiskGuard {
    pub fn in_memory(config: RiskConfig, starting_balance: Decimal, now: DateTime<Utc>) -> Self {
        Self::with_state(config, RiskState::fresh(now), starting_balance, None)
    }

    /// Load `risk_state.json`, recovering from backups and starting fresh when
    /// nothing valid exists.
    pub fn load(
        config: RiskConfig,
        path: impl Into<PathBuf>,
        generations: usize,
        starting_balance: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        let store = StateStore::new(path, generations);
        let state = match store.load::<RiskState, _>(
            &["version", "current_exposure", "daily_loss"],
            |s| s.version == STATE_VERSION && s.current_exposure >= Decimal::ZERO,
        ) {
            Ok(recovered) => {
                tracing::info!(
                    exposure = %recovered.value.current_exposure,
                    daily_loss = %recovered.value.daily_loss,
                    from_backup = recovered.from_backup(),
                    "Risk state loaded"
                );
                recovered.value
            }
            Err(StateError::Missing(_)) => {
                tracing::info!("No risk state on disk, starting fresh");
                RiskState::fresh(now)
            }
            Err(e) => {
                tracing::error!(error = %e, "Risk state unrecoverable, starting fresh");
                RiskState::fresh(now)
            }
        };
        Self::with_state(config, state, starting_balance, Some(store))
    }

    fn with_state(
        config: RiskConfig,
        state: RiskState,
        starting_balance: Decimal,
        store: Option<StateStore>,
    ) -> Self {
        let limits = RiskLimits::for_balance(&config, starting_balance, starting_balance);
        Self {
            config,
            inner: Mutex::new(RiskInner { state, limits }),
            store,
            kill_flag: AtomicBool::new(false),
        }
    }

    /// Recompute caps from the current balance. Called every cycle.
    pub fn update_limits(&self, balance: Decimal, starting_balance: Decimal) {
        let limits = RiskLimits::for_balance(&self.config, balance, starting_balance);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.limits = limits;
    }

    pub fn limits(&self) -> RiskLimits {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).limits
    }

    pub fn state(&self) -> RiskState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state.clone()
    }

    pub fn current_exposure(&self) -> Decimal {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
            .current_exposure
    }

    // -----------------------------------------------------------------------
    // Kill switch
    // -----------------------------------------------------------------------

    pub fn set_kill_switch(&self, on: bool) {
        self.kill_flag.store(on, Ordering::Relaxed);
        if on {
            tracing::warn!("Kill switch raised");
        } else {
            tracing::info!("Kill switch cleared");
        }
    }

    /// Raised flag or the kill-switch file on disk.
    pub fn kill_switch_active(&self) -> bool {
        self.kill_flag.load(Ordering::Relaxed) || self.config.kill_switch_file.exists()
    }

    // -----------------------------------------------------------------------
    // Checks
    // -----------------------------------------------------------------------

    pub fn check_open(&self, cost: Decimal, now: DateTime<Utc>) -> Result<(), RiskViolation> {
        if self.kill_switch_active() {
            return Err(RiskViolation::KillSwitch);
        }

        let (rolled, verdict) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let rolled = self.roll_day(&mut inner.state, now);
            let RiskInner { state, limits } = &*inner;

            let verdict = if state.daily_loss >= limits.max_daily_loss {
                Err(RiskViolation::DailyLoss {
                    loss: state.daily_loss,
                    limit: limits.max_daily_loss,
                })
            } else if state.current_exposure + cost > limits.max_exposure {
                Err(RiskViolation::Exposure {
                    current: state.current_exposure,
                    cost,
                    limit: limits.max_exposure,
                })
            } else {
                Ok(())
            };
            (rolled, verdict)
        };

        if rolled {
            self.persist();
        }
        verdict
    }

    pub fn can_open(&self, cost: Decimal, now: DateTime<Utc>) -> bool {
        match self.check_open(cost, now) {
            Ok(()) => true,
            Err(violation) => {
                tracing::debug!(reason = %violation, cost = %cost, "Risk guard blocked entry");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub fn add_exposure(&self, amount: Decimal) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.state.current_exposure += amount;
            metrics::gauge!("current_exposure").set(decimal_gauge(inner.state.current_exposure));
        }
        self.persist();
    }

    /// Release exposure, never going below zero.
    pub fn remove_exposure(&self, amount: Decimal) {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.state.current_exposure = (inner.state.current_exposure - amount).max(Decimal::ZERO);
            metrics::gauge!("current_exposure").set(decimal_gauge(inner.state.current_exposure));
        }
        self.persist();
    }

    /// Align tracked exposure with the ledger's open cost after a restart.
    pub fn reconcile_exposure(&self, open_cost: Decimal) {
        let drift = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let drift = inner.state.current_exposure - open_cost;
            inner.state.current_exposure = open_cost.max(Decimal::ZERO);
            metrics::gauge!("current_exposure").set(decimal_gauge(inner.state.current_exposure));
            drift
        };
        if drift != Decimal::ZERO {
            tracing::warn!(%drift, %open_cost, "Risk exposure reconciled with ledger");
            self.persist();
        }
    }

    /// Add a realized loss to today's total. Non-positive amounts are ignored.
    pub fn record_loss(&self, amount: Decimal, now: DateTime<Utc>) {
        if amount <= Decimal::ZERO {
            return;
        }
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            self.roll_day(&mut inner.state, now);
            inner.state.daily_loss += amount;
            if inner.state.daily_loss >= inner.limits.max_daily_loss {
                tracing::warn!(
                    daily_loss = %inner.state.daily_loss,
                    limit = %inner.limits.max_daily_loss,
                    "Daily loss limit reached, entries blocked until the window rolls"
                );
            }
        }
        self.persist();
    }

    fn roll_day(&self, state: &mut RiskState, now: DateTime<Utc>) -> bool {
        let window = Duration::from_std(self.config.day_window).unwrap_or(Duration::days(1));
        if now - state.day_started_at < window {
            return false;
        }
        if state.daily_loss > Decimal::ZERO {
            tracing::info!(previous_loss = %state.daily_loss, "Daily loss window rolled");
        }
        state.daily_loss = Decimal::ZERO;
        state.day_started_at = now;
        true
    }

    pub fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = self.state();
        if let Err(e) = store.save_blocking(&snapshot) {
            tracing::error!(error = %e, "Failed to save risk state");
        }
    }
}

fn decimal_gauge(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
    }

    fn config() -> RiskConfig {
        RiskConfig {
            kill_switch_file: PathBuf::from("definitely-not-present-STOP_TRADING"),
            ..RiskConfig::default()
        }
    }

    fn guard() -> RiskGuard {
        RiskGuard::in_memory(config(), Decimal::from(100), t0())
    }

    #[test]
    fn test_limits_scale_with_growth() {
        let cfg = config();
        let base = RiskLimits::for_balance(&cfg, Decimal::from(100), Decimal::from(100));
        assert_eq!(base.max_exposure, Decimal::from(50));
        assert_eq!(base.max_daily_loss, Decimal::from(30));

        let grown = RiskLimits::for_balance(&cfg, Decimal::from(200), Decimal::from(100));
        // 200 * 0.5 * 1.5
        assert_eq!(grown.max_exposure, Decimal::from(150));
    }

    #[test]
    fn test_exposure_cap() {
        let g = guard();
        assert!(g.can_open(Decimal::from(50), t0()));
        g.add_exposure(Decimal::from(45));
        assert!(g.can_open(Decimal::from(5), t0()));
        assert!(matches!(
            g.check_open(Decimal::from(6), t0()),
            Err(RiskViolation::Exposure { .. })
        ));
    }

    #[test]
    fn test_remove_exposure_floors_at_zero() {
        let g = guard();
        g.add_exposure(Decimal::from(5));
        g.remove_exposure(Decimal::from(8));
        assert_eq!(g.current_exposure(), Decimal::ZERO);
    }

    #[test]
    fn test_daily_loss_blocks_until_window_rolls() {
        let g = guard();
        g.record_loss(Decimal::from(-3), t0());
        assert_eq!(g.state().daily_loss, Decimal::ZERO);

        g.record_loss(Decimal::from(30), t0() + Duration::hours(1));
        assert!(matches!(
            g.check_open(Decimal::ONE, t0() + Duration::hours(2)),
            Err(RiskViolation::DailyLoss { .. })
        ));

        // 24h after the window opened the loss is forgotten.
        assert!(g.can_open(Decimal::ONE, t0() + Duration::hours(24)));
        let state = g.state();
        assert_eq!(state.daily_loss, Decimal::ZERO);
        assert_eq!(state.day_started_at, t0() + Duration::hours(24));
    }

    #[test]
    fn test_kill_switch_flag() {
        let g = guard();
        g.set_kill_switch(true);
        assert_eq!(g.check_open(Decimal::ONE, t0()), Err(RiskViolation::KillSwitch));
        g.set_kill_switch(false);
        assert!(g.can_open(Decimal::ONE, t0()));
    }

    #[test]
    fn test_kill_switch_file() {
        let dir = std::env::temp_dir().join(format!("whalecopy-risk-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("STOP_TRADING");
        let g = RiskGuard::in_memory(
            RiskConfig {
                kill_switch_file: file.clone(),
                ..RiskConfig::default()
            },
            Decimal::from(100),
            t0(),
        );
        assert!(!g.kill_switch_active());
        std::fs::write(&file, b"").unwrap();
        assert!(g.kill_switch_active());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_state_survives_reload() {
        let dir = std::env::temp_dir().join(format!("whalecopy-risk-reload-{}", std::process::id()));
        let path = dir.join("risk_state.json");
        {
            let g = RiskGuard::load(config(), &path, 3, Decimal::from(100), t0());
            g.add_exposure(Decimal::from(12));
            g.record_loss(Decimal::from(4), t0());
        }
        let g = RiskGuard::load(config(), &path, 3, Decimal::from(100), t0());
        let state = g.state();
        assert_eq!(state.current_exposure, Decimal::from(12));
        assert_eq!(state.daily_loss, Decimal::from(4));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
