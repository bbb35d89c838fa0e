use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

use crate::config::HealthConfig;

// ---------------------------------------------------------------------------
// Liveness stamps
// ---------------------------------------------------------------------------

/// Last-activity timestamps written by the workers and read by the monitors.
/// Stored as unix milliseconds; zero means "never".
#[derive(Debug)]
pub struct Liveness {
    main_loop: AtomicI64,
    block: AtomicI64,
    chain_event: AtomicI64,
    signal: AtomicI64,
    trade: AtomicI64,
    chain_reconnect: AtomicBool,
}

impl Liveness {
    /// Main loop and block stamps start at `now` so a fresh process gets a
    /// full timeout before it is flagged.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            main_loop: AtomicI64::new(now.timestamp_millis()),
            block: AtomicI64::new(now.timestamp_millis()),
            chain_event: AtomicI64::new(0),
            signal: AtomicI64::new(0),
            trade: AtomicI64::new(0),
            chain_reconnect: AtomicBool::new(false),
        }
    }

    pub fn stamp_main_loop(&self, now: DateTime<Utc>) {
        self.main_loop.store(now.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn stamp_block(&self, now: DateTime<Utc>) {
        self.block.store(now.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn stamp_chain_event(&self, now: DateTime<Utc>) {
        self.chain_event.store(now.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn stamp_signal(&self, now: DateTime<Utc>) {
        self.signal.store(now.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn stamp_trade(&self, now: DateTime<Utc>) {
        self.trade.store(now.timestamp_millis(), Ordering::Relaxed);
    }

    pub fn main_loop_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        age(&self.main_loop, now)
    }

    pub fn block_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        age(&self.block, now)
    }

    pub fn chain_event_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        age(&self.chain_event, now)
    }

    pub fn signal_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        age(&self.signal, now)
    }

    pub fn trade_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        age(&self.trade, now)
    }

    pub fn request_chain_reconnect(&self) {
        self.chain_reconnect.store(true, Ordering::SeqCst);
    }

    /// Consume a pending reconnect request.
    pub fn take_chain_reconnect(&self) -> bool {
        self.chain_reconnect.swap(false, Ordering::SeqCst)
    }
}

fn age(stamp: &AtomicI64, now: DateTime<Utc>) -> Option<Duration> {
    let ms = stamp.load(Ordering::Relaxed);
    if ms <= 0 {
        return None;
    }
    let elapsed = (now.timestamp_millis() - ms).max(0) as u64;
    Some(Duration::from_millis(elapsed))
}

// ---------------------------------------------------------------------------
// Emergency persistence hook
// ---------------------------------------------------------------------------

/// Something that can flush every piece of durable state on demand.
#[async_trait]
pub trait StateFlusher: Send + Sync {
    async fn flush_all(&self);
}

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    EmergencySave,
    ChainReconnect,
    Monitor,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthIssue {
    pub severity: Severity,
    pub component: &'static str,
    pub message: String,
    pub action: RecoveryAction,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallHealth {
    Healthy,
    Warning,
    Degraded,
    Critical,
}

impl OverallHealth {
    pub fn from_issues(issues: &[HealthIssue]) -> Self {
        match issues.iter().map(|i| i.severity).max() {
            Some(Severity::Critical) => OverallHealth::Critical,
            Some(Severity::High) => OverallHealth::Degraded,
            Some(Severity::Medium) => OverallHealth::Warning,
            Some(Severity::Low) | None => OverallHealth::Healthy,
        }
    }
}

impl fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverallHealth::Healthy => "HEALTHY",
            OverallHealth::Warning => "WARNING",
            OverallHealth::Degraded => "DEGRADED",
            OverallHealth::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall: OverallHealth,
    pub checks_run: u64,
    pub issues_detected: u64,
    pub auto_recoveries: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub recent_issues: Vec<HealthIssue>,
}

#[derive(Debug)]
struct MonitorState {
    overall: OverallHealth,
    issues: VecDeque<HealthIssue>,
    checks_run: u64,
    issues_detected: u64,
    auto_recoveries: u64,
    last_check: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// HealthMonitor
// ---------------------------------------------------------------------------

pub struct HealthMonitor {
    config: HealthConfig,
    liveness: Arc<Liveness>,
    flusher: Arc<dyn StateFlusher>,
    chain_enabled: bool,
    /// State files that must parse as JSON when present.
    state_files: Vec<PathBuf>,
    state: Mutex<MonitorState>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        liveness: Arc<Liveness>,
        flusher: Arc<dyn StateFlusher>,
        chain_enabled: bool,
        state_files: Vec<PathBuf>,
    ) -> Self {
        Self {
            config,
            liveness,
            flusher,
            chain_enabled,
            state_files,
            state: Mutex::new(MonitorState {
                overall: OverallHealth::Healthy,
                issues: VecDeque::new(),
                checks_run: 0,
                issues_detected: 0,
                auto_recoveries: 0,
                last_check: None,
            }),
        }
    }

    /// Inspect the liveness stamps and state files without acting on them.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Vec<HealthIssue> {
        let mut issues = Vec::new();
        let cfg = &self.config;

        if let Some(age) = self.liveness.main_loop_age(now) {
            if age > cfg.main_loop_timeout {
                issues.push(issue(
                    Severity::Critical,
                    "main_loop",
                    format!("Heartbeat timeout ({}s)", age.as_secs()),
                    RecoveryAction::EmergencySave,
                    now,
                ));
            }
        }

        if self.chain_enabled {
            if let Some(age) = self.liveness.block_age(now) {
                if age > cfg.block_stall {
                    issues.push(issue(
                        Severity::High,
                        "chain_listener",
                        format!("No blocks for {}s", age.as_secs()),
                        RecoveryAction::ChainReconnect,
                        now,
                    ));
                }
            }
            if let Some(age) = self.liveness.chain_event_age(now) {
                if age > cfg.event_drought {
                    issues.push(issue(
                        Severity::Medium,
                        "chain_listener",
                        format!("No events for {} minutes", age.as_secs() / 60),
                        RecoveryAction::Monitor,
                        now,
                    ));
                }
            }
        }

        if let Some(age) = self.liveness.signal_age(now) {
            if age > cfg.signal_drought {
                issues.push(issue(
                    Severity::Low,
                    "signals",
                    format!("No signals for {:.1} hours", age.as_secs_f64() / 3600.0),
                    RecoveryAction::Monitor,
                    now,
                ));
            }
        }

        if let Some(state_issue) = self.check_state_files(now) {
            issues.push(state_issue);
        }

        issues
    }

    fn check_state_files(&self, now: DateTime<Utc>) -> Option<HealthIssue> {
        for path in &self.state_files {
            // Missing is a fresh start.
            let Ok(raw) = std::fs::read_to_string(path) else {
                if path.exists() {
                    return Some(issue(
                        Severity::Medium,
                        "state_persistence",
                        format!("Cannot read {}", path.display()),
                        RecoveryAction::Monitor,
                        now,
                    ));
                }
                continue;
            };
            if serde_json::from_str::<serde_json::Value>(&raw).is_err() {
                return Some(issue(
                    Severity::High,
                    "state_persistence",
                    format!("Corrupted file: {}", path.display()),
                    RecoveryAction::Monitor,
                    now,
                ));
            }
        }
        None
    }

    /// Evaluate, record and act on the current issues.
    pub async fn run_checks(&self, now: DateTime<Utc>) -> OverallHealth {
        let issues = self.evaluate(now);
        let overall = OverallHealth::from_issues(&issues);

        let mut recoveries = 0u64;
        for i in &issues {
            match i.severity {
                Severity::Critical | Severity::High => tracing::error!(
                    severity = %i.severity,
                    component = i.component,
                    "{}",
                    i.message
                ),
                Severity::Medium => tracing::warn!(
                    severity = %i.severity,
                    component = i.component,
                    "{}",
                    i.message
                ),
                Severity::Low => tracing::info!(
                    severity = %i.severity,
                    component = i.component,
                    "{}",
                    i.message
                ),
            }
            match i.action {
                RecoveryAction::EmergencySave => {
                    tracing::warn!("Emergency state save triggered");
                    self.flusher.flush_all().await;
                    recoveries += 1;
                }
                RecoveryAction::ChainReconnect => {
                    tracing::warn!("Forcing chain listener reconnect");
                    self.liveness.request_chain_reconnect();
                    recoveries += 1;
                }
                RecoveryAction::Monitor => {}
            }
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.checks_run += 1;
        state.last_check = Some(now);
        state.issues_detected += issues.len() as u64;
        state.auto_recoveries += recoveries;
        state.overall = overall;
        for i in issues {
            state.issues.push_back(i);
        }
        while state.issues.len() > self.config.max_issues {
            state.issues.pop_front();
        }
        overall
    }

    pub fn status(&self) -> HealthStatus {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        HealthStatus {
            overall: state.overall,
            checks_run: state.checks_run,
            issues_detected: state.issues_detected,
            auto_recoveries: state.auto_recoveries,
            last_check: state.last_check,
            recent_issues: state.issues.iter().rev().take(10).cloned().collect(),
        }
    }
}

fn issue(
    severity: Severity,
    component: &'static str,
    message: String,
    action: RecoveryAction,
    at: DateTime<Utc>,
) -> HealthIssue {
    HealthIssue {
        severity,
        component,
        message,
        action,
        at,
    }
}

/// Run the health checks every `check_interval` until stopped.
pub async fn run_health_monitor(monitor: Arc<HealthMonitor>, mut running: watch::Receiver<bool>) {
    let mut timer = interval(monitor.config.check_interval);
    timer.tick().await;
    tracing::info!(
        interval_secs = monitor.config.check_interval.as_secs(),
        "Health monitor started"
    );

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let overall = monitor.run_checks(Utc::now()).await;
                metrics::gauge!("health_status").set(match overall {
                    OverallHealth::Healthy => 0.0,
                    OverallHealth::Warning => 1.0,
                    OverallHealth::Degraded => 2.0,
                    OverallHealth::Critical => 3.0,
                });
            }
            _ = running.changed() => {
                if !*running.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("Health monitor stopped");
}
