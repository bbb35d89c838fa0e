use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};

use whalecopy::config::AppConfig;
use whalecopy::execution::{run_copy_engine, CopyEngine, Ledger, LedgerConfig, RiskGuard, StressSimulator};
use whalecopy::ingestion::chain_listener::{run_chain_listener, ChainListener};
use whalecopy::ingestion::poller::{run_poller, PollDecoder, Poller};
use whalecopy::ingestion::ws_listener::{run_ws_listener, StreamListener};
use whalecopy::ingestion::{AssetRegistry, DedupStore};
use whalecopy::intelligence::{WalletBook, WalletClassifier};
use whalecopy::metrics::init_metrics;
use whalecopy::models::TradeSignal;
use whalecopy::polymarket::{DataClient, MarketDataService, PolymarketService, ResolutionLookup};
use whalecopy::services::{
    run_health_monitor, run_parity_reporter, run_watchdog, HealthMonitor, Liveness, ParityChecker,
    StateFlusher,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;
    whalecopy::init_tracing(&config.log_format);

    // rustls needs an explicit process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let metrics_addr = config
        .metrics_addr
        .as_deref()
        .map(str::parse::<SocketAddr>)
        .transpose()?;
    init_metrics(metrics_addr)?;

    let persistence = &config.persistence;
    std::fs::create_dir_all(&persistence.data_dir)?;
    let now = Utc::now();

    // --- Collaborators ---
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()?;
    let registry = AssetRegistry::new();
    let service = Arc::new(PolymarketService::new(
        http.clone(),
        &config.market_data,
        registry.clone(),
        config.sizing.default_fee_bps,
    ));
    let market_data: Arc<dyn MarketDataService> = service.clone();
    let resolution: Arc<dyn ResolutionLookup> = service;

    // --- Durable state ---
    let wallets: Arc<dyn WalletClassifier> =
        Arc::new(WalletBook::load(persistence.wallet_path(), persistence.generations));
    let risk = Arc::new(RiskGuard::load(
        config.risk.clone(),
        persistence.risk_path(),
        persistence.generations,
        config.starting_balance,
        now,
    ));
    let ledger = Ledger::load(
        LedgerConfig::from_app(&config),
        persistence.ledger_path(),
        persistence.generations,
        Arc::clone(&risk),
        Arc::clone(&wallets),
    );
    risk.reconcile_exposure(ledger.open_cost().await);
    risk.update_limits(ledger.cash_balance().await, ledger.starting_balance().await);

    let dedup = Arc::new(DedupStore::new(&config.dedup));
    let liveness = Arc::new(Liveness::new(now));
    let parity = Arc::new(ParityChecker::new(config.parity.clone()));
    let tracked: HashSet<String> = config.tracked_wallets.iter().cloned().collect();

    let (running_tx, running_rx) = watch::channel(true);
    let (signal_tx, signal_rx) = mpsc::channel::<TradeSignal>(1000);
    let mut handles = Vec::new();

    // --- Signal sources ---
    if config.chain.enabled && !tracked.is_empty() {
        let listener = ChainListener {
            config: config.chain.clone(),
            tracked: tracked.clone(),
            dedup: Arc::clone(&dedup),
            market_data: Arc::clone(&market_data),
            signal_tx: signal_tx.clone(),
            liveness: Arc::clone(&liveness),
            parity: Arc::clone(&parity),
        };
        handles.push(tokio::spawn(run_chain_listener(listener, running_rx.clone())));
    } else {
        tracing::info!("Chain listener disabled");
    }

    if config.stream.enabled {
        let listener = StreamListener {
            config: config.stream.clone(),
            tracked: tracked.clone(),
            registry: registry.clone(),
            signal_tx: signal_tx.clone(),
            liveness: Arc::clone(&liveness),
            bucket_secs: config.dedup.bucket_secs,
        };
        handles.push(tokio::spawn(run_ws_listener(listener, running_rx.clone())));
    }

    if config.poll.enabled && !tracked.is_empty() {
        let poller = Poller {
            client: DataClient::with_base_url(http.clone(), &config.poll.data_api_url),
            decoder: PollDecoder::new(config.poll.clone(), config.dedup.bucket_secs),
            wallets: config.tracked_wallets.clone(),
            registry: registry.clone(),
            signal_tx: signal_tx.clone(),
            liveness: Arc::clone(&liveness),
            parity: Arc::clone(&parity),
        };
        handles.push(tokio::spawn(run_poller(poller, running_rx.clone())));
    } else {
        tracing::warn!("Poller disabled or TRACKED_WALLETS empty");
    }
    drop(signal_tx);

    // --- Main cycle ---
    let engine = Arc::new(CopyEngine {
        config: config.clone(),
        dedup,
        ledger,
        risk,
        wallets,
        market_data,
        stress: Mutex::new(StressSimulator::new(config.stress.clone())),
        liveness: Arc::clone(&liveness),
    });
    let flusher: Arc<dyn StateFlusher> = engine.clone();

    handles.push(tokio::spawn(run_copy_engine(
        Arc::clone(&engine),
        signal_rx,
        resolution,
        running_rx.clone(),
    )));

    // --- Monitors ---
    let monitor = Arc::new(HealthMonitor::new(
        config.health.clone(),
        Arc::clone(&liveness),
        Arc::clone(&flusher),
        config.chain.enabled,
        vec![
            persistence.ledger_path(),
            persistence.risk_path(),
            persistence.wallet_path(),
        ],
    ));
    handles.push(tokio::spawn(run_health_monitor(monitor, running_rx.clone())));
    handles.push(tokio::spawn(run_watchdog(
        Arc::clone(&liveness),
        flusher,
        config.health.watchdog_interval,
        config.health.heartbeat_timeout,
        running_rx.clone(),
    )));
    handles.push(tokio::spawn(run_parity_reporter(parity, running_rx)));

    tracing::info!(
        wallets = tracked.len(),
        balance = %engine.ledger.cash_balance().await,
        "whalecopy running, Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    let _ = running_tx.send(false);
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task failed");
        }
    }

    let stats = engine
        .stress
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .stats();
    let summary = engine.ledger.summary(stats).await;
    tracing::info!(
        cash = %summary.cash_balance,
        total_value = %summary.total_value,
        realized = %summary.realized_pnl,
        trades = summary.total_trades,
        win_rate = %summary.win_rate,
        "Final portfolio"
    );
    Ok(())
}
