mod common;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use whalecopy::config::AppConfig;
use whalecopy::errors::StateError;
use whalecopy::execution::{CopyEngine, Ledger, LedgerConfig, RiskGuard, StressSimulator};
use whalecopy::ingestion::DedupStore;
use whalecopy::intelligence::{WalletBook, WalletClassifier};
use whalecopy::models::{Outcome, PositionKey};
use whalecopy::persistence::state_store::backup_path;
use whalecopy::persistence::{RecoverySource, StateStore};
use whalecopy::services::{Liveness, StateFlusher};

use common::{buy_signal, frictionless, make_test_dir, t0, StubMarketData};

#[derive(Debug, Serialize, Deserialize)]
struct Counter {
    version: u32,
    value: u32,
}

fn load(store: &StateStore) -> Result<u32, StateError> {
    store
        .load::<Counter, _>(&["version", "value"], |c| c.version == 1)
        .map(|r| r.value.value)
}

#[test]
fn test_corrupt_primary_falls_back_one_generation() {
    let dir = make_test_dir("state-recovery");
    let path = dir.join("counter.json");
    let store = StateStore::new(&path, 3);

    for value in 1..=4 {
        store.save(&Counter { version: 1, value }).unwrap();
    }
    assert_eq!(load(&store).unwrap(), 4);

    std::fs::write(&path, b"{\"version\": 1, \"val").unwrap();
    let recovered = store
        .load::<Counter, _>(&["version", "value"], |c| c.version == 1)
        .unwrap();
    assert_eq!(recovered.value.value, 3);
    assert_eq!(recovered.source, RecoverySource::Backup(1));

    // bak2 and bak3 hold 2 and 1
    std::fs::write(backup_path(&path, 1), b"[]").unwrap();
    assert_eq!(load(&store).unwrap(), 2);

    for n in 2..=3 {
        std::fs::write(backup_path(&path, n), b"not json").unwrap();
    }
    match load(&store) {
        Err(StateError::NoValidState { tried, .. }) => assert_eq!(tried, 4),
        other => panic!("expected NoValidState, got {other:?}"),
    }

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_wrong_version_is_skipped() {
    let dir = make_test_dir("state-version");
    let path = dir.join("counter.json");
    let store = StateStore::new(&path, 2);

    store.save(&Counter { version: 1, value: 10 }).unwrap();
    store.save(&Counter { version: 2, value: 11 }).unwrap();
    assert_eq!(load(&store).unwrap(), 10);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_flush_and_restart_restores_every_store() {
    let dir = make_test_dir("state-restart");
    let mut config = AppConfig {
        stress: frictionless(),
        ..AppConfig::default()
    };
    config.persistence.data_dir = dir.clone();
    config.sizing.default_fee_bps = 0;
    let persistence = config.persistence.clone();

    let open = |config: &AppConfig| {
        let wallets: Arc<dyn WalletClassifier> =
            Arc::new(WalletBook::load(persistence.wallet_path(), persistence.generations));
        let risk = Arc::new(RiskGuard::load(
            config.risk.clone(),
            persistence.risk_path(),
            persistence.generations,
            config.starting_balance,
            t0(),
        ));
        let ledger = Ledger::load(
            LedgerConfig::from_app(config),
            persistence.ledger_path(),
            persistence.generations,
            Arc::clone(&risk),
            Arc::clone(&wallets),
        );
        CopyEngine {
            config: config.clone(),
            dedup: Arc::new(DedupStore::new(&config.dedup)),
            ledger,
            risk,
            wallets,
            market_data: Arc::new(StubMarketData::default()),
            stress: Mutex::new(StressSimulator::new(config.stress.clone())),
            liveness: Arc::new(Liveness::new(t0())),
        }
    };

    let engine = open(&config);
    let signal = buy_signal("0xWhale", "m1", Outcome::Yes, Decimal::new(40, 2), t0());
    let result = engine.process_signal(&signal, t0()).await;
    assert!(result.success, "{}", result.reason_str());
    let cost = result.cost.unwrap();
    engine.flush_all().await;
    drop(engine);

    let restarted = open(&config);
    restarted.risk.reconcile_exposure(restarted.ledger.open_cost().await);
    assert_eq!(restarted.ledger.cash_balance().await, Decimal::from(100) - cost);
    assert_eq!(restarted.risk.current_exposure(), cost);
    assert!(restarted
        .ledger
        .open_position(&PositionKey::directional("m1", Outcome::Yes))
        .await
        .is_some());
    let book = WalletBook::load(persistence.wallet_path(), persistence.generations);
    assert_eq!(book.stats("0xwhale").map(|s| s.total_copies), Some(1));

    // a fresh process has a fresh dedup window: the id is accepted again
    assert!(restarted.dedup.record_or_reject(&signal, t0()));

    let _ = std::fs::remove_dir_all(&dir);
}
