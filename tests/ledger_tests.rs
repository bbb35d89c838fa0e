mod common;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

use whalecopy::config::{ExitBands, RiskConfig};
use whalecopy::execution::{EntryFill, ExitQuote, Ledger, LedgerConfig, LegFill, RiskGuard};
use whalecopy::models::{Outcome, PositionKey, PositionStatus};
use whalecopy::persistence::state_store::backup_path;

use common::{make_test_dir, minutes, neutral_book, t0};

fn config() -> LedgerConfig {
    LedgerConfig {
        starting_balance: Decimal::from(100),
        exits: ExitBands::default(),
        snapshot_interval: Duration::from_secs(60),
        max_history: 1000,
        max_snapshots: 100,
    }
}

fn risk() -> Arc<RiskGuard> {
    Arc::new(RiskGuard::in_memory(RiskConfig::default(), Decimal::from(100), t0()))
}

fn leg(outcome: Outcome, price: Decimal, size: Decimal, fee: Decimal) -> LegFill {
    LegFill {
        outcome,
        asset_id: format!("asset-{outcome}"),
        price,
        size,
        fee,
        fee_rate_bps: 200,
        reference_price: price,
    }
}

fn quote(price: Decimal) -> ExitQuote {
    ExitQuote {
        price,
        gas: Decimal::new(3, 3),
        fee_rate_bps: 200,
        reference_price: price,
    }
}

/// Random price in [0.05, 0.95] at 2 dp.
fn random_price(rng: &mut StdRng) -> Decimal {
    Decimal::new(rng.gen_range(5..=95), 2)
}

#[tokio::test]
async fn test_cash_is_conserved_across_random_fills() {
    let ledger = Ledger::new(config(), risk(), neutral_book());
    let mut rng = StdRng::seed_from_u64(11);

    let mut expected_cash = Decimal::from(100);
    let mut expected_pnl = Decimal::ZERO;
    for i in 0..60 {
        let market = format!("m{}", rng.gen_range(0..8));
        let key = PositionKey::directional(&market, Outcome::Yes);
        let now = t0() + minutes(i);

        if ledger.open_position(&key).await.is_some() && rng.gen_bool(0.4) {
            let result = ledger
                .close(&key, &quote(random_price(&mut rng)), PositionStatus::ClosedExit, now)
                .await;
            assert!(result.success);
            expected_cash += result.cost.unwrap();
            expected_pnl += result.realized_pnl.unwrap();
        } else {
            let size = Decimal::new(rng.gen_range(10..200), 1);
            let fill = EntryFill::directional(
                &market,
                leg(Outcome::Yes, random_price(&mut rng), size, Decimal::new(2, 2)),
                Decimal::new(4, 3),
                now,
            );
            let result = ledger.open_or_average(fill).await;
            if result.success {
                expected_cash -= result.cost.unwrap();
            }
        }

        let cash = ledger.cash_balance().await;
        assert_eq!(cash, expected_cash, "step {i}");
        assert!(cash >= Decimal::ZERO);
    }

    let portfolio = ledger.portfolio().await;
    assert_eq!(portfolio.total_realized_pnl, expected_pnl);
    // open cost plus cash plus realized results reconcile to the start
    let open_cost = ledger.open_cost().await;
    assert_eq!(
        portfolio.cash_balance + open_cost - portfolio.total_realized_pnl,
        Decimal::from(100)
    );
}

#[tokio::test]
async fn test_average_price_matches_weighted_mean() {
    let ledger = Ledger::new(
        LedgerConfig {
            starting_balance: Decimal::from(100_000),
            ..config()
        },
        Arc::new(RiskGuard::in_memory(RiskConfig::default(), Decimal::from(100_000), t0())),
        neutral_book(),
    );
    let mut rng = StdRng::seed_from_u64(3);
    let key = PositionKey::directional("avg", Outcome::No);

    let mut notional = Decimal::ZERO;
    let mut shares = Decimal::ZERO;
    for i in 0..25 {
        let price = Decimal::new(rng.gen_range(1_000..9_000), 4);
        let size = Decimal::new(rng.gen_range(1_000..50_000), 3);
        notional += price * size;
        shares += size;

        let fill = EntryFill::directional("avg", leg(Outcome::No, price, size, Decimal::ZERO), Decimal::ZERO, t0() + minutes(i));
        assert!(ledger.open_or_average(fill).await.success);

        let pos = ledger.open_position(&key).await.unwrap();
        let expected = (notional / shares).to_f64().unwrap();
        let actual = pos.avg_price().to_f64().unwrap();
        assert!((expected - actual).abs() < 1e-6, "fill {i}: {expected} vs {actual}");
        assert_eq!(pos.size(), shares);
    }
}

#[tokio::test]
async fn test_paired_position_settles_locked_shares() {
    let ledger = Ledger::new(config(), risk(), neutral_book());
    let fill = EntryFill::paired(
        "pair",
        leg(Outcome::Yes, Decimal::new(48, 2), Decimal::from(10), Decimal::ZERO),
        leg(Outcome::No, Decimal::new(49, 2), Decimal::from(10), Decimal::ZERO),
        Decimal::ZERO,
        t0(),
    );
    assert!(ledger.open_paired(fill).await.success);
    assert_eq!(ledger.cash_balance().await, Decimal::new(903, 1));

    let key = PositionKey::paired("pair");
    let refused = ledger
        .close(&key, &quote(Decimal::new(50, 2)), PositionStatus::ClosedExit, t0())
        .await;
    assert!(!refused.success);

    let pnl = ledger.settle(&key.storage_key(), Outcome::No, t0() + minutes(30)).await;
    // 10 locked shares pay 10.00 against 9.70
    assert_eq!(pnl, Some(Decimal::new(30, 2)));
    assert_eq!(ledger.cash_balance().await, Decimal::new(1003, 1));
    assert_eq!(ledger.settle(&key.storage_key(), Outcome::No, t0()).await, None);
}

#[tokio::test]
async fn test_ledger_survives_restart() {
    let dir = make_test_dir("ledger-restart");
    let path = dir.join("ledger.json");

    {
        let ledger = Ledger::load(config(), &path, 3, risk(), neutral_book());
        let fill = EntryFill::directional(
            "m1",
            leg(Outcome::Yes, Decimal::new(40, 2), Decimal::from(10), Decimal::new(1, 2)),
            Decimal::new(5, 3),
            t0(),
        )
        .with_source("0xWhale", 3);
        assert!(ledger.open_or_average(fill).await.success);
        ledger.persist().await;
    }

    let reloaded = Ledger::load(config(), &path, 3, risk(), neutral_book());
    assert_eq!(reloaded.cash_balance().await, Decimal::new(95985, 3));
    let pos = reloaded
        .open_position(&PositionKey::directional("m1", Outcome::Yes))
        .await
        .unwrap();
    assert_eq!(pos.source_wallet.as_deref(), Some("0xwhale"));
    assert_eq!(pos.total_cost, Decimal::new(4015, 3));
    assert_eq!(reloaded.open_cost().await, Decimal::new(4015, 3));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_corrupt_ledger_recovers_from_backup() {
    let dir = make_test_dir("ledger-backup");
    let path = dir.join("ledger.json");

    {
        let ledger = Ledger::load(config(), &path, 3, risk(), neutral_book());
        for (i, market) in ["a", "b"].iter().enumerate() {
            let fill = EntryFill::directional(
                market,
                leg(Outcome::Yes, Decimal::new(50, 2), Decimal::from(2), Decimal::ZERO),
                Decimal::ZERO,
                t0() + minutes(i as i64),
            );
            // every booked fill is written through, rotating the previous file
            assert!(ledger.open_or_average(fill).await.success);
        }
    }
    assert!(backup_path(&path, 1).exists());

    std::fs::write(&path, b"{\"version\": 3, \"cash_bal").unwrap();
    let recovered = Ledger::load(config(), &path, 3, risk(), neutral_book());
    // the backup predates the second entry
    assert_eq!(recovered.cash_balance().await, Decimal::from(99));
    assert_eq!(recovered.open_count().await, 1);

    for n in 1..=3 {
        let _ = std::fs::write(backup_path(&path, n), b"garbage");
    }
    let fresh = Ledger::load(config(), &path, 3, risk(), neutral_book());
    assert_eq!(fresh.cash_balance().await, Decimal::from(100));
    assert_eq!(fresh.open_count().await, 0);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn test_dust_exit_never_overdraws_cash() {
    let dir = make_test_dir("ledger-dust-exit");
    let path = dir.join("ledger.json");
    let dust = PositionKey::directional("dust", Outcome::Yes);

    {
        let ledger = Ledger::load(config(), &path, 3, risk(), neutral_book());
        let tiny = EntryFill::directional(
            "dust",
            leg(Outcome::Yes, Decimal::new(2, 2), Decimal::new(1, 1), Decimal::ZERO),
            Decimal::ZERO,
            t0(),
        );
        assert!(ledger.open_or_average(tiny).await.success);
        // spend the rest of the cash
        let rest = EntryFill::directional(
            "big",
            leg(Outcome::Yes, Decimal::new(50, 2), Decimal::new(199_996, 3), Decimal::ZERO),
            Decimal::ZERO,
            t0(),
        );
        assert!(ledger.open_or_average(rest).await.success);
        assert_eq!(ledger.cash_balance().await, Decimal::ZERO);

        // 0.001 of proceeds against 0.003 of gas
        let result = ledger
            .close(&dust, &quote(Decimal::new(1, 2)), PositionStatus::ClosedExit, t0() + minutes(1))
            .await;
        assert!(result.success);
        assert_eq!(result.cost, Some(Decimal::ZERO));
        assert_eq!(result.realized_pnl, Some(Decimal::new(-2, 3)));
        assert_eq!(ledger.cash_balance().await, Decimal::ZERO);
    }

    // the written state is loadable as-is, not replaced by a backup
    let reloaded = Ledger::load(config(), &path, 3, risk(), neutral_book());
    assert_eq!(reloaded.cash_balance().await, Decimal::ZERO);
    assert!(reloaded.open_position(&dust).await.is_none());
    assert_eq!(reloaded.open_count().await, 1);

    let _ = std::fs::remove_dir_all(&dir);
}
