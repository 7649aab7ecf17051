use fundwatch::synthetic::{FundScenario, SyntheticFundGenerator};
use fundwatch::*;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn date(y: i32, m: u32, d: u32) -> chrono::NaiveDate {
    chrono::NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn reconciler(store: &Arc<InMemoryStore>) -> Arc<Reconciler> {
    Arc::new(Reconciler::new(
        store.clone(),
        store.clone(),
        DiffEngine::default(),
        ReconcileOptions::default(),
    ))
}

#[tokio::test]
async fn test_e2e_workflow() {
    // Initialize logging
    let _ = tracing_subscriber::fmt::try_init();

    println!("=== Starting E2E Test ===\n");

    // 1. Seed a fund that trims AAPL once, then buys three quarters running
    println!("1. Seeding filings...");
    let store = Arc::new(InMemoryStore::new());
    let history = [
        ("BERK-2024Q1", date(2024, 2, 14), 1_000, dec!(150000)),
        ("BERK-2024Q2", date(2024, 5, 15), 800, dec!(120000)),
        ("BERK-2024Q3", date(2024, 8, 14), 1_200, dec!(200000)),
        ("BERK-2024Q4", date(2024, 11, 14), 1_500, dec!(270000)),
        ("BERK-2025Q1", date(2025, 2, 14), 2_000, dec!(380000)),
    ];
    for (filing_id, filing_date, shares, value) in history {
        store.add_snapshot(
            HoldingsSnapshot::new("BERK", filing_id, filing_date)
                .with_position(HoldingPosition::new("AAPL", shares, value).with_cusip("037833100"))
                .with_position(HoldingPosition::new("KO", 400, dec!(24000)).with_cusip("191216100")),
        );
    }
    println!("   ✓ {} filings", history.len());

    // 2. Reconcile
    println!("\n2. Reconciling...");
    let report = reconciler(&store).reconcile_funds(vec!["BERK".to_string()]).await;
    let totals = report.totals();
    println!("   ✓ Run {}: {} pairs processed", report.run_id, totals.processed);
    assert_eq!(totals.processed, 4);
    assert_eq!(totals.errors, 0);
    assert!(report.failed_funds().is_empty());

    let q2 = store.diffs_for_filing("BERK-2024Q2");
    assert_eq!(q2.len(), 1, "unchanged KO must not be stored");
    assert_eq!(q2[0].action, DiffAction::Decrease);
    assert_eq!(q2[0].diff_shares, -200);
    assert_eq!(q2[0].diff_value, dec!(-30000));

    // 3. Streaks
    println!("\n3. Detecting streaks...");
    let service = StreakService::new(store.clone(), StreakDetector::default());

    let accumulation = service
        .streak_for("BERK", "aapl", StreakDirection::Accumulation)
        .await
        .unwrap();
    println!(
        "   ✓ AAPL accumulation: {} quarters, ${}",
        accumulation.streak_length, accumulation.total_value
    );
    assert_eq!(accumulation.streak_length, 3);
    assert_eq!(accumulation.total_shares, 1_200);
    assert_eq!(accumulation.total_value, dec!(260000));
    assert_eq!(accumulation.broken_reason, BrokenReason::Reversal);
    assert_eq!(accumulation.latest_filing_date, Some(date(2025, 2, 14)));
    assert_eq!(accumulation.earliest_filing_date, Some(date(2024, 8, 14)));
    assert!(accumulation.meets_threshold(2));

    let distribution = service
        .streak_for("BERK", "AAPL", StreakDirection::Distribution)
        .await
        .unwrap();
    assert_eq!(distribution.streak_length, 0);
    assert!(!distribution.is_active);

    // 4. Rerun is a no-op
    println!("\n4. Rerunning...");
    let written = store.records_written();
    let rerun = reconciler(&store).reconcile_fund("BERK").await.unwrap();
    assert_eq!(rerun.processed, 0);
    assert_eq!(rerun.skipped, 4);
    assert_eq!(store.records_written(), written);
    println!("   ✓ No writes on rerun");

    println!("\n=== E2E Test Complete ===");
}

#[tokio::test]
async fn test_e2e_synthetic_funds() {
    let store = Arc::new(InMemoryStore::new());
    let mut generator = SyntheticFundGenerator::new(2024);

    for (fund_id, scenario) in [
        ("ACC", FundScenario::Accumulator),
        ("DIST", FundScenario::Distributor),
        ("CHURN", FundScenario::Churner),
        ("LATE", FundScenario::LateFiler),
    ] {
        for snapshot in generator.generate(fund_id, scenario, 6) {
            store.add_snapshot(snapshot);
        }
    }

    let report = reconciler(&store).reconcile_funds(store.fund_ids()).await;
    assert_eq!(report.funds.len(), 4);
    assert!(report.failed_funds().is_empty());
    assert_eq!(report.totals().processed, 20);
    assert_eq!(report.totals().errors, 0);

    let service = StreakService::new(store.clone(), StreakDetector::default());

    // Core names only ever grow, so nothing can reverse the walk
    let acc = service
        .streak_for("ACC", "AAPL", StreakDirection::Accumulation)
        .await
        .unwrap();
    assert_eq!(acc.broken_reason, BrokenReason::None);
    assert!(acc.streak_length <= 5);
    let acc_dist = service
        .streak_for("ACC", "AAPL", StreakDirection::Distribution)
        .await
        .unwrap();
    assert_eq!(acc_dist.streak_length, 0);

    // The skipped quarter stops the walk before the early history
    let late = service
        .streak_for("LATE", "AAPL", StreakDirection::Accumulation)
        .await
        .unwrap();
    assert_eq!(late.broken_reason, BrokenReason::GapTooLarge);
    assert!(late.streak_length <= 3);

    // A looser gap threshold walks straight through it
    let lenient = StreakService::new(store.clone(), StreakDetector::new(7.0, false));
    let late_lenient = lenient
        .streak_for("LATE", "AAPL", StreakDirection::Accumulation)
        .await
        .unwrap();
    assert_eq!(late_lenient.broken_reason, BrokenReason::None);
    assert!(late_lenient.streak_length >= late.streak_length);
}
