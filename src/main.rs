use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use fundwatch::config::Settings;
use fundwatch::db::PostgresStore;
use fundwatch::persistence::{RedisStreakCache, StreakCache};
use fundwatch::reconcile::BatchReport;
use fundwatch::synthetic::{FundScenario, SyntheticFundGenerator};
use fundwatch::{
    AccumulationStreak, InMemoryStore, Reconciler, StreakDirection, StreakService,
};

#[derive(Parser, Debug)]
#[command(name = "fundwatch", version)]
#[command(about = "13F holdings diffs and accumulation streaks")]
struct Cli {
    /// Settings file (defaults to ./fundwatch.toml when present)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute and store missing diffs for funds
    Reconcile {
        /// Fund to reconcile (repeatable)
        #[arg(long = "fund", required_unless_present = "all")]
        funds: Vec<String>,
        /// Reconcile every fund with parsed filings
        #[arg(long, conflicts_with = "funds")]
        all: bool,
    },
    /// Print the current streak for one fund and ticker as JSON
    Streak {
        #[arg(long)]
        fund: String,
        #[arg(long)]
        ticker: String,
        /// Measure distribution instead of accumulation
        #[arg(long)]
        distribution: bool,
        /// Override the configured alert threshold
        #[arg(long)]
        min_streak: Option<usize>,
    },
    /// Run the pipeline over generated fund histories in memory
    Simulate {
        #[arg(long, default_value_t = 4)]
        funds: usize,
        #[arg(long, default_value_t = 8)]
        quarters: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

#[derive(Serialize)]
struct StreakReport<'a> {
    fund_id: &'a str,
    ticker: &'a str,
    #[serde(flatten)]
    streak: &'a AccumulationStreak,
    meets_threshold: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;

    match cli.command {
        Command::Reconcile { funds, all } => run_reconcile(&settings, funds, all).await,
        Command::Streak {
            fund,
            ticker,
            distribution,
            min_streak,
        } => run_streak(&settings, &fund, &ticker, distribution, min_streak).await,
        Command::Simulate {
            funds,
            quarters,
            seed,
        } => run_simulate(&settings, funds, quarters, seed).await,
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fundwatch=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_to_postgres(settings: &Settings) -> anyhow::Result<Arc<PostgresStore>> {
    let Some(database_url) = settings.database_url.as_deref() else {
        bail!("database_url is not set (FUNDWATCH_DATABASE_URL)");
    };

    let store = PostgresStore::new(database_url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(Arc::new(store))
}

/// The cache is optional: without Redis every streak is computed from the store
async fn connect_to_cache(settings: &Settings) -> Option<Arc<dyn StreakCache>> {
    let redis_url = settings.redis_url.as_deref()?;

    match RedisStreakCache::new(redis_url, settings.cache_ttl_secs).await {
        Ok(cache) => Some(Arc::new(cache)),
        Err(e) => {
            tracing::warn!("Streak cache disabled, Redis unavailable: {}", e);
            None
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn run_reconcile(settings: &Settings, funds: Vec<String>, all: bool) -> anyhow::Result<()> {
    let store = connect_to_postgres(settings).await?;

    let fund_ids = if all { store.list_funds().await? } else { funds };
    if fund_ids.is_empty() {
        tracing::info!("No funds to reconcile");
        return Ok(());
    }

    let mut reconciler = Reconciler::new(
        store.clone(),
        store.clone(),
        settings.diff_engine(),
        settings.reconcile_options(),
    );
    if let Some(cache) = connect_to_cache(settings).await {
        reconciler = reconciler.with_cache(cache);
    }

    let report = Arc::new(reconciler).reconcile_funds(fund_ids).await;
    print_report(&report);

    let failed = report.failed_funds().len();
    if failed > 0 {
        bail!("{} fund(s) failed to reconcile", failed);
    }
    Ok(())
}

async fn run_streak(
    settings: &Settings,
    fund_id: &str,
    ticker: &str,
    distribution: bool,
    min_streak: Option<usize>,
) -> anyhow::Result<()> {
    let store = connect_to_postgres(settings).await?;

    let mut service = StreakService::new(store, settings.streak_detector());
    if let Some(cache) = connect_to_cache(settings).await {
        service = service.with_cache(cache);
    }

    let direction = if distribution {
        StreakDirection::Distribution
    } else {
        StreakDirection::Accumulation
    };
    let streak = service.streak_for(fund_id, ticker, direction).await?;
    let threshold = min_streak.unwrap_or(settings.min_streak_length);

    let ticker = fundwatch::normalize_ticker(ticker);
    let report = StreakReport {
        fund_id,
        ticker: &ticker,
        streak: &streak,
        meets_threshold: streak.meets_threshold(threshold),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_simulate(settings: &Settings, funds: usize, quarters: usize, seed: u64) -> anyhow::Result<()> {
    tracing::info!(
        "🧪 Simulating {} funds over {} quarters (seed {})",
        funds,
        quarters,
        seed
    );

    let store = Arc::new(InMemoryStore::new());
    let mut generator = SyntheticFundGenerator::new(seed);
    let scenarios = FundScenario::all();

    for i in 0..funds {
        let scenario = scenarios[i % scenarios.len()];
        let fund_id = format!("SIM-{:02}-{}", i + 1, scenario.as_str());
        for snapshot in generator.generate(&fund_id, scenario, quarters) {
            store.add_snapshot(snapshot);
        }
    }

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        store.clone(),
        settings.diff_engine(),
        settings.reconcile_options(),
    ));
    let report = reconciler.reconcile_funds(store.fund_ids()).await;
    print_report(&report);

    let service = StreakService::new(store.clone(), settings.streak_detector());
    for fund_id in store.fund_ids() {
        for ticker in ["AAPL", "MSFT", "NVDA"] {
            for direction in [StreakDirection::Accumulation, StreakDirection::Distribution] {
                let streak = service.streak_for(&fund_id, ticker, direction).await?;
                if !streak.meets_threshold(settings.min_streak_length) {
                    continue;
                }
                let report = StreakReport {
                    fund_id: &fund_id,
                    ticker,
                    streak: &streak,
                    meets_threshold: true,
                };
                println!("{}", serde_json::to_string(&report)?);
            }
        }
    }

    Ok(())
}

fn print_report(report: &BatchReport) {
    for outcome in &report.funds {
        match &outcome.result {
            Ok(stats) => tracing::info!(
                "  {} → processed {}, skipped {}, errors {}",
                outcome.fund_id,
                stats.processed,
                stats.skipped,
                stats.errors
            ),
            Err(e) => tracing::error!("  {} → failed: {}", outcome.fund_id, e),
        }
    }

    let totals = report.totals();
    tracing::info!(
        "✅ Run {}: {} pairs processed, {} skipped, {} errors across {} funds",
        report.run_id,
        totals.processed,
        totals.skipped,
        totals.errors,
        report.funds.len()
    );
}
