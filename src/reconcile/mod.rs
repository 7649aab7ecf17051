use governor::{Quota, RateLimiter};
use serde::Serialize;
use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use crate::diff::DiffEngine;
use crate::error::{DiffError, Result};
use crate::models::{FilingMeta, HoldingsSnapshot};
use crate::persistence::StreakCache;
use crate::store::{DiffStore, FilingProvider};

// Type alias for the rate limiter to simplify signatures
type StoreRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Counts from reconciling one fund (or a whole batch, when summed)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileStats {
    /// Filing pairs diffed and persisted this run
    pub processed: usize,
    /// Pairs already diffed, or whose new filing has no stock holdings
    pub skipped: usize,
    /// Pairs that failed; they are retried on the next run
    pub errors: usize,
    /// New-side filing ids of the failed pairs
    pub failed_filings: Vec<String>,
}

impl ReconcileStats {
    fn absorb(&mut self, other: &ReconcileStats) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.errors += other.errors;
        self.failed_filings.extend(other.failed_filings.iter().cloned());
    }
}

/// Result of one fund inside a batch run
#[derive(Debug)]
pub struct FundOutcome {
    pub fund_id: String,
    pub result: Result<ReconcileStats>,
}

/// Result of `reconcile_funds`
#[derive(Debug)]
pub struct BatchReport {
    pub run_id: Uuid,
    /// One entry per fund, sorted by fund id
    pub funds: Vec<FundOutcome>,
}

impl BatchReport {
    /// Pair counts summed over every fund that completed
    pub fn totals(&self) -> ReconcileStats {
        let mut totals = ReconcileStats::default();
        for outcome in &self.funds {
            if let Ok(stats) = &outcome.result {
                totals.absorb(stats);
            }
        }
        totals
    }

    /// Funds whose run aborted entirely (listing failed, deadline hit)
    pub fn failed_funds(&self) -> Vec<&FundOutcome> {
        self.funds.iter().filter(|o| o.result.is_err()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Funds reconciled at the same time in a batch
    pub max_concurrent_funds: usize,
    /// Deadline for one fund's whole chain
    pub fund_timeout: Duration,
    /// Store round-trips per second across all funds; None = unlimited
    pub store_requests_per_second: Option<u32>,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            max_concurrent_funds: 4,
            fund_timeout: Duration::from_secs(300),
            store_requests_per_second: None,
        }
    }
}

enum PairOutcome {
    Processed { new_snapshot: HoldingsSnapshot },
    AlreadyDiffed,
    NothingToDiff { new_snapshot: Option<HoldingsSnapshot> },
}

/// Walks each fund's filings in chronological order and makes sure every
/// consecutive pair has its diffs stored, computing missing ones once.
pub struct Reconciler {
    filings: Arc<dyn FilingProvider>,
    diffs: Arc<dyn DiffStore>,
    cache: Option<Arc<dyn StreakCache>>,
    engine: DiffEngine,
    options: ReconcileOptions,
    rate_limiter: Option<Arc<StoreRateLimiter>>,
}

impl Reconciler {
    pub fn new(
        filings: Arc<dyn FilingProvider>,
        diffs: Arc<dyn DiffStore>,
        engine: DiffEngine,
        options: ReconcileOptions,
    ) -> Self {
        let rate_limiter = options
            .store_requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps))));

        Self {
            filings,
            diffs,
            cache: None,
            engine,
            options,
            rate_limiter,
        }
    }

    /// Invalidate cached streaks for every ticker a new diff touches
    pub fn with_cache(mut self, cache: Arc<dyn StreakCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    async fn throttle(&self) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }
    }

    /// Reconcile one fund's full filing history
    ///
    /// Pairs are handled strictly oldest first. A failing pair is counted and
    /// the walk moves on; the next run picks it up again because nothing was
    /// stored for it. Only a failure to list the fund's filings fails the call.
    pub async fn reconcile_fund(&self, fund_id: &str) -> Result<ReconcileStats> {
        self.throttle().await;
        let mut filings = self.filings.list_parsed_filings(fund_id).await?;
        filings.sort_by(|a, b| {
            a.filing_date
                .cmp(&b.filing_date)
                .then_with(|| a.filing_id.cmp(&b.filing_id))
        });

        let mut stats = ReconcileStats::default();

        if filings.len() < 2 {
            tracing::debug!(
                "Fund {} has {} parsed filing(s), nothing to diff yet",
                fund_id,
                filings.len()
            );
            return Ok(stats);
        }

        // Holdings of filings[i-1] when the previous step already loaded them
        let mut previous: Option<HoldingsSnapshot> = None;

        for pair in filings.windows(2) {
            let (old_meta, new_meta) = (&pair[0], &pair[1]);

            match self.reconcile_pair(old_meta, new_meta, previous.take()).await {
                Ok(PairOutcome::Processed { new_snapshot }) => {
                    stats.processed += 1;
                    previous = Some(new_snapshot);
                }
                Ok(PairOutcome::AlreadyDiffed) => {
                    stats.skipped += 1;
                }
                Ok(PairOutcome::NothingToDiff { new_snapshot }) => {
                    stats.skipped += 1;
                    previous = new_snapshot;
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to diff {} -> {} for fund {}: {}",
                        old_meta.filing_id,
                        new_meta.filing_id,
                        fund_id,
                        e
                    );
                    stats.errors += 1;
                    stats.failed_filings.push(new_meta.filing_id.clone());
                }
            }
        }

        tracing::info!(
            "✓ Fund {}: {} processed, {} skipped, {} errors",
            fund_id,
            stats.processed,
            stats.skipped,
            stats.errors
        );

        Ok(stats)
    }

    async fn reconcile_pair(
        &self,
        old_meta: &FilingMeta,
        new_meta: &FilingMeta,
        cached_old: Option<HoldingsSnapshot>,
    ) -> Result<PairOutcome> {
        self.throttle().await;
        if self.diffs.has_diffs(&new_meta.filing_id).await? {
            tracing::debug!("Diffs for {} already stored, skipping", new_meta.filing_id);
            return Ok(PairOutcome::AlreadyDiffed);
        }

        self.throttle().await;
        let new_snapshot = match self.filings.get_holdings(&new_meta.filing_id).await? {
            Some(snapshot) => snapshot,
            None => {
                tracing::warn!("Filing {} has no holdings stored, skipping", new_meta.filing_id);
                return Ok(PairOutcome::NothingToDiff { new_snapshot: None });
            }
        };

        if new_snapshot.stock_count() == 0 {
            tracing::warn!(
                "Filing {} has zero stock holdings (upstream parse failure?), skipping",
                new_meta.filing_id
            );
            return Ok(PairOutcome::NothingToDiff {
                new_snapshot: Some(new_snapshot),
            });
        }

        let old_snapshot = match cached_old {
            Some(snapshot) if snapshot.filing_id == old_meta.filing_id => snapshot,
            _ => self.load_predecessor(old_meta, new_meta).await?,
        };

        if old_snapshot.stock_count() == 0 {
            return Err(DiffError::MissingPredecessor {
                filing_id: old_meta.filing_id.clone(),
                successor_id: new_meta.filing_id.clone(),
                transient: false,
                reason: "predecessor has no stock holdings".to_string(),
            });
        }

        let records = self.engine.compute(Some(&old_snapshot), &new_snapshot)?;

        self.throttle().await;
        self.diffs
            .upsert_diffs(&new_meta.fund_id, &new_meta.filing_id, &records)
            .await?;

        tracing::info!(
            "Stored diffs {} -> {} for fund {}: {} records",
            old_meta.filing_id,
            new_meta.filing_id,
            new_meta.fund_id,
            records.len()
        );

        if let Some(cache) = &self.cache {
            let tickers: Vec<String> = records
                .iter()
                .map(|r| r.ticker.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if let Err(e) = cache.invalidate(&new_meta.fund_id, &tickers).await {
                tracing::warn!(
                    "Failed to invalidate cached streaks for fund {}: {}",
                    new_meta.fund_id,
                    e
                );
            }
        }

        Ok(PairOutcome::Processed { new_snapshot })
    }

    async fn load_predecessor(
        &self,
        old_meta: &FilingMeta,
        new_meta: &FilingMeta,
    ) -> Result<HoldingsSnapshot> {
        self.throttle().await;
        match self.filings.get_holdings(&old_meta.filing_id).await {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => Err(DiffError::MissingPredecessor {
                filing_id: old_meta.filing_id.clone(),
                successor_id: new_meta.filing_id.clone(),
                transient: false,
                reason: "no holdings stored".to_string(),
            }),
            Err(e) => Err(DiffError::MissingPredecessor {
                filing_id: old_meta.filing_id.clone(),
                successor_id: new_meta.filing_id.clone(),
                transient: e.is_retryable(),
                reason: e.to_string(),
            }),
        }
    }

    /// `reconcile_fund` bounded by the per-fund deadline
    pub async fn reconcile_fund_with_deadline(&self, fund_id: &str) -> Result<ReconcileStats> {
        let after = self.options.fund_timeout;
        match tokio::time::timeout(after, self.reconcile_fund(fund_id)).await {
            Ok(result) => result,
            Err(_) => Err(DiffError::Timeout {
                fund_id: fund_id.to_string(),
                after,
            }),
        }
    }

    /// Reconcile many funds concurrently
    ///
    /// At most `max_concurrent_funds` run at once. Each fund gets its own
    /// deadline and its own outcome; one fund failing or timing out does not
    /// touch the others.
    pub async fn reconcile_funds(self: Arc<Self>, fund_ids: Vec<String>) -> BatchReport {
        let run_id = Uuid::new_v4();
        let workers = self.options.max_concurrent_funds.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));

        tracing::info!(
            "🔄 Reconcile run {} starting: {} funds, {} workers",
            run_id,
            fund_ids.len(),
            workers
        );

        let mut tasks = JoinSet::new();
        for fund_id in fund_ids {
            let this = self.clone();
            let semaphore = semaphore.clone();
            let span = tracing::info_span!("reconcile", %run_id, fund_id = %fund_id);

            tasks.spawn(
                async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => this.reconcile_fund_with_deadline(&fund_id).await,
                        Err(_) => Err(DiffError::StoreUnavailable(
                            "reconcile worker pool closed".to_string(),
                        )),
                    };
                    FundOutcome { fund_id, result }
                }
                .instrument(span),
            );
        }

        let mut funds = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Err(e) = &outcome.result {
                        tracing::error!("Fund {} failed: {}", outcome.fund_id, e);
                    }
                    funds.push(outcome);
                }
                Err(e) => tracing::error!("Reconcile task aborted: {}", e),
            }
        }
        funds.sort_by(|a, b| a.fund_id.cmp(&b.fund_id));

        let report = BatchReport { run_id, funds };
        let totals = report.totals();
        tracing::info!(
            "Reconcile run {} finished: {} processed, {} skipped, {} pair errors, {} funds failed",
            run_id,
            totals.processed,
            totals.skipped,
            totals.errors,
            report.failed_funds().len()
        );

        report
    }
}
