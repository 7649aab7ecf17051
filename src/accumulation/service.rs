use std::sync::Arc;

use super::StreakDetector;
use crate::error::Result;
use crate::models::{normalize_ticker, AccumulationStreak, DiffRecord, StreakDirection};
use crate::persistence::StreakCache;
use crate::store::DiffStore;

/// Reads diff history from the diff store and runs the detector on it
///
/// The cache is optional and never authoritative: a cache failure is logged and
/// the streak is recomputed from the store.
pub struct StreakService {
    diffs: Arc<dyn DiffStore>,
    cache: Option<Arc<dyn StreakCache>>,
    detector: StreakDetector,
}

impl StreakService {
    pub fn new(diffs: Arc<dyn DiffStore>, detector: StreakDetector) -> Self {
        Self {
            diffs,
            cache: None,
            detector,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn StreakCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub async fn streak_for(
        &self,
        fund_id: &str,
        ticker: &str,
        direction: StreakDirection,
    ) -> Result<AccumulationStreak> {
        let ticker = normalize_ticker(ticker);

        if let Some(cache) = &self.cache {
            match cache.get(fund_id, &ticker, direction).await {
                Ok(Some(streak)) => return Ok(streak),
                Ok(None) => {}
                Err(e) => tracing::warn!("Streak cache read failed for {}/{}: {}", fund_id, ticker, e),
            }
        }

        let history = self.diffs.list_diffs(fund_id, &ticker).await?;
        let streak = self.detector.detect(&history, direction);

        tracing::debug!(
            "{} {} streak for {}/{}: {} quarters over {} diffs",
            if streak.is_active { "active" } else { "inactive" },
            direction.as_str(),
            fund_id,
            ticker,
            streak.streak_length,
            history.len()
        );

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(fund_id, &ticker, &streak).await {
                tracing::warn!("Streak cache write failed for {}/{}: {}", fund_id, ticker, e);
            } else {
                self.drop_if_stale(cache.as_ref(), fund_id, &ticker, &history).await;
            }
        }

        Ok(streak)
    }

    /// Remove the entry just written if the history moved while it was computed
    ///
    /// The reconciler invalidates only after its upsert commits. An upsert that
    /// lands after this re-read is therefore followed by its own invalidation,
    /// and one that landed before it shows up here.
    async fn drop_if_stale(
        &self,
        cache: &dyn StreakCache,
        fund_id: &str,
        ticker: &str,
        history: &[DiffRecord],
    ) {
        let unchanged = match self.diffs.list_diffs(fund_id, ticker).await {
            Ok(current) => current.as_slice() == history,
            Err(e) => {
                tracing::warn!("Failed to re-read diffs for {}/{}: {}", fund_id, ticker, e);
                false
            }
        };
        if unchanged {
            return;
        }

        tracing::debug!("Diff history for {}/{} changed during lookup, dropping cached streak", fund_id, ticker);
        if let Err(e) = cache.invalidate(fund_id, &[ticker.to_string()]).await {
            tracing::warn!("Failed to drop stale streak for {}/{}: {}", fund_id, ticker, e);
        }
    }
}
