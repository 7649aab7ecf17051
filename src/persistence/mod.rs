use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::time::{timeout, Duration};

use crate::error::{DiffError, Result};
use crate::models::{AccumulationStreak, StreakDirection};

const DIRECTIONS: [StreakDirection; 2] = [StreakDirection::Accumulation, StreakDirection::Distribution];

/// Cache of computed streaks per (fund, ticker, direction)
///
/// Entries are only valid until the next diff for that fund+ticker lands, so
/// writers must call `invalidate` after every upsert.
#[async_trait]
pub trait StreakCache: Send + Sync {
    async fn get(
        &self,
        fund_id: &str,
        ticker: &str,
        direction: StreakDirection,
    ) -> Result<Option<AccumulationStreak>>;

    async fn put(&self, fund_id: &str, ticker: &str, streak: &AccumulationStreak) -> Result<()>;

    /// Drop both directions for every ticker; returns number of entries removed
    async fn invalidate(&self, fund_id: &str, tickers: &[String]) -> Result<usize>;
}

fn cache_key(fund_id: &str, ticker: &str, direction: StreakDirection) -> String {
    format!("streak:{}:{}:{}", fund_id, ticker, direction.as_str())
}

/// Redis-backed streak cache
///
/// Values are JSON with a TTL so a missed invalidation heals itself.
pub struct RedisStreakCache {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl RedisStreakCache {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `ttl_secs` - Lifetime of a cached streak
    pub async fn new(redis_url: &str, ttl_secs: u64) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| DiffError::Cache("Redis connection timeout after 5 seconds".into()))??;

        tracing::info!("Connected to Redis streak cache at {}", redis_url);

        Ok(Self { conn, ttl_secs })
    }
}

#[async_trait]
impl StreakCache for RedisStreakCache {
    async fn get(
        &self,
        fund_id: &str,
        ticker: &str,
        direction: StreakDirection,
    ) -> Result<Option<AccumulationStreak>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(cache_key(fund_id, ticker, direction)).await?;

        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, fund_id: &str, ticker: &str, streak: &AccumulationStreak) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = cache_key(fund_id, ticker, streak.direction);
        let value = serde_json::to_string(streak)?;

        let _: () = redis::cmd("SET")
            .arg(&key)
            .arg(value)
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut conn)
            .await?;

        tracing::debug!("Cached {}", key);
        Ok(())
    }

    async fn invalidate(&self, fund_id: &str, tickers: &[String]) -> Result<usize> {
        if tickers.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = tickers
            .iter()
            .flat_map(|ticker| DIRECTIONS.iter().map(move |d| cache_key(fund_id, ticker, *d)))
            .collect();

        let mut conn = self.conn.clone();
        let removed: usize = conn.del(keys).await?;

        if removed > 0 {
            tracing::debug!("Invalidated {} cached streaks for fund {}", removed, fund_id);
        }

        Ok(removed)
    }
}

/// Process-local streak cache
#[derive(Default)]
pub struct MemoryStreakCache {
    entries: Mutex<HashMap<String, AccumulationStreak>>,
}

impl MemoryStreakCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, AccumulationStreak>>> {
        self.entries
            .lock()
            .map_err(|_| DiffError::Cache("streak cache lock poisoned".into()))
    }
}

#[async_trait]
impl StreakCache for MemoryStreakCache {
    async fn get(
        &self,
        fund_id: &str,
        ticker: &str,
        direction: StreakDirection,
    ) -> Result<Option<AccumulationStreak>> {
        Ok(self.lock()?.get(&cache_key(fund_id, ticker, direction)).cloned())
    }

    async fn put(&self, fund_id: &str, ticker: &str, streak: &AccumulationStreak) -> Result<()> {
        self.lock()?
            .insert(cache_key(fund_id, ticker, streak.direction), streak.clone());
        Ok(())
    }

    async fn invalidate(&self, fund_id: &str, tickers: &[String]) -> Result<usize> {
        let mut entries = self.lock()?;
        let mut removed = 0;
        for ticker in tickers {
            for direction in DIRECTIONS {
                if entries.remove(&cache_key(fund_id, ticker, direction)).is_some() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streak(direction: StreakDirection, length: usize) -> AccumulationStreak {
        let mut streak = AccumulationStreak::empty(direction);
        streak.streak_length = length;
        streak.is_active = length > 0;
        streak
    }

    #[tokio::test]
    async fn test_memory_cache_put_get_invalidate() {
        let cache = MemoryStreakCache::new();
        cache
            .put("FUND", "AAPL", &streak(StreakDirection::Accumulation, 3))
            .await
            .unwrap();
        cache
            .put("FUND", "AAPL", &streak(StreakDirection::Distribution, 0))
            .await
            .unwrap();
        cache
            .put("FUND", "MSFT", &streak(StreakDirection::Accumulation, 1))
            .await
            .unwrap();

        let hit = cache
            .get("FUND", "AAPL", StreakDirection::Accumulation)
            .await
            .unwrap();
        assert_eq!(hit.map(|s| s.streak_length), Some(3));

        let removed = cache.invalidate("FUND", &["AAPL".to_string()]).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
        assert!(cache
            .get("FUND", "AAPL", StreakDirection::Accumulation)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_connection_timeout() {
        // Try to connect to non-existent Redis
        let result = RedisStreakCache::new("redis://192.0.2.1:6379", 60).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_redis_cache_round_trip() {
        let cache = RedisStreakCache::new("redis://127.0.0.1:6379", 60)
            .await
            .expect("Failed to connect to Redis");

        // Clean up first
        let tickers = vec!["TEST_STREAK".to_string()];
        let _ = cache.invalidate("TEST_FUND", &tickers).await;

        cache
            .put("TEST_FUND", "TEST_STREAK", &streak(StreakDirection::Accumulation, 4))
            .await
            .unwrap();

        let loaded = cache
            .get("TEST_FUND", "TEST_STREAK", StreakDirection::Accumulation)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.streak_length, 4);

        let removed = cache.invalidate("TEST_FUND", &tickers).await.unwrap();
        assert_eq!(removed, 1);
    }
}
