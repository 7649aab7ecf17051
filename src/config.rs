use config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::time::Duration;

use crate::accumulation::StreakDetector;
use crate::diff::DiffEngine;
use crate::reconcile::ReconcileOptions;

/// Runtime settings
///
/// Layered lowest to highest: built-in defaults, `fundwatch.toml` (optional),
/// then `FUNDWATCH_*` environment variables. Nested keys use `__`, e.g.
/// `FUNDWATCH_DETECTOR__MAX_GAP_MONTHS=6`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Postgres URL; without it only `simulate` can run
    pub database_url: Option<String>,
    /// Redis URL for the streak cache; caching is off when unset
    pub redis_url: Option<String>,
    /// Upper bound on how long a cached streak can outlive a missed invalidation
    pub cache_ttl_secs: u64,
    pub max_concurrent_funds: usize,
    pub fund_timeout_secs: u64,
    pub store_requests_per_second: Option<u32>,
    /// Also store rows for positions that did not move
    pub emit_unchanged: bool,
    pub min_streak_length: usize,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorSettings {
    pub max_gap_months: f64,
    pub include_options: bool,
}

impl Settings {
    /// Load settings from `path` (or `fundwatch.toml` if present) and the environment
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let cfg = Self::defaults()?
            .add_source(File::with_name(path.unwrap_or("fundwatch")).required(path.is_some()))
            .add_source(
                Environment::with_prefix("FUNDWATCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Self::finish(cfg)
    }

    /// Defaults overlaid with an inline TOML document
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let cfg = Self::defaults()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;

        Self::finish(cfg)
    }

    fn defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("cache_ttl_secs", 3600)?
            .set_default("max_concurrent_funds", 4)?
            .set_default("fund_timeout_secs", 300)?
            .set_default("emit_unchanged", false)?
            .set_default("min_streak_length", 2)?
            .set_default("detector.max_gap_months", 5.0)?
            .set_default("detector.include_options", false)
    }

    fn finish(cfg: Config) -> Result<Self, ConfigError> {
        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_funds == 0 {
            return Err(ConfigError::Message(
                "max_concurrent_funds must be at least 1".to_string(),
            ));
        }
        if self.fund_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "fund_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.detector.max_gap_months.is_nan() || self.detector.max_gap_months <= 0.0 {
            return Err(ConfigError::Message(
                "detector.max_gap_months must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            max_concurrent_funds: self.max_concurrent_funds,
            fund_timeout: Duration::from_secs(self.fund_timeout_secs),
            store_requests_per_second: self.store_requests_per_second,
        }
    }

    pub fn diff_engine(&self) -> DiffEngine {
        DiffEngine::new(self.emit_unchanged)
    }

    pub fn streak_detector(&self) -> StreakDetector {
        StreakDetector::new(self.detector.max_gap_months, self.detector.include_options)
    }
}
