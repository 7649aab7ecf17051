//! Narrow interfaces to the externally owned filing and diff stores.
//!
//! Business logic only sees these traits. Adapters (`memory`, `db::postgres`)
//! parse their rows into the strict data model at this boundary.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{DiffRecord, FilingMeta, HoldingsSnapshot};

pub use memory::InMemoryStore;

/// Source of parsed 13F filings and their holdings
#[async_trait]
pub trait FilingProvider: Send + Sync {
    /// Filings with holdings available, oldest first
    async fn list_parsed_filings(&self, fund_id: &str) -> Result<Vec<FilingMeta>>;

    /// Holdings of one filing, or None if the filing has no holdings stored
    async fn get_holdings(&self, filing_id: &str) -> Result<Option<HoldingsSnapshot>>;
}

/// Persistent store of computed diff records
#[async_trait]
pub trait DiffStore: Send + Sync {
    /// Whether the pair ending at this filing has been diffed, even if the
    /// diff produced no records
    async fn has_diffs(&self, filing_id_new: &str) -> Result<bool>;

    /// Store the diff of the pair ending at `filing_id_new` and mark the pair done
    ///
    /// Records are insert-or-replace keyed by (fund_id, filing_id_new,
    /// instrument_key). The marker and the records are written together. An
    /// empty `diffs` still marks the pair.
    async fn upsert_diffs(&self, fund_id: &str, filing_id_new: &str, diffs: &[DiffRecord]) -> Result<()>;

    /// Diff history of one fund and ticker, most recent filing first
    async fn list_diffs(&self, fund_id: &str, ticker: &str) -> Result<Vec<DiffRecord>>;
}
