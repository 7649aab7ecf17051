use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use super::{DiffStore, FilingProvider};
use crate::error::{DiffError, Result};
use crate::models::{DiffRecord, FilingMeta, FilingStatus, HoldingsSnapshot};

type DiffKey = (String, String, String); // (fund_id, filing_id_new, instrument_key)

/// In-process filing and diff store
///
/// Backs the `simulate` command and the test suites. Counts writes and can be
/// told to fail specific holdings reads so that error paths can be exercised.
#[derive(Default)]
pub struct InMemoryStore {
    filings: RwLock<Vec<FilingMeta>>,
    holdings: RwLock<HashMap<String, HoldingsSnapshot>>,
    diffs: RwLock<BTreeMap<DiffKey, DiffRecord>>,
    diffed_filings: RwLock<HashSet<String>>,
    failing_holdings: RwLock<HashSet<String>>,
    holdings_reads: RwLock<Vec<String>>,
    upsert_calls: AtomicUsize,
    records_written: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a parsed filing together with its holdings
    pub fn add_snapshot(&self, snapshot: HoldingsSnapshot) {
        self.add_filing(
            FilingMeta {
                filing_id: snapshot.filing_id.clone(),
                fund_id: snapshot.fund_id.clone(),
                filing_date: snapshot.filing_date,
                status: FilingStatus::Parsed,
            },
            Some(snapshot),
        );
    }

    /// Register filing metadata, with or without holdings
    pub fn add_filing(&self, meta: FilingMeta, snapshot: Option<HoldingsSnapshot>) {
        if let Some(snapshot) = snapshot {
            write(&self.holdings).insert(meta.filing_id.clone(), snapshot);
        }
        write(&self.filings).push(meta);
    }

    /// Make `get_holdings` fail with `StoreUnavailable` for this filing
    pub fn fail_holdings_for(&self, filing_id: &str) {
        write(&self.failing_holdings).insert(filing_id.to_string());
    }

    pub fn clear_failures(&self) {
        write(&self.failing_holdings).clear();
    }

    pub fn fund_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = read(&self.filings)
            .iter()
            .map(|f| f.fund_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort();
        ids
    }

    /// Number of `upsert_diffs` calls, including ones that only marked a pair
    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn records_written(&self) -> usize {
        self.records_written.load(Ordering::SeqCst)
    }

    /// Filing ids passed to `get_holdings`, in call order
    pub fn holdings_reads(&self) -> Vec<String> {
        read(&self.holdings_reads).clone()
    }

    /// All stored diffs for one new-side filing, sorted by instrument key
    pub fn diffs_for_filing(&self, filing_id_new: &str) -> Vec<DiffRecord> {
        read(&self.diffs)
            .values()
            .filter(|d| d.filing_id_new == filing_id_new)
            .cloned()
            .collect()
    }

    pub fn diff_count(&self) -> usize {
        read(&self.diffs).len()
    }
}

#[async_trait]
impl FilingProvider for InMemoryStore {
    async fn list_parsed_filings(&self, fund_id: &str) -> Result<Vec<FilingMeta>> {
        let mut filings: Vec<FilingMeta> = read(&self.filings)
            .iter()
            .filter(|f| f.fund_id == fund_id && f.status == FilingStatus::Parsed)
            .cloned()
            .collect();
        filings.sort_by(|a, b| {
            a.filing_date
                .cmp(&b.filing_date)
                .then_with(|| a.filing_id.cmp(&b.filing_id))
        });
        Ok(filings)
    }

    async fn get_holdings(&self, filing_id: &str) -> Result<Option<HoldingsSnapshot>> {
        write(&self.holdings_reads).push(filing_id.to_string());

        if read(&self.failing_holdings).contains(filing_id) {
            return Err(DiffError::StoreUnavailable(format!(
                "injected failure reading holdings of {}",
                filing_id
            )));
        }

        Ok(read(&self.holdings).get(filing_id).cloned())
    }
}

#[async_trait]
impl DiffStore for InMemoryStore {
    async fn has_diffs(&self, filing_id_new: &str) -> Result<bool> {
        Ok(read(&self.diffed_filings).contains(filing_id_new))
    }

    async fn upsert_diffs(&self, fund_id: &str, filing_id_new: &str, diffs: &[DiffRecord]) -> Result<()> {
        if let Some(stray) = diffs
            .iter()
            .find(|d| d.fund_id != fund_id || d.filing_id_new != filing_id_new)
        {
            return Err(DiffError::InvalidRow(format!(
                "diff {}/{} does not belong to pair ending at {}/{}",
                stray.fund_id, stray.filing_id_new, fund_id, filing_id_new
            )));
        }

        let mut stored = write(&self.diffs);
        for diff in diffs {
            let key = (
                diff.fund_id.clone(),
                diff.filing_id_new.clone(),
                diff.instrument_key.clone(),
            );
            stored.insert(key, diff.clone());
        }
        write(&self.diffed_filings).insert(filing_id_new.to_string());

        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.records_written.fetch_add(diffs.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn list_diffs(&self, fund_id: &str, ticker: &str) -> Result<Vec<DiffRecord>> {
        let mut diffs: Vec<DiffRecord> = read(&self.diffs)
            .values()
            .filter(|d| d.fund_id == fund_id && d.ticker == ticker)
            .cloned()
            .collect();
        diffs.sort_by(|a, b| {
            b.filing_date
                .cmp(&a.filing_date)
                .then_with(|| b.filing_id_new.cmp(&a.filing_id_new))
        });
        Ok(diffs)
    }
}

// A poisoned lock only means another test thread panicked mid-write; the map
// itself is still usable.
fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiffAction, HoldingPosition, InstrumentType};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn diff(filing_id_new: &str, filing_date: NaiveDate, ticker: &str) -> DiffRecord {
        DiffRecord {
            fund_id: "FUND".to_string(),
            filing_id_old: None,
            filing_id_new: filing_id_new.to_string(),
            filing_date,
            instrument_key: ticker.to_string(),
            ticker: ticker.to_string(),
            cusip: None,
            instrument_type: InstrumentType::Stock,
            action: DiffAction::New,
            diff_shares: 10,
            diff_value: dec!(100),
            old_shares: 0,
            new_shares: 10,
        }
    }

    #[tokio::test]
    async fn test_parsed_filings_sorted_with_tiebreak() {
        let store = InMemoryStore::new();
        store.add_snapshot(HoldingsSnapshot::new("FUND", "B", date(2024, 5, 15)));
        store.add_snapshot(HoldingsSnapshot::new("FUND", "A", date(2024, 5, 15)));
        store.add_snapshot(HoldingsSnapshot::new("FUND", "Z", date(2024, 2, 14)));
        store.add_snapshot(HoldingsSnapshot::new("OTHER", "X", date(2024, 1, 1)));
        store.add_filing(
            FilingMeta {
                filing_id: "P".to_string(),
                fund_id: "FUND".to_string(),
                filing_date: date(2024, 8, 14),
                status: FilingStatus::Pending,
            },
            None,
        );

        let filings = store.list_parsed_filings("FUND").await.unwrap();
        let ids: Vec<&str> = filings.iter().map(|f| f.filing_id.as_str()).collect();
        assert_eq!(ids, vec!["Z", "A", "B"]);
    }

    #[tokio::test]
    async fn test_upsert_is_keyed() {
        let store = InMemoryStore::new();
        let first = diff("F2", date(2024, 5, 15), "AAPL");
        let mut replacement = first.clone();
        replacement.diff_value = dec!(250);

        store.upsert_diffs("FUND", "F2", &[first]).await.unwrap();
        store.upsert_diffs("FUND", "F2", &[replacement]).await.unwrap();

        assert_eq!(store.diff_count(), 1);
        assert_eq!(store.diffs_for_filing("F2")[0].diff_value, dec!(250));
        assert!(store.has_diffs("F2").await.unwrap());
        assert!(!store.has_diffs("F3").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_diffs_most_recent_first() {
        let store = InMemoryStore::new();
        for (filing_id, filing_date, tickers) in [
            ("F1", date(2023, 11, 14), vec!["AAPL"]),
            ("F3", date(2024, 5, 15), vec!["AAPL"]),
            ("F2", date(2024, 2, 14), vec!["AAPL", "MSFT"]),
        ] {
            let diffs: Vec<DiffRecord> = tickers.iter().map(|t| diff(filing_id, filing_date, t)).collect();
            store.upsert_diffs("FUND", filing_id, &diffs).await.unwrap();
        }

        let history = store.list_diffs("FUND", "AAPL").await.unwrap();
        let ids: Vec<&str> = history.iter().map(|d| d.filing_id_new.as_str()).collect();
        assert_eq!(ids, vec!["F3", "F2", "F1"]);
    }

    #[tokio::test]
    async fn test_empty_diff_still_marks_pair() {
        let store = InMemoryStore::new();

        store.upsert_diffs("FUND", "F2", &[]).await.unwrap();

        assert!(store.has_diffs("F2").await.unwrap());
        assert_eq!(store.diff_count(), 0);
        assert_eq!(store.upsert_calls(), 1);
    }

    #[tokio::test]
    async fn test_upsert_rejects_records_of_another_pair() {
        let store = InMemoryStore::new();

        let result = store
            .upsert_diffs("FUND", "F3", &[diff("F2", date(2024, 5, 15), "AAPL")])
            .await;

        assert!(matches!(result, Err(DiffError::InvalidRow(_))));
        assert!(!store.has_diffs("F3").await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_holdings_failure() {
        let store = InMemoryStore::new();
        store.add_snapshot(
            HoldingsSnapshot::new("FUND", "F1", date(2024, 2, 14))
                .with_position(HoldingPosition::new("AAPL", 1, dec!(150))),
        );
        store.fail_holdings_for("F1");

        assert!(matches!(
            store.get_holdings("F1").await,
            Err(DiffError::StoreUnavailable(_))
        ));

        store.clear_failures();
        assert!(store.get_holdings("F1").await.unwrap().is_some());
        assert_eq!(store.holdings_reads(), vec!["F1", "F1"]);
    }
}
