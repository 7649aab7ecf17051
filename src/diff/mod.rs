//! Holdings diff engine
//!
//! Compares a fund's previous 13F snapshot with the next one and classifies
//! every instrument that appears in either:
//! - New: no predecessor position
//! - Increase / Decrease: share count moved, still held
//! - Exit: share count went to zero, or the instrument disappeared
//! - Unchanged: same share count (skipped unless `emit_unchanged`)
//!
//! The engine is pure: no store access, no retries.
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};

use crate::error::{DiffError, Result};
use crate::models::{DiffAction, DiffRecord, HoldingPosition, HoldingsSnapshot};

#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    /// Persisting unchanged positions grows storage every quarter for no signal,
    /// so they are skipped unless asked for.
    pub emit_unchanged: bool,
}

impl DiffEngine {
    pub fn new(emit_unchanged: bool) -> Self {
        Self { emit_unchanged }
    }

    /// Diff `old` (None for a fund's first filing) against `new`
    ///
    /// Output holds at most one record per identity key, sorted by key, so the
    /// same inputs always produce the same records.
    pub fn compute(
        &self,
        old: Option<&HoldingsSnapshot>,
        new: &HoldingsSnapshot,
    ) -> Result<Vec<DiffRecord>> {
        new.validate()?;
        if let Some(old) = old {
            old.validate()?;
            check_pair(old, new)?;
        }

        let old_by_key: BTreeMap<&str, &HoldingPosition> = old
            .map(|s| s.positions.iter().map(|p| (p.identity_key(), p)).collect())
            .unwrap_or_default();
        let old_filing_id = old.map(|s| s.filing_id.as_str());

        let mut diffs: BTreeMap<String, DiffRecord> = BTreeMap::new();

        for position in &new.positions {
            let key = position.identity_key();

            let record = match old_by_key.get(key) {
                None if position.shares == 0 => {
                    // Bookkeeping row for something never held: 0 -> 0
                    if !self.emit_unchanged {
                        continue;
                    }
                    build_record(new, None, key, position, 0, Decimal::ZERO, DiffAction::Unchanged)
                }
                None => build_record(new, None, key, position, 0, Decimal::ZERO, DiffAction::New),
                Some(prev) => {
                    let action = DiffAction::classify(prev.shares, position.shares);
                    if action == DiffAction::Unchanged && !self.emit_unchanged {
                        continue;
                    }
                    build_record(
                        new,
                        old_filing_id,
                        key,
                        position,
                        prev.shares,
                        prev.market_value,
                        action,
                    )
                }
            };

            diffs.insert(key.to_string(), record);
        }

        let new_keys: HashSet<&str> = new.positions.iter().map(|p| p.identity_key()).collect();

        for (key, prev) in &old_by_key {
            if new_keys.contains(key) {
                continue;
            }
            // A zero-share bookkeeping row that vanished never held anything
            if prev.shares == 0 && !self.emit_unchanged {
                continue;
            }
            diffs.insert(key.to_string(), dropped_record(new, old_filing_id, key, prev));
        }

        tracing::debug!(
            "Diffed {} -> {} for fund {}: {} records",
            old_filing_id.unwrap_or("<none>"),
            new.filing_id,
            new.fund_id,
            diffs.len()
        );

        Ok(diffs.into_values().collect())
    }
}

/// Diff with the default policy (unchanged positions skipped)
pub fn compute_diff(
    old: Option<&HoldingsSnapshot>,
    new: &HoldingsSnapshot,
) -> Result<Vec<DiffRecord>> {
    DiffEngine::default().compute(old, new)
}

fn check_pair(old: &HoldingsSnapshot, new: &HoldingsSnapshot) -> Result<()> {
    if old.fund_id != new.fund_id {
        return Err(DiffError::malformed(
            &old.filing_id,
            format!(
                "belongs to fund {} but successor {} belongs to fund {}",
                old.fund_id, new.filing_id, new.fund_id
            ),
        ));
    }
    if old.filing_date > new.filing_date {
        return Err(DiffError::malformed(
            &old.filing_id,
            format!(
                "dated {} which is after successor {} ({})",
                old.filing_date, new.filing_id, new.filing_date
            ),
        ));
    }
    Ok(())
}

fn build_record(
    new: &HoldingsSnapshot,
    old_filing_id: Option<&str>,
    key: &str,
    position: &HoldingPosition,
    old_shares: i64,
    old_value: Decimal,
    action: DiffAction,
) -> DiffRecord {
    DiffRecord {
        fund_id: new.fund_id.clone(),
        filing_id_old: old_filing_id.map(str::to_string),
        filing_id_new: new.filing_id.clone(),
        filing_date: new.filing_date,
        instrument_key: key.to_string(),
        ticker: position.ticker.clone(),
        cusip: position.cusip.clone(),
        instrument_type: position.instrument_type,
        action,
        diff_shares: position.shares - old_shares,
        diff_value: value_change(old_shares, old_value, position.shares, position.market_value),
        old_shares,
        new_shares: position.shares,
    }
}

/// Instrument present in the old filing and missing from the new one
fn dropped_record(
    new: &HoldingsSnapshot,
    old_filing_id: Option<&str>,
    key: &str,
    prev: &HoldingPosition,
) -> DiffRecord {
    DiffRecord {
        fund_id: new.fund_id.clone(),
        filing_id_old: old_filing_id.map(str::to_string),
        filing_id_new: new.filing_id.clone(),
        filing_date: new.filing_date,
        instrument_key: key.to_string(),
        ticker: prev.ticker.clone(),
        cusip: prev.cusip.clone(),
        instrument_type: prev.instrument_type,
        action: if prev.shares > 0 {
            DiffAction::Exit
        } else {
            DiffAction::Unchanged
        },
        diff_shares: -prev.shares,
        diff_value: value_change(prev.shares, prev.market_value, 0, Decimal::ZERO),
        old_shares: prev.shares,
        new_shares: 0,
    }
}

/// Value delta of a record; rows with no shares on either side carry none
fn value_change(old_shares: i64, old_value: Decimal, new_shares: i64, new_value: Decimal) -> Decimal {
    if old_shares == 0 && new_shares == 0 {
        Decimal::ZERO
    } else {
        new_value - old_value
    }
}
