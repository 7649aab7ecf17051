use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{DiffError, Result};

/// Kind of instrument reported on a 13F line
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentType {
    Stock,
    OptionCall,
    OptionPut,
    Other,
}

impl InstrumentType {
    pub fn is_option(&self) -> bool {
        matches!(self, InstrumentType::OptionCall | InstrumentType::OptionPut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstrumentType::Stock => "stock",
            InstrumentType::OptionCall => "option_call",
            InstrumentType::OptionPut => "option_put",
            InstrumentType::Other => "other",
        }
    }
}

impl FromStr for InstrumentType {
    type Err = DiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stock" => Ok(InstrumentType::Stock),
            "option_call" => Ok(InstrumentType::OptionCall),
            "option_put" => Ok(InstrumentType::OptionPut),
            "other" => Ok(InstrumentType::Other),
            _ => Err(DiffError::InvalidRow(format!("unknown instrument type '{}'", s))),
        }
    }
}

/// One instrument held by a fund as of one filing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HoldingPosition {
    pub ticker: String,
    pub cusip: Option<String>,
    pub shares: i64,
    pub market_value: Decimal,
    pub instrument_type: InstrumentType,
}

impl HoldingPosition {
    pub fn new(ticker: &str, shares: i64, market_value: Decimal) -> Self {
        Self {
            ticker: normalize_ticker(ticker),
            cusip: None,
            shares,
            market_value,
            instrument_type: InstrumentType::Stock,
        }
    }

    pub fn with_cusip(mut self, cusip: &str) -> Self {
        let cusip = cusip.trim();
        self.cusip = if cusip.is_empty() {
            None
        } else {
            Some(cusip.to_uppercase())
        };
        self
    }

    pub fn with_type(mut self, instrument_type: InstrumentType) -> Self {
        self.instrument_type = instrument_type;
        self
    }

    /// Key used to match the same instrument across filings: CUSIP, else ticker
    pub fn identity_key(&self) -> &str {
        match self.cusip.as_deref() {
            Some(cusip) if !cusip.is_empty() => cusip,
            _ => &self.ticker,
        }
    }
}

/// Tickers are compared trimmed and upper-cased
pub fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}

/// Full set of positions for one fund at one filing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HoldingsSnapshot {
    pub fund_id: String,
    pub filing_id: String,
    pub filing_date: NaiveDate,
    pub positions: Vec<HoldingPosition>,
}

impl HoldingsSnapshot {
    pub fn new(fund_id: &str, filing_id: &str, filing_date: NaiveDate) -> Self {
        Self {
            fund_id: fund_id.to_string(),
            filing_id: filing_id.to_string(),
            filing_date,
            positions: Vec::new(),
        }
    }

    pub fn with_position(mut self, position: HoldingPosition) -> Self {
        self.positions.push(position);
        self
    }

    /// Check per-snapshot invariants: unique identity keys, non-negative quantities
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.positions.len());

        for position in &self.positions {
            let key = position.identity_key();
            if !seen.insert(key) {
                return Err(DiffError::malformed(
                    &self.filing_id,
                    format!("duplicate identity key {}", key),
                ));
            }
            if position.shares < 0 {
                return Err(DiffError::malformed(
                    &self.filing_id,
                    format!("negative share count {} for {}", position.shares, key),
                ));
            }
            if position.market_value < Decimal::ZERO {
                return Err(DiffError::malformed(
                    &self.filing_id,
                    format!("negative market value {} for {}", position.market_value, key),
                ));
            }
        }

        Ok(())
    }

    /// Number of stock positions (options and other instruments excluded)
    pub fn stock_count(&self) -> usize {
        self.positions
            .iter()
            .filter(|p| p.instrument_type == InstrumentType::Stock)
            .count()
    }
}

/// Processing status of a filing in the filing store
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilingStatus {
    Pending,
    Parsed,
    Failed,
}

/// Filing metadata as listed by the filing provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilingMeta {
    pub filing_id: String,
    pub fund_id: String,
    pub filing_date: NaiveDate,
    pub status: FilingStatus,
}

/// Classification of one instrument's change between two filings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DiffAction {
    New,
    Increase,
    Decrease,
    Exit,
    Unchanged,
}

impl DiffAction {
    /// Action for an instrument present in both filings. Instruments without a
    /// predecessor position are always `New` and never reach this.
    pub fn classify(old_shares: i64, new_shares: i64) -> Self {
        if new_shares == 0 && old_shares > 0 {
            DiffAction::Exit
        } else if new_shares > old_shares {
            DiffAction::Increase
        } else if new_shares < old_shares {
            DiffAction::Decrease
        } else {
            DiffAction::Unchanged
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiffAction::New => "new",
            DiffAction::Increase => "increase",
            DiffAction::Decrease => "decrease",
            DiffAction::Exit => "exit",
            DiffAction::Unchanged => "unchanged",
        }
    }
}

impl fmt::Display for DiffAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiffAction {
    type Err = DiffError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(DiffAction::New),
            "increase" => Ok(DiffAction::Increase),
            "decrease" => Ok(DiffAction::Decrease),
            "exit" => Ok(DiffAction::Exit),
            "unchanged" => Ok(DiffAction::Unchanged),
            _ => Err(DiffError::InvalidRow(format!("unknown diff action '{}'", s))),
        }
    }
}

/// Change of one instrument between an old and a new filing of the same fund
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffRecord {
    pub fund_id: String,
    pub filing_id_old: Option<String>, // None: no predecessor position
    pub filing_id_new: String,
    pub filing_date: NaiveDate, // date of the new filing
    pub instrument_key: String,
    pub ticker: String,
    pub cusip: Option<String>,
    pub instrument_type: InstrumentType,
    pub action: DiffAction,
    pub diff_shares: i64,
    pub diff_value: Decimal,
    pub old_shares: i64,
    pub new_shares: i64,
}

/// Direction a streak is measured in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreakDirection {
    Accumulation,
    Distribution,
}

impl StreakDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreakDirection::Accumulation => "accumulation",
            StreakDirection::Distribution => "distribution",
        }
    }
}

/// Why a streak walk stopped before the history was exhausted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BrokenReason {
    None,
    Reversal,
    GapTooLarge,
}

/// Run of consecutive qualifying filings for one fund and ticker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccumulationStreak {
    pub direction: StreakDirection,
    pub streak_length: usize,
    /// Absolute shares added (accumulation) or removed (distribution)
    pub total_shares: i64,
    /// Absolute value added (accumulation) or removed (distribution)
    pub total_value: Decimal,
    pub is_active: bool,
    pub broken_reason: BrokenReason,
    pub latest_filing_date: Option<NaiveDate>,
    pub earliest_filing_date: Option<NaiveDate>,
}

impl AccumulationStreak {
    pub fn empty(direction: StreakDirection) -> Self {
        Self {
            direction,
            streak_length: 0,
            total_shares: 0,
            total_value: Decimal::ZERO,
            is_active: false,
            broken_reason: BrokenReason::None,
            latest_filing_date: None,
            earliest_filing_date: None,
        }
    }

    /// Caller-side threshold, e.g. `>= 2` consecutive quarters for alerting
    pub fn meets_threshold(&self, min_streak: usize) -> bool {
        self.is_active && self.streak_length >= min_streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_identity_key_prefers_cusip() {
        let by_ticker = HoldingPosition::new("aapl ", 100, dec!(15000));
        assert_eq!(by_ticker.ticker, "AAPL");
        assert_eq!(by_ticker.identity_key(), "AAPL");

        let by_cusip = by_ticker.clone().with_cusip("037833100");
        assert_eq!(by_cusip.identity_key(), "037833100");

        let blank_cusip = by_ticker.with_cusip("  ");
        assert_eq!(blank_cusip.cusip, None);
        assert_eq!(blank_cusip.identity_key(), "AAPL");
    }

    #[test]
    fn test_snapshot_rejects_duplicate_keys() {
        let snapshot = HoldingsSnapshot::new("FUND", "F1", date(2024, 2, 14))
            .with_position(HoldingPosition::new("AAPL", 100, dec!(15000)))
            .with_position(HoldingPosition::new("aapl", 50, dec!(7500)));

        let err = snapshot.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate identity key AAPL"));
    }

    #[test]
    fn test_snapshot_same_ticker_different_cusip_is_valid() {
        let snapshot = HoldingsSnapshot::new("FUND", "F1", date(2024, 2, 14))
            .with_position(HoldingPosition::new("GOOG", 10, dec!(1400)).with_cusip("02079K107"))
            .with_position(HoldingPosition::new("GOOG", 20, dec!(2800)).with_cusip("02079K305"));

        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn test_snapshot_rejects_negative_shares() {
        let snapshot = HoldingsSnapshot::new("FUND", "F1", date(2024, 2, 14))
            .with_position(HoldingPosition::new("MSFT", -5, dec!(0)));

        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_stock_count_ignores_options() {
        let snapshot = HoldingsSnapshot::new("FUND", "F1", date(2024, 2, 14))
            .with_position(HoldingPosition::new("AAPL", 100, dec!(15000)))
            .with_position(
                HoldingPosition::new("AAPL", 10, dec!(900))
                    .with_cusip("AAPL-CALL")
                    .with_type(InstrumentType::OptionCall),
            );

        assert_eq!(snapshot.stock_count(), 1);
    }

    #[test]
    fn test_classify_transitions() {
        assert_eq!(DiffAction::classify(0, 100), DiffAction::Increase);
        assert_eq!(DiffAction::classify(100, 150), DiffAction::Increase);
        assert_eq!(DiffAction::classify(100, 40), DiffAction::Decrease);
        assert_eq!(DiffAction::classify(100, 0), DiffAction::Exit);
        assert_eq!(DiffAction::classify(100, 100), DiffAction::Unchanged);
        assert_eq!(DiffAction::classify(0, 0), DiffAction::Unchanged);
    }

    #[test]
    fn test_action_string_round_trip() {
        for action in [
            DiffAction::New,
            DiffAction::Increase,
            DiffAction::Decrease,
            DiffAction::Exit,
            DiffAction::Unchanged,
        ] {
            assert_eq!(action.as_str().parse::<DiffAction>().unwrap(), action);
        }
        assert!("hold".parse::<DiffAction>().is_err());
    }

    #[test]
    fn test_streak_threshold() {
        let mut streak = AccumulationStreak::empty(StreakDirection::Accumulation);
        assert!(!streak.meets_threshold(1));

        streak.streak_length = 2;
        streak.is_active = true;
        assert!(streak.meets_threshold(2));
        assert!(!streak.meets_threshold(3));
    }
}
