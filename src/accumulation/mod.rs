//! Accumulation / distribution streak detector
//!
//! Walks a fund's diff history for one ticker from the most recent filing
//! backwards and counts consecutive quarters moving in one direction:
//! - Accumulation: New/Increase with positive value delta
//! - Distribution: Decrease/Exit with negative value delta
//!
//! A move in the opposite direction ends the streak (Reversal), as does a hole
//! in the filing history wider than `max_gap_months` (GapTooLarge).
//!
//! Records are first netted per filing, so a ticker held under several CUSIPs
//! (share classes, or stock and options when included) counts once per quarter.
pub mod service;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::models::{AccumulationStreak, BrokenReason, DiffAction, DiffRecord, StreakDirection};

pub use service::StreakService;

const DAYS_PER_MONTH: f64 = 30.4375;

/// Net change of one ticker in one filing, summed over its instruments
#[derive(Debug, Clone)]
struct FilingMove {
    filing_id: String,
    filing_date: NaiveDate,
    action: DiffAction,
    diff_shares: i64,
    diff_value: Decimal,
    old_shares: i64,
    new_shares: i64,
}

impl FilingMove {
    fn from_record(diff: &DiffRecord) -> Self {
        Self {
            filing_id: diff.filing_id_new.clone(),
            filing_date: diff.filing_date,
            action: diff.action,
            diff_shares: diff.diff_shares,
            diff_value: diff.diff_value,
            old_shares: diff.old_shares,
            new_shares: diff.new_shares,
        }
    }

    fn absorb(&mut self, diff: &DiffRecord) {
        self.diff_shares += diff.diff_shares;
        self.diff_value += diff.diff_value;
        self.old_shares += diff.old_shares;
        self.new_shares += diff.new_shares;
        if diff.action != self.action {
            self.action = self.net_action();
        }
    }

    /// Action of a filing whose instruments moved in different ways
    fn net_action(&self) -> DiffAction {
        if self.old_shares == 0 && self.new_shares > 0 {
            DiffAction::New
        } else if self.new_shares == 0 && self.old_shares > 0 {
            DiffAction::Exit
        } else if self.diff_shares > 0 {
            DiffAction::Increase
        } else if self.diff_shares < 0 {
            DiffAction::Decrease
        } else {
            DiffAction::Unchanged
        }
    }
}

/// What one filing's move does to a streak walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Extend,
    Reverse,
    Neutral,
}

#[derive(Debug, Clone)]
pub struct StreakDetector {
    /// Quarterly filings land ~3 months apart; 5 tolerates one late filing
    pub max_gap_months: f64,
    /// Option lines are diffed but left out of streaks unless enabled
    pub include_options: bool,
}

impl Default for StreakDetector {
    fn default() -> Self {
        Self {
            max_gap_months: 5.0,
            include_options: false,
        }
    }
}

impl StreakDetector {
    pub fn new(max_gap_months: f64, include_options: bool) -> Self {
        Self {
            max_gap_months,
            include_options,
        }
    }

    /// Classify the most recent run in `diffs`
    ///
    /// `diffs` must be one fund and one ticker, sorted most recent first (the
    /// order `DiffStore::list_diffs` returns). Never fails: an empty or
    /// all-neutral history yields a zero-length streak.
    pub fn detect(&self, diffs: &[DiffRecord], direction: StreakDirection) -> AccumulationStreak {
        let mut streak = AccumulationStreak::empty(direction);
        let mut last_date: Option<NaiveDate> = None;

        for filing in self.per_filing(diffs) {
            if let Some(last) = last_date {
                if months_between(last, filing.filing_date) > self.max_gap_months {
                    streak.broken_reason = BrokenReason::GapTooLarge;
                    break;
                }
            }

            match step(&filing, direction) {
                Step::Extend => {
                    streak.streak_length += 1;
                    streak.total_shares += filing.diff_shares.abs();
                    streak.total_value += filing.diff_value.abs();
                    if streak.latest_filing_date.is_none() {
                        streak.latest_filing_date = Some(filing.filing_date);
                    }
                    streak.earliest_filing_date = Some(filing.filing_date);
                }
                Step::Reverse => {
                    streak.broken_reason = BrokenReason::Reversal;
                    break;
                }
                Step::Neutral => {}
            }

            last_date = Some(filing.filing_date);
        }

        // A break can only fire after at least one filing was consumed, so any
        // counted quarter means the run reaches the latest considered filing.
        streak.is_active = streak.streak_length > 0;

        tracing::trace!(
            "{} streak: length={} broken={:?}",
            direction.as_str(),
            streak.streak_length,
            streak.broken_reason
        );

        streak
    }

    /// Net the considered records per filing, keeping the input order of filings
    fn per_filing(&self, diffs: &[DiffRecord]) -> Vec<FilingMove> {
        let mut moves: Vec<FilingMove> = Vec::new();

        for diff in diffs {
            if diff.instrument_type.is_option() && !self.include_options {
                continue;
            }
            match moves.iter_mut().find(|m| m.filing_id == diff.filing_id_new) {
                Some(existing) => existing.absorb(diff),
                None => moves.push(FilingMove::from_record(diff)),
            }
        }

        moves
    }
}

/// Accumulation streak with default thresholds
pub fn detect_streak(diffs: &[DiffRecord]) -> AccumulationStreak {
    StreakDetector::default().detect(diffs, StreakDirection::Accumulation)
}

/// Single predicate shared by both directions; distribution is the mirror image
fn step(filing: &FilingMove, direction: StreakDirection) -> Step {
    let (growing, value_sign) = match direction {
        StreakDirection::Accumulation => (true, Decimal::ONE),
        StreakDirection::Distribution => (false, Decimal::NEGATIVE_ONE),
    };
    let signed_value = filing.diff_value * value_sign;

    let (with_trend, opens_or_closes) = match filing.action {
        DiffAction::New => (growing, true),
        DiffAction::Increase => (growing, false),
        DiffAction::Decrease => (!growing, false),
        DiffAction::Exit => (!growing, true),
        DiffAction::Unchanged => return Step::Neutral,
    };

    if with_trend {
        if signed_value > Decimal::ZERO {
            Step::Extend
        } else {
            Step::Neutral
        }
    } else if opens_or_closes || signed_value < Decimal::ZERO {
        // Opening/closing against the trend always reverses; partial moves
        // only when the value moved against it too
        Step::Reverse
    } else {
        Step::Neutral
    }
}

fn months_between(a: NaiveDate, b: NaiveDate) -> f64 {
    (a - b).num_days().abs() as f64 / DAYS_PER_MONTH
}
