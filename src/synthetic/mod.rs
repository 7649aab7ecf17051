use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;

use crate::models::{HoldingPosition, HoldingsSnapshot, InstrumentType};

/// Fund behaviour types for synthetic filing histories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundScenario {
    /// Buys more of its core names every quarter
    Accumulator,
    /// Sells its core names down every quarter, then exits
    Distributor,
    /// Random adds and trims, names rotating in and out
    Churner,
    /// Accumulator that skips one quarterly filing midway
    LateFiler,
}

impl FundScenario {
    pub fn all() -> [FundScenario; 4] {
        [
            FundScenario::Accumulator,
            FundScenario::Distributor,
            FundScenario::Churner,
            FundScenario::LateFiler,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FundScenario::Accumulator => "accumulator",
            FundScenario::Distributor => "distributor",
            FundScenario::Churner => "churner",
            FundScenario::LateFiler => "late_filer",
        }
    }
}

const UNIVERSE: [(&str, &str); 10] = [
    ("AAPL", "037833100"),
    ("MSFT", "594918104"),
    ("NVDA", "67066G104"),
    ("AMZN", "023135106"),
    ("GOOGL", "02079K305"),
    ("META", "30303M102"),
    ("KO", "191216100"),
    ("JPM", "46625H100"),
    ("XOM", "30231G102"),
    ("BRK.B", "084670702"),
];

/// Names every scenario treats as its conviction positions
const CORE_NAMES: usize = 3;

const QUARTER_DAYS: i64 = 91;

#[derive(Debug, Clone)]
struct Book {
    ticker: &'static str,
    cusip: &'static str,
    core: bool,
    shares: i64,
    price_cents: i64,
}

/// Generates synthetic 13F filing histories
pub struct SyntheticFundGenerator {
    rng: StdRng,
    start_date: NaiveDate,
}

impl SyntheticFundGenerator {
    /// Create a new generator with a seed for reproducibility
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            start_date: NaiveDate::from_ymd_opt(2022, 2, 14).unwrap_or_default(),
        }
    }

    /// Generate `quarters` consecutive snapshots for one fund, oldest first
    ///
    /// # Arguments
    /// * `fund_id` - Fund identifier stamped on every snapshot
    /// * `scenario` - How the fund trades its core names
    /// * `quarters` - Number of filings to produce
    pub fn generate(
        &mut self,
        fund_id: &str,
        scenario: FundScenario,
        quarters: usize,
    ) -> Vec<HoldingsSnapshot> {
        let mut books: Vec<Book> = UNIVERSE
            .iter()
            .take(6)
            .enumerate()
            .map(|(idx, &(ticker, cusip))| Book {
                ticker,
                cusip,
                core: idx < CORE_NAMES,
                shares: self.rng.gen_range(10..200) * 1_000,
                price_cents: self.rng.gen_range(5_000..50_000),
            })
            .collect();

        let mut snapshots = Vec::with_capacity(quarters);
        let mut filing_date = self.start_date;

        for quarter in 0..quarters {
            if quarter > 0 {
                self.trade(scenario, &mut books);
                filing_date += Duration::days(QUARTER_DAYS);
                if scenario == FundScenario::LateFiler && quarter == quarters / 2 {
                    filing_date += Duration::days(QUARTER_DAYS);
                }
            }

            let filing_id = format!("{}-{}", fund_id, filing_date.format("%Y%m%d"));
            let mut snapshot = HoldingsSnapshot::new(fund_id, &filing_id, filing_date);

            for book in &books {
                snapshot = snapshot.with_position(
                    HoldingPosition::new(
                        book.ticker,
                        book.shares,
                        Decimal::new(book.shares * book.price_cents, 2),
                    )
                    .with_cusip(book.cusip),
                );
            }

            if scenario == FundScenario::Churner && self.rng.gen_bool(0.5) {
                let contracts = self.rng.gen_range(1..50) * 100;
                snapshot = snapshot.with_position(
                    HoldingPosition::new("SPY", contracts, Decimal::new(contracts * 250, 2))
                        .with_cusip("78462F103-C")
                        .with_type(InstrumentType::OptionCall),
                );
            }

            snapshots.push(snapshot);
        }

        snapshots
    }

    /// Move prices and apply one quarter of trading to the book
    fn trade(&mut self, scenario: FundScenario, books: &mut Vec<Book>) {
        for book in books.iter_mut() {
            let drift = self.rng.gen_range(-800..1_000); // basis points
            book.price_cents = (book.price_cents * (10_000 + drift) / 10_000).max(100);
        }

        for book in books.iter_mut() {
            let change_bps: i64 = match scenario {
                FundScenario::Accumulator | FundScenario::LateFiler if book.core => {
                    self.rng.gen_range(500..2_500)
                }
                FundScenario::Distributor if book.core => -self.rng.gen_range(1_000..3_000),
                FundScenario::Churner => self.rng.gen_range(-3_000..3_000),
                // Satellite positions drift a little or sit still
                _ => {
                    if self.rng.gen_bool(0.5) {
                        0
                    } else {
                        self.rng.gen_range(-500..500)
                    }
                }
            };
            book.shares = (book.shares * (10_000 + change_bps) / 10_000).max(0);

            // Distributors dump what is left once a core line gets small
            if scenario == FundScenario::Distributor && book.core && book.shares < 5_000 {
                book.shares = 0;
            }
        }

        // Rotate: drop a random satellite, pick up a name not held
        if scenario == FundScenario::Churner && self.rng.gen_bool(0.4) {
            let satellites: Vec<usize> = (0..books.len()).filter(|&i| !books[i].core).collect();
            if !satellites.is_empty() {
                let idx = satellites[self.rng.gen_range(0..satellites.len())];
                books.remove(idx);
            }
            if let Some(&(ticker, cusip)) = UNIVERSE
                .iter()
                .find(|(t, _)| !books.iter().any(|b| b.ticker == *t))
            {
                books.push(Book {
                    ticker,
                    cusip,
                    core: false,
                    shares: self.rng.gen_range(10..100) * 1_000,
                    price_cents: self.rng.gen_range(5_000..50_000),
                });
            }
        }

        // Exited lines are simply absent from the filing
        books.retain(|b| b.shares > 0);
    }
}
