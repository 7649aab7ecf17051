use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};

use crate::error::{DiffError, Result};
use crate::models::{
    normalize_ticker, DiffAction, DiffRecord, FilingMeta, FilingStatus, HoldingPosition,
    HoldingsSnapshot, InstrumentType,
};
use crate::store::{DiffStore, FilingProvider};

/// Postgres-backed filing provider and diff store
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to Postgres
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }

    /// Every fund with at least one parsed filing
    pub async fn list_funds(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT fund_id
            FROM filings
            WHERE status = 'parsed'
            ORDER BY fund_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("fund_id")).collect())
    }

    /// Insert a parsed filing with its holdings (test seeding only)
    #[cfg(test)]
    pub async fn save_snapshot(&self, snapshot: &HoldingsSnapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO filings (filing_id, fund_id, filing_date, status)
            VALUES ($1, $2, $3, 'parsed')
            ON CONFLICT (filing_id) DO UPDATE SET status = 'parsed'
            "#,
        )
        .bind(&snapshot.filing_id)
        .bind(&snapshot.fund_id)
        .bind(snapshot.filing_date)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM holdings WHERE filing_id = $1")
            .bind(&snapshot.filing_id)
            .execute(&mut *tx)
            .await?;

        for position in &snapshot.positions {
            sqlx::query(
                r#"
                INSERT INTO holdings (filing_id, ticker, cusip, shares, market_value, instrument_type)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&snapshot.filing_id)
            .bind(&position.ticker)
            .bind(&position.cusip)
            .bind(position.shares)
            .bind(position.market_value)
            .bind(position.instrument_type.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete all filings, holdings and diffs of a fund (for testing)
    #[cfg(test)]
    pub async fn clear_fund(&self, fund_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM holding_diffs WHERE fund_id = $1")
            .bind(fund_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM diffed_filings WHERE fund_id = $1")
            .bind(fund_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM filings WHERE fund_id = $1")
            .bind(fund_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn diff_from_row(row: &PgRow) -> Result<DiffRecord> {
    let instrument_type: String = row.get("instrument_type");
    let action: String = row.get("action");

    Ok(DiffRecord {
        fund_id: row.get("fund_id"),
        filing_id_old: row.get("filing_id_old"),
        filing_id_new: row.get("filing_id_new"),
        filing_date: row.get("filing_date"),
        instrument_key: row.get("instrument_key"),
        ticker: row.get("ticker"),
        cusip: row.get("cusip"),
        instrument_type: instrument_type.parse()?,
        action: action.parse::<DiffAction>()?,
        diff_shares: row.get("diff_shares"),
        diff_value: row.get("diff_value"),
        old_shares: row.get("old_shares"),
        new_shares: row.get("new_shares"),
    })
}

#[async_trait]
impl FilingProvider for PostgresStore {
    async fn list_parsed_filings(&self, fund_id: &str) -> Result<Vec<FilingMeta>> {
        let rows = sqlx::query(
            r#"
            SELECT filing_id, fund_id, filing_date
            FROM filings
            WHERE fund_id = $1 AND status = 'parsed'
            ORDER BY filing_date ASC, filing_id ASC
            "#,
        )
        .bind(fund_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| FilingMeta {
                filing_id: row.get("filing_id"),
                fund_id: row.get("fund_id"),
                filing_date: row.get("filing_date"),
                status: FilingStatus::Parsed,
            })
            .collect())
    }

    async fn get_holdings(&self, filing_id: &str) -> Result<Option<HoldingsSnapshot>> {
        let filing = sqlx::query("SELECT fund_id, filing_date FROM filings WHERE filing_id = $1")
            .bind(filing_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(filing) = filing else {
            return Ok(None);
        };

        let rows = sqlx::query(
            r#"
            SELECT ticker, cusip, shares, market_value, instrument_type
            FROM holdings
            WHERE filing_id = $1
            ORDER BY id
            "#,
        )
        .bind(filing_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let fund_id: String = filing.get("fund_id");
        let filing_date: NaiveDate = filing.get("filing_date");
        let mut snapshot = HoldingsSnapshot::new(&fund_id, filing_id, filing_date);

        for row in rows {
            let ticker: String = row.get("ticker");
            let cusip: Option<String> = row.get("cusip");
            let instrument_type: String = row.get("instrument_type");
            let market_value: Decimal = row.get("market_value");

            snapshot.positions.push(HoldingPosition {
                ticker: normalize_ticker(&ticker),
                cusip: cusip.filter(|c| !c.trim().is_empty()),
                shares: row.get("shares"),
                market_value,
                instrument_type: instrument_type.parse::<InstrumentType>()?,
            });
        }

        Ok(Some(snapshot))
    }
}

#[async_trait]
impl DiffStore for PostgresStore {
    async fn has_diffs(&self, filing_id_new: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM diffed_filings WHERE filing_id_new = $1) AS present",
        )
        .bind(filing_id_new)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("present"))
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

        // One transaction per filing pair: the pair is either fully stored or not at all
        let mut tx = self.pool.begin().await?;

        for diff in diffs {
            sqlx::query(
                r#"
                INSERT INTO holding_diffs (
                    fund_id, filing_id_old, filing_id_new, filing_date, instrument_key,
                    ticker, cusip, instrument_type, action,
                    diff_shares, diff_value, old_shares, new_shares
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (fund_id, filing_id_new, instrument_key) DO UPDATE SET
                    filing_id_old = EXCLUDED.filing_id_old,
                    filing_date = EXCLUDED.filing_date,
                    ticker = EXCLUDED.ticker,
                    cusip = EXCLUDED.cusip,
                    instrument_type = EXCLUDED.instrument_type,
                    action = EXCLUDED.action,
                    diff_shares = EXCLUDED.diff_shares,
                    diff_value = EXCLUDED.diff_value,
                    old_shares = EXCLUDED.old_shares,
                    new_shares = EXCLUDED.new_shares,
                    updated_at = NOW()
                "#,
            )
            .bind(&diff.fund_id)
            .bind(&diff.filing_id_old)
            .bind(&diff.filing_id_new)
            .bind(diff.filing_date)
            .bind(&diff.instrument_key)
            .bind(&diff.ticker)
            .bind(&diff.cusip)
            .bind(diff.instrument_type.as_str())
            .bind(diff.action.as_str())
            .bind(diff.diff_shares)
            .bind(diff.diff_value)
            .bind(diff.old_shares)
            .bind(diff.new_shares)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO diffed_filings (filing_id_new, fund_id, diff_count)
            VALUES ($1, $2, $3)
            ON CONFLICT (filing_id_new) DO UPDATE SET
                diff_count = EXCLUDED.diff_count,
                diffed_at = NOW()
            "#,
        )
        .bind(filing_id_new)
        .bind(fund_id)
        .bind(diffs.len() as i32)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!("Upserted {} diffs for filing {}", diffs.len(), filing_id_new);

        Ok(())
    }

    async fn list_diffs(&self, fund_id: &str, ticker: &str) -> Result<Vec<DiffRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT fund_id, filing_id_old, filing_id_new, filing_date, instrument_key,
                   ticker, cusip, instrument_type, action,
                   diff_shares, diff_value, old_shares, new_shares
            FROM holding_diffs
            WHERE fund_id = $1 AND ticker = $2
            ORDER BY filing_date DESC, filing_id_new DESC
            "#,
        )
        .bind(fund_id)
        .bind(ticker)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(diff_from_row).collect()
    }
}
