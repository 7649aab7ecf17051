use std::time::Duration;
use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, DiffError>;

/// Errors raised while diffing holdings or talking to the filing/diff stores
#[derive(Error, Debug)]
pub enum DiffError {
    /// Snapshot violates its own invariants (duplicate identity key, wrong fund, ...)
    #[error("malformed snapshot for filing {filing_id}: {reason}")]
    MalformedSnapshot { filing_id: String, reason: String },

    /// Predecessor snapshot for a filing pair could not be fetched
    #[error("predecessor {filing_id} of filing {successor_id} unavailable: {reason}")]
    MissingPredecessor {
        filing_id: String,
        successor_id: String,
        /// true when caused by a store failure rather than a permanently missing filing
        transient: bool,
        reason: String,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Row read from a store could not be parsed into the data model
    #[error("invalid store row: {0}")]
    InvalidRow(String),

    #[error("reconciliation of fund {fund_id} timed out after {after:?}")]
    Timeout { fund_id: String, after: Duration },

    #[error("streak cache error: {0}")]
    Cache(String),
}

impl DiffError {
    pub fn malformed(filing_id: &str, reason: impl Into<String>) -> Self {
        DiffError::MalformedSnapshot {
            filing_id: filing_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the failed unit of work with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            DiffError::MalformedSnapshot { .. } => false,
            DiffError::MissingPredecessor { transient, .. } => *transient,
            DiffError::StoreUnavailable(_) => true,
            DiffError::InvalidRow(_) => false,
            DiffError::Timeout { .. } => true,
            DiffError::Cache(_) => true,
        }
    }
}

impl From<sqlx::Error> for DiffError {
    fn from(err: sqlx::Error) -> Self {
        DiffError::StoreUnavailable(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for DiffError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DiffError::StoreUnavailable(format!("migration failed: {}", err))
    }
}

impl From<redis::RedisError> for DiffError {
    fn from(err: redis::RedisError) -> Self {
        DiffError::Cache(err.to_string())
    }
}

impl From<serde_json::Error> for DiffError {
    fn from(err: serde_json::Error) -> Self {
        DiffError::Cache(format!("invalid cached payload: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(!DiffError::malformed("F1", "duplicate key AAPL").is_retryable());
        assert!(DiffError::StoreUnavailable("connection reset".into()).is_retryable());

        let permanent = DiffError::MissingPredecessor {
            filing_id: "F1".into(),
            successor_id: "F2".into(),
            transient: false,
            reason: "no holdings".into(),
        };
        assert!(!permanent.is_retryable());

        let transient = DiffError::MissingPredecessor {
            filing_id: "F1".into(),
            successor_id: "F2".into(),
            transient: true,
            reason: "store unavailable".into(),
        };
        assert!(transient.is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = DiffError::malformed("0001-24", "duplicate identity key 037833100");
        assert_eq!(
            err.to_string(),
            "malformed snapshot for filing 0001-24: duplicate identity key 037833100"
        );
    }
}
