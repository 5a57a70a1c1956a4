//! Accounting error types.

use thiserror::Error;

use relaygrid_metrics::SeriesError;
use relaygrid_state::StateError;

#[derive(Debug, Error)]
pub enum AccountingError {
    /// The time-series store did not answer in time. Retryable.
    #[error("time-series query timed out after {0}s")]
    ExternalQueryTimeout(u64),

    #[error("time-series error: {0}")]
    Series(SeriesError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("malformed traffic report: {0}")]
    Report(String),
}

impl AccountingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AccountingError::ExternalQueryTimeout(_))
    }
}

impl From<SeriesError> for AccountingError {
    fn from(e: SeriesError) -> Self {
        match e {
            SeriesError::Timeout(secs) => AccountingError::ExternalQueryTimeout(secs),
            other => AccountingError::Series(other),
        }
    }
}

pub type AccountingResult<T> = Result<T, AccountingError>;
