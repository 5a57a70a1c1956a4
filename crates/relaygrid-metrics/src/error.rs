//! Error types for time-series access.

use thiserror::Error;

pub type SeriesResult<T> = Result<T, SeriesError>;

#[derive(Debug, Error)]
pub enum SeriesError {
    /// The store did not answer within the configured timeout. Retryable.
    #[error("time-series request timed out after {0}s")]
    Timeout(u64),

    #[error("connection to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("http error: {0}")]
    Http(String),

    #[error("time-series store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unparseable response: {0}")]
    Parse(String),

    #[error("invalid query window [{start}, {stop})")]
    InvalidWindow { start: u64, stop: u64 },
}

impl SeriesError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SeriesError::Timeout(_))
    }
}
