//! State store errors.
//!
//! redb failures are flattened to strings per stage; the store never needs
//! to branch on the underlying redb error kinds.

use thiserror::Error;

use crate::types::PeriodId;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state database: {0}")]
    Open(String),

    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open table: {0}")]
    Table(String),

    #[error("state read failed: {0}")]
    Read(String),

    #[error("state write failed: {0}")]
    Write(String),

    /// A stored record does not match its JSON shape (or cannot be encoded).
    #[error("record codec error: {0}")]
    Codec(String),

    #[error("subscription period {0} not found")]
    PeriodNotFound(PeriodId),
}
