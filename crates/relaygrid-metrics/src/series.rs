//! Reader and writer seams for the time-series store.

use std::collections::BTreeMap;
use std::future::Future;

use crate::error::{SeriesError, SeriesResult};
use crate::point::Point;

/// Per-field sums returned by a [`SumQuery`].
pub type FieldSums = BTreeMap<String, i64>;

/// Sum of `fields` over points matching `tags` in `[start, stop)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SumQuery {
    pub measurement: String,
    pub fields: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub start: u64,
    pub stop: u64,
}

impl SumQuery {
    pub fn new(measurement: impl Into<String>, start: u64, stop: u64) -> Self {
        Self {
            measurement: measurement.into(),
            fields: Vec::new(),
            tags: BTreeMap::new(),
            start,
            stop,
        }
    }

    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(name.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.tags.insert(key.into(), value.to_string());
        self
    }

    /// Reject empty or inverted windows before they reach the store.
    pub fn validate(&self) -> SeriesResult<()> {
        if self.start >= self.stop {
            return Err(SeriesError::InvalidWindow {
                start: self.start,
                stop: self.stop,
            });
        }
        Ok(())
    }
}

pub trait TimeSeriesReader: Send + Sync {
    /// `Ok(None)` when no point matched the query at all.
    fn sum(&self, query: &SumQuery) -> impl Future<Output = SeriesResult<Option<FieldSums>>> + Send;
}

pub trait TimeSeriesWriter: Send + Sync {
    fn write(&self, points: &[Point]) -> impl Future<Output = SeriesResult<()>> + Send;
}
