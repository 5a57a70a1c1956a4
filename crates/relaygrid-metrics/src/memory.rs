//! In-process time-series store for tests and single-node runs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{SeriesError, SeriesResult};
use crate::point::Point;
use crate::series::{FieldSums, SumQuery, TimeSeriesReader, TimeSeriesWriter};

/// Shared, cloneable point buffer implementing both store seams.
#[derive(Clone, Default)]
pub struct InMemorySeries {
    points: Arc<Mutex<Vec<Point>>>,
    latency: Option<Duration>,
    timeout: Option<Duration>,
}

impl InMemorySeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every query, failing with a timeout once `timeout` is exceeded.
    pub fn with_latency(mut self, latency: Duration, timeout: Duration) -> Self {
        self.latency = Some(latency);
        self.timeout = Some(timeout);
        self
    }

    pub fn push(&self, point: Point) {
        if let Ok(mut points) = self.points.lock() {
            points.push(point);
        }
    }

    pub fn points(&self) -> Vec<Point> {
        self.points.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn sum_now(&self, query: &SumQuery) -> Option<FieldSums> {
        let points = self.points.lock().ok()?;
        let mut sums = FieldSums::new();
        let mut matched = false;
        for point in points.iter() {
            if point.measurement != query.measurement
                || point.timestamp < query.start
                || point.timestamp >= query.stop
                || !query.tags.iter().all(|(k, v)| point.tags.get(k) == Some(v))
            {
                continue;
            }
            for field in &query.fields {
                if let Some(value) = point.fields.get(field).and_then(|v| v.as_i64()) {
                    matched = true;
                    *sums.entry(field.clone()).or_insert(0) += value;
                }
            }
        }
        matched.then_some(sums)
    }
}

impl TimeSeriesReader for InMemorySeries {
    async fn sum(&self, query: &SumQuery) -> SeriesResult<Option<FieldSums>> {
        query.validate()?;
        if let (Some(latency), Some(timeout)) = (self.latency, self.timeout) {
            if tokio::time::timeout(timeout, tokio::time::sleep(latency))
                .await
                .is_err()
            {
                return Err(SeriesError::Timeout(timeout.as_secs()));
            }
        }
        Ok(self.sum_now(query))
    }
}

impl TimeSeriesWriter for InMemorySeries {
    async fn write(&self, points: &[Point]) -> SeriesResult<()> {
        let mut guard = self
            .points
            .lock()
            .map_err(|e| SeriesError::Http(e.to_string()))?;
        guard.extend(points.iter().cloned());
        Ok(())
    }
}
