//! UsageAccountant — keeps per-period usage counters current.
//!
//! The time-series store holds per-collection byte counts, so the usage of a
//! period is a sum over a time window. Summing from the start of a period on
//! every sync would grow without bound; instead each period keeps a sliding
//! window:
//!
//! ```text
//!   flow_point_at ─────────────── now
//!   │◄──── flow_* = sum(window) ────►│
//!
//!   sync:     flow' = sum[flow_point_at, now)
//!             current += (flow' - flow) × factor
//!
//!   forward:  between = sum[flow_point_at, now - retention)
//!             flow -= between
//!             flow_point_at = now - retention
//! ```
//!
//! `current_*` only ever grows. Both operations claim a bounded batch of
//! periods, so concurrent runs never process the same period twice.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use relay_core::config::AccountingConfig;
use relay_core::{PeriodId, epoch_secs};
use relaygrid_metrics::{FieldSums, SumQuery, TimeSeriesReader};
use relaygrid_state::{ClaimOp, SubscriptionPeriod, UsageCounter};

use crate::error::{AccountingError, AccountingResult};
use crate::store::PeriodStore;

pub const USAGE_MEASUREMENT: &str = "xray_usage";
pub const DOWNLOAD_FIELD: &str = "dl_bytes";
pub const UPLOAD_FIELD: &str = "up_bytes";

/// Counter movements that could not be folded normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageAnomaly {
    /// A sync returned less than the stored flow; the flow was rebased and
    /// `current_*` left untouched.
    CounterRegressed {
        period_id: PeriodId,
        download: u64,
        upload: u64,
    },
    /// Forwarding subtracted more than the stored flow; the overshoot was
    /// added to `current_*`.
    NegativeDelta {
        period_id: PeriodId,
        download: u64,
        upload: u64,
    },
}

/// Overshoot or regression per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Excess {
    pub download: u64,
    pub upload: u64,
}

impl Excess {
    fn is_zero(&self) -> bool {
        self.download == 0 && self.upload == 0
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub claimed: usize,
    pub updated: usize,
    /// Claimed but nothing to fold (no data in the window).
    pub skipped: usize,
    /// Claims that expired before the commit.
    pub lost: usize,
    pub anomalies: Vec<UsageAnomaly>,
}

enum Outcome {
    Updated(Option<UsageAnomaly>),
    Skipped,
    Lost,
}

impl BatchReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Updated(anomaly) => {
                self.updated += 1;
                self.anomalies.extend(anomaly);
            }
            Outcome::Skipped => self.skipped += 1,
            Outcome::Lost => self.lost += 1,
        }
    }
}

/// The bounded query for one period's user traffic.
pub fn usage_query(period_id: PeriodId, start: u64, stop: u64) -> SumQuery {
    SumQuery::new(USAGE_MEASUREMENT, start, stop)
        .field(DOWNLOAD_FIELD)
        .field(UPLOAD_FIELD)
        .tag("usage_type", "user")
        .tag("period_id", period_id)
}

/// Download and upload sums, missing or negative fields read as zero.
fn directions(sums: Option<FieldSums>) -> (u64, u64) {
    let read = |field: &str| {
        sums.as_ref()
            .and_then(|s| s.get(field))
            .and_then(|v| u64::try_from(*v).ok())
            .unwrap_or(0)
    };
    (read(DOWNLOAD_FIELD), read(UPLOAD_FIELD))
}

fn scale(delta: u64, factor: f64) -> u64 {
    if factor == 1.0 {
        delta
    } else {
        (delta as f64 * factor).round() as u64
    }
}

/// Fold a fresh window sum into the counter.
///
/// Returns the regression when the new sum is below the stored flow.
pub fn fold_sync(counter: &mut UsageCounter, new_download: u64, new_upload: u64, factor: f64) -> Excess {
    let mut regressed = Excess::default();

    if new_download >= counter.flow_download_bytes {
        counter.current_download_bytes +=
            scale(new_download - counter.flow_download_bytes, factor);
    } else {
        regressed.download = counter.flow_download_bytes - new_download;
    }
    counter.flow_download_bytes = new_download;

    if new_upload >= counter.flow_upload_bytes {
        counter.current_upload_bytes += scale(new_upload - counter.flow_upload_bytes, factor);
    } else {
        regressed.upload = counter.flow_upload_bytes - new_upload;
    }
    counter.flow_upload_bytes = new_upload;

    regressed
}

/// Subtract the usage that left the window and move the floor.
///
/// Returns the overshoot when more was subtracted than the flow held.
pub fn fold_forward(
    counter: &mut UsageCounter,
    between_download: u64,
    between_upload: u64,
    new_floor: u64,
    factor: f64,
) -> Excess {
    let mut overshoot = Excess::default();

    match counter.flow_download_bytes.checked_sub(between_download) {
        Some(rest) => counter.flow_download_bytes = rest,
        None => {
            overshoot.download = between_download - counter.flow_download_bytes;
            counter.flow_download_bytes = 0;
            counter.current_download_bytes += scale(overshoot.download, factor);
        }
    }
    match counter.flow_upload_bytes.checked_sub(between_upload) {
        Some(rest) => counter.flow_upload_bytes = rest,
        None => {
            overshoot.upload = between_upload - counter.flow_upload_bytes;
            counter.flow_upload_bytes = 0;
            counter.current_upload_bytes += scale(overshoot.upload, factor);
        }
    }
    counter.flow_point_at = Some(new_floor);

    overshoot
}

/// A period is due for sync when usage was seen after its last sync (plus
/// the activity gap), or when it has usage and was never synced.
pub fn sync_due(period: &SubscriptionPeriod, gap_secs: u64) -> bool {
    match (period.last_usage_at, period.counter.last_flow_sync_at) {
        (Some(used), Some(synced)) => used > synced.saturating_add(gap_secs),
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// A period is due for forwarding when its floor trails `new_floor`.
pub fn forward_due(period: &SubscriptionPeriod, new_floor: u64) -> bool {
    period.counter.flow_point_at.is_some_and(|at| at < new_floor)
}

pub struct UsageAccountant<S, R> {
    store: S,
    series: R,
    config: AccountingConfig,
}

impl<S: PeriodStore, R: TimeSeriesReader> UsageAccountant<S, R> {
    pub fn new(store: S, series: R, config: AccountingConfig) -> Self {
        Self {
            store,
            series,
            config,
        }
    }

    pub fn config(&self) -> &AccountingConfig {
        &self.config
    }

    /// Fold new usage into the periods that saw traffic since their last sync.
    pub async fn sync(&self, now: u64) -> AccountingResult<BatchReport> {
        let gap = self.config.min_activity_gap_secs;
        let claimed = self.store.claim(
            ClaimOp::Sync,
            now,
            self.config.claim_lease_secs,
            self.config.batch_size,
            &|p: &SubscriptionPeriod| sync_due(p, gap),
            &|p: &SubscriptionPeriod| p.counter.last_flow_sync_at,
        )?;
        if claimed.is_empty() {
            debug!("usage sync: nothing to do");
            return Ok(BatchReport::default());
        }

        let mut report = BatchReport {
            claimed: claimed.len(),
            ..BatchReport::default()
        };
        let mut pending = claimed.into_iter();
        while let Some(period) = pending.next() {
            match self.sync_one(&period, now).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    self.abandon(period, pending);
                    return Err(e);
                }
            }
        }

        info!(
            claimed = report.claimed,
            updated = report.updated,
            skipped = report.skipped,
            anomalies = report.anomalies.len(),
            "usage sync finished"
        );
        Ok(report)
    }

    async fn sync_one(&self, period: &SubscriptionPeriod, now: u64) -> AccountingResult<Outcome> {
        let mut counter = period.counter.clone();
        let floor = *counter
            .flow_point_at
            .get_or_insert(now.saturating_sub(self.config.regulate_seconds));
        if floor >= now {
            self.release(period)?;
            return Ok(Outcome::Skipped);
        }

        let sums = self.series.sum(&usage_query(period.id, floor, now)).await?;
        let (download, upload) = directions(sums);
        counter.last_flow_sync_at = Some(now);

        if download == 0 && upload == 0 {
            // Stamp the sync so an idle period leaves the due set until new usage.
            debug!(period_id = period.id, "no usage in window yet");
            return self.commit(period, &counter, Outcome::Skipped);
        }

        let regressed = fold_sync(&mut counter, download, upload, self.config.correction_factor);
        let anomaly = (!regressed.is_zero()).then(|| {
            error!(
                period_id = period.id,
                download = regressed.download,
                upload = regressed.upload,
                "usage counter regressed, flow rebased"
            );
            UsageAnomaly::CounterRegressed {
                period_id: period.id,
                download: regressed.download,
                upload: regressed.upload,
            }
        });
        debug!(
            period_id = period.id,
            flow_download = counter.flow_download_bytes,
            flow_upload = counter.flow_upload_bytes,
            current_download = counter.current_download_bytes,
            current_upload = counter.current_upload_bytes,
            "usage synced"
        );
        self.commit(period, &counter, Outcome::Updated(anomaly))
    }

    /// Move the window floor of periods whose floor trails the retention.
    pub async fn forward_flow_point(&self, now: u64) -> AccountingResult<BatchReport> {
        let new_floor = now.saturating_sub(self.config.flow_point_retention_seconds);
        let claimed = self.store.claim(
            ClaimOp::ForwardFlowPoint,
            now,
            self.config.claim_lease_secs,
            self.config.batch_size,
            &|p: &SubscriptionPeriod| forward_due(p, new_floor),
            &|p: &SubscriptionPeriod| p.counter.flow_point_at,
        )?;
        if claimed.is_empty() {
            debug!("flow point forward: nothing to do");
            return Ok(BatchReport::default());
        }

        let mut report = BatchReport {
            claimed: claimed.len(),
            ..BatchReport::default()
        };
        let mut pending = claimed.into_iter();
        while let Some(period) = pending.next() {
            match self.forward_one(&period, new_floor).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    self.abandon(period, pending);
                    return Err(e);
                }
            }
        }

        info!(
            claimed = report.claimed,
            updated = report.updated,
            new_floor,
            anomalies = report.anomalies.len(),
            "flow point forward finished"
        );
        Ok(report)
    }

    async fn forward_one(
        &self,
        period: &SubscriptionPeriod,
        new_floor: u64,
    ) -> AccountingResult<Outcome> {
        let mut counter = period.counter.clone();
        let Some(floor) = counter.flow_point_at.filter(|at| *at < new_floor) else {
            self.release(period)?;
            return Ok(Outcome::Skipped);
        };

        let sums = self
            .series
            .sum(&usage_query(period.id, floor, new_floor))
            .await?;
        let (download, upload) = directions(sums);

        let overshoot = fold_forward(
            &mut counter,
            download,
            upload,
            new_floor,
            self.config.correction_factor,
        );
        let anomaly = (!overshoot.is_zero()).then(|| {
            error!(
                period_id = period.id,
                download = overshoot.download,
                upload = overshoot.upload,
                "negative flow after forwarding, overshoot added to current usage"
            );
            UsageAnomaly::NegativeDelta {
                period_id: period.id,
                download: overshoot.download,
                upload: overshoot.upload,
            }
        });
        self.commit(period, &counter, Outcome::Updated(anomaly))
    }

    /// Commit under the claim the period was handed out with.
    fn commit(
        &self,
        period: &SubscriptionPeriod,
        counter: &UsageCounter,
        outcome: Outcome,
    ) -> AccountingResult<Outcome> {
        let Some(claim) = period.claim else {
            return Ok(Outcome::Lost);
        };
        if self.store.commit(period.id, claim, counter)? {
            Ok(outcome)
        } else {
            Ok(Outcome::Lost)
        }
    }

    fn release(&self, period: &SubscriptionPeriod) -> AccountingResult<bool> {
        match period.claim {
            Some(claim) => Ok(self.store.release(period.id, claim)?),
            None => Ok(false),
        }
    }

    /// Release the failed period and every unprocessed claim of the batch.
    fn abandon(&self, failed: SubscriptionPeriod, rest: impl Iterator<Item = SubscriptionPeriod>) {
        for period in std::iter::once(failed).chain(rest) {
            if let Err(e) = self.release(&period) {
                warn!(period_id = period.id, op = ?period.claim.map(|c| c.op), error = %e, "failed to release claim");
            }
        }
    }

    /// Run sync and forward on their intervals until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let sync_interval = self.config.sync_interval();
        let forward_interval = self.config.forward_interval();
        info!(
            sync_interval_secs = sync_interval.as_secs(),
            forward_interval_secs = forward_interval.as_secs(),
            "usage accountant started"
        );

        let mut sync_tick = ticker(sync_interval);
        let mut forward_tick = ticker(forward_interval);
        loop {
            tokio::select! {
                _ = sync_tick.tick() => {
                    if let Err(e) = self.sync(epoch_secs()).await {
                        log_failure("usage sync", &e);
                    }
                }
                _ = forward_tick.tick() => {
                    if let Err(e) = self.forward_flow_point(epoch_secs()).await {
                        log_failure("flow point forward", &e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("usage accountant shutting down");
                    break;
                }
            }
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

fn log_failure(job: &str, e: &AccountingError) {
    if e.is_retryable() {
        warn!(job, error = %e, "accounting run failed, will retry");
    } else {
        error!(job, error = %e, "accounting run failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(flow: (u64, u64), current: (u64, u64)) -> UsageCounter {
        UsageCounter {
            flow_point_at: Some(1_000),
            flow_download_bytes: flow.0,
            flow_upload_bytes: flow.1,
            current_download_bytes: current.0,
            current_upload_bytes: current.1,
            last_flow_sync_at: Some(2_000),
        }
    }

    // ── Sync fold ──────────────────────────────────────────────────

    #[test]
    fn sync_adds_the_difference() {
        let mut c = counter((100, 50), (1_000, 500));
        let regressed = fold_sync(&mut c, 140, 70, 1.0);
        assert!(regressed.is_zero());
        assert_eq!((c.flow_download_bytes, c.flow_upload_bytes), (140, 70));
        assert_eq!((c.current_download_bytes, c.current_upload_bytes), (1_040, 520));
    }

    #[test]
    fn sync_regression_rebases_without_decreasing_current() {
        let mut c = counter((100, 50), (1_000, 500));
        let regressed = fold_sync(&mut c, 90, 60, 1.0);
        assert_eq!(regressed, Excess { download: 10, upload: 0 });
        assert_eq!((c.flow_download_bytes, c.flow_upload_bytes), (90, 60));
        assert_eq!((c.current_download_bytes, c.current_upload_bytes), (1_000, 510));
    }

    #[test]
    fn correction_factor_scales_folded_deltas() {
        let mut c = counter((0, 0), (0, 0));
        fold_sync(&mut c, 100, 10, 1.5);
        assert_eq!((c.current_download_bytes, c.current_upload_bytes), (150, 15));
        // The flow keeps raw values.
        assert_eq!(c.flow_download_bytes, 100);
    }

    // ── Forward fold ───────────────────────────────────────────────

    #[test]
    fn forward_subtracts_between_window() {
        let mut c = counter((140, 70), (1_000, 500));
        let overshoot = fold_forward(&mut c, 40, 20, 5_000, 1.0);
        assert!(overshoot.is_zero());
        assert_eq!((c.flow_download_bytes, c.flow_upload_bytes), (100, 50));
        assert_eq!((c.current_download_bytes, c.current_upload_bytes), (1_000, 500));
        assert_eq!(c.flow_point_at, Some(5_000));
    }

    #[test]
    fn forward_overshoot_goes_to_current() {
        let mut c = counter((140, 70), (1_000, 500));
        let overshoot = fold_forward(&mut c, 150, 70, 5_000, 1.0);
        assert_eq!(overshoot, Excess { download: 10, upload: 0 });
        assert_eq!((c.flow_download_bytes, c.flow_upload_bytes), (0, 0));
        assert_eq!((c.current_download_bytes, c.current_upload_bytes), (1_010, 500));
    }

    // ── Due filters ────────────────────────────────────────────────

    fn period(last_usage: Option<u64>, synced: Option<u64>, floor: Option<u64>) -> SubscriptionPeriod {
        SubscriptionPeriod {
            id: 1,
            profile_id: 1,
            plan_id: 1,
            plan_args: serde_json::Value::Null,
            selected_as_current: true,
            first_usage_at: last_usage,
            last_usage_at: last_usage,
            counter: UsageCounter {
                flow_point_at: floor,
                last_flow_sync_at: synced,
                ..UsageCounter::default()
            },
            claim: None,
        }
    }

    #[test]
    fn sync_due_respects_activity_gap() {
        assert!(sync_due(&period(Some(100), None, None), 60));
        assert!(!sync_due(&period(None, None, None), 60));
        assert!(!sync_due(&period(Some(150), Some(100), None), 60));
        assert!(sync_due(&period(Some(161), Some(100), None), 60));
    }

    #[test]
    fn forward_due_needs_a_trailing_floor() {
        assert!(forward_due(&period(None, None, Some(10)), 20));
        assert!(!forward_due(&period(None, None, Some(20)), 20));
        assert!(!forward_due(&period(None, None, None), 20));
    }

    #[test]
    fn query_is_bounded_and_filtered() {
        let q = usage_query(7, 100, 200);
        assert_eq!((q.start, q.stop), (100, 200));
        assert_eq!(q.tags.get("period_id").map(String::as_str), Some("7"));
        assert_eq!(q.tags.get("usage_type").map(String::as_str), Some("user"));
        assert_eq!(q.fields, vec![DOWNLOAD_FIELD, UPLOAD_FIELD]);
    }

    #[test]
    fn missing_and_negative_sums_read_as_zero() {
        let mut sums = FieldSums::new();
        sums.insert(DOWNLOAD_FIELD.to_string(), -5);
        assert_eq!(directions(Some(sums)), (0, 0));
        assert_eq!(directions(None), (0, 0));
    }
}
