//! Traffic ingestion — runtime stat counters into usage points.
//!
//! Node agents report the runtime's traffic counters as JSON lines:
//!
//! ```text
//! {"result_type":"xray_raw_traffic_v1","timestamp":"2024-01-01T00:00:00Z",
//!  "msg":"{\"stats\":[{\"name\":\"user>>>period3.profile9@d>>>traffic>>>downlink\",\"value\":512}]}"}
//! ```
//!
//! Each stat becomes a field on an `xray_usage` point, grouped per subject
//! (subscriber, internal user, inbound, outbound). Subscribers and internal
//! users seen in a report get their usage window widened to the collect
//! time, which is what makes them due for the next sync.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use relay_core::{NodeId, PeriodId, RuleId};
use relaygrid_metrics::{Point, TimeSeriesWriter};

use crate::accountant::{DOWNLOAD_FIELD, UPLOAD_FIELD, USAGE_MEASUREMENT};
use crate::error::{AccountingError, AccountingResult};
use crate::store::PeriodStore;

/// `result_type` of raw traffic reports.
pub const RAW_TRAFFIC_RESULT: &str = "xray_raw_traffic_v1";

static USER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^user>>>period(\d+)\.profile(\d+)(?:\.user(\d+))?[^>]*>>>traffic>>>(downlink|uplink)$")
        .expect("static pattern")
});
static INTERNAL_USER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^user>>>rule(\d+)\.node(\d+)[^>]*>>>traffic>>>(downlink|uplink)$")
        .expect("static pattern")
});
static INBOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^inbound>>>([^>]+)>>>traffic>>>(downlink|uplink)$").expect("static pattern")
});
static OUTBOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^outbound>>>([^>]+)>>>traffic>>>(downlink|uplink)$").expect("static pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrafficStat {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: i64,
}

/// One parsed traffic report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficReport {
    /// Unix seconds.
    pub collected_at: u64,
    pub stats: Vec<TrafficStat>,
}

#[derive(Deserialize)]
struct ResultLine {
    result_type: String,
    timestamp: String,
    msg: String,
}

#[derive(Deserialize)]
struct StatsMessage {
    #[serde(default)]
    stats: Vec<TrafficStat>,
}

/// Parse one agent output line. `Ok(None)` for blank lines and other result types.
pub fn parse_report_line(line: &str) -> AccountingResult<Option<TrafficReport>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let result: ResultLine =
        serde_json::from_str(line).map_err(|e| AccountingError::Report(e.to_string()))?;
    if result.result_type != RAW_TRAFFIC_RESULT {
        return Ok(None);
    }
    let collected_at = parse_timestamp(&result.timestamp)
        .ok_or_else(|| AccountingError::Report(format!("bad timestamp {:?}", result.timestamp)))?;
    let message: StatsMessage =
        serde_json::from_str(&result.msg).map_err(|e| AccountingError::Report(e.to_string()))?;
    Ok(Some(TrafficReport {
        collected_at,
        stats: message.stats,
    }))
}

/// RFC 3339, or a naive ISO timestamp taken as UTC.
fn parse_timestamp(raw: &str) -> Option<u64> {
    let secs = match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => t.timestamp(),
        Err(_) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()?
            .and_utc()
            .timestamp(),
    };
    u64::try_from(secs).ok()
}

/// Who a stat counts traffic for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum StatSubject {
    User {
        period_id: PeriodId,
        profile_id: u64,
        user_id: Option<u64>,
    },
    InternalUser {
        rule_id: RuleId,
        node_id: NodeId,
    },
    Inbound(String),
    Outbound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Downlink,
    Uplink,
}

impl Direction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "downlink" => Some(Direction::Downlink),
            "uplink" => Some(Direction::Uplink),
            _ => None,
        }
    }

    fn field(self) -> &'static str {
        match self {
            Direction::Downlink => DOWNLOAD_FIELD,
            Direction::Uplink => UPLOAD_FIELD,
        }
    }
}

/// Classify a stat name. Reverse and tunnel users are not accounted.
pub fn classify(name: &str) -> Option<(StatSubject, Direction)> {
    let num = |s: &str| s.parse::<u64>().ok();

    if let Some(caps) = USER_RE.captures(name) {
        let subject = StatSubject::User {
            period_id: num(&caps[1])?,
            profile_id: num(&caps[2])?,
            user_id: caps.get(3).and_then(|m| num(m.as_str())),
        };
        return Some((subject, Direction::parse(&caps[4])?));
    }
    if let Some(caps) = INTERNAL_USER_RE.captures(name) {
        let subject = StatSubject::InternalUser {
            rule_id: num(&caps[1])?,
            node_id: num(&caps[2])?,
        };
        return Some((subject, Direction::parse(&caps[3])?));
    }
    if let Some(caps) = INBOUND_RE.captures(name) {
        return Some((StatSubject::Inbound(caps[1].to_string()), Direction::parse(&caps[2])?));
    }
    if let Some(caps) = OUTBOUND_RE.captures(name) {
        return Some((StatSubject::Outbound(caps[1].to_string()), Direction::parse(&caps[2])?));
    }
    None
}

fn subject_point(subject: &StatSubject, node_id: NodeId, at: u64) -> Point {
    let point = Point::new(USAGE_MEASUREMENT, at).tag("node_id", node_id);
    match subject {
        StatSubject::User {
            period_id,
            profile_id,
            user_id,
        } => {
            let point = point
                .tag("usage_type", "user")
                .tag("period_id", period_id)
                .tag("profile_id", profile_id);
            match user_id {
                Some(id) => point.tag("user_id", id),
                None => point,
            }
        }
        StatSubject::InternalUser { rule_id, node_id } => point
            .tag("usage_type", "internal_user")
            .tag("rule_id", rule_id)
            .tag("node_user_id", node_id),
        StatSubject::Inbound(tag) => point.tag("usage_type", "inbound").tag("inbound_tag", tag),
        StatSubject::Outbound(tag) => point.tag("usage_type", "outbound").tag("outbound_tag", tag),
    }
}

/// Points and usage touches derived from one report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageBatch {
    pub points: Vec<Point>,
    pub periods: BTreeSet<PeriodId>,
    pub internal_users: BTreeSet<(RuleId, NodeId)>,
    /// Stats with a name no pattern matched.
    pub unmatched: usize,
}

/// Turn a report from `node_id` into usage points. Zero-valued stats are dropped.
pub fn build_usage(node_id: NodeId, report: &TrafficReport) -> UsageBatch {
    let mut grouped: BTreeMap<StatSubject, Point> = BTreeMap::new();
    let mut batch = UsageBatch::default();

    for stat in &report.stats {
        if stat.name.is_empty() || stat.value == 0 {
            continue;
        }
        let Some((subject, direction)) = classify(&stat.name) else {
            debug!(name = %stat.name, "unaccounted traffic stat");
            batch.unmatched += 1;
            continue;
        };
        match &subject {
            StatSubject::User { period_id, .. } => {
                batch.periods.insert(*period_id);
            }
            StatSubject::InternalUser { rule_id, node_id } => {
                batch.internal_users.insert((*rule_id, *node_id));
            }
            StatSubject::Inbound(_) | StatSubject::Outbound(_) => {}
        }
        let point = grouped
            .entry(subject)
            .or_insert_with_key(|s| subject_point(s, node_id, report.collected_at));
        point
            .fields
            .insert(direction.field().to_string(), stat.value.into());
    }

    batch.points = grouped.into_values().collect();
    batch
}

/// Summary of one ingest call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub reports: usize,
    pub points: usize,
    pub periods_touched: usize,
    pub internal_users_touched: usize,
    pub unmatched: usize,
    pub bad_lines: usize,
}

/// Writes usage points and widens usage windows.
pub struct TrafficIngestor<S, W> {
    store: S,
    writer: W,
}

impl<S: PeriodStore, W: TimeSeriesWriter> TrafficIngestor<S, W> {
    pub fn new(store: S, writer: W) -> Self {
        Self { store, writer }
    }

    /// Ingest one report collected from `node_id`.
    pub async fn ingest(&self, node_id: NodeId, report: &TrafficReport) -> AccountingResult<IngestSummary> {
        let batch = build_usage(node_id, report);
        if !batch.points.is_empty() {
            self.writer.write(&batch.points).await?;
        }

        // Touch after the write so a due period always has its points stored.
        let at = report.collected_at;
        let mut summary = IngestSummary {
            reports: 1,
            points: batch.points.len(),
            unmatched: batch.unmatched,
            ..IngestSummary::default()
        };
        for period_id in &batch.periods {
            if self.store.touch_period(*period_id, at)? {
                summary.periods_touched += 1;
            } else {
                debug!(period_id, node_id, "traffic for unknown period");
            }
        }
        for (rule_id, user_node_id) in &batch.internal_users {
            if self.store.touch_internal_user(*rule_id, *user_node_id, at)? {
                summary.internal_users_touched += 1;
            }
        }
        Ok(summary)
    }

    /// Ingest agent output; malformed lines are logged and skipped.
    pub async fn ingest_lines(&self, node_id: NodeId, text: &str) -> AccountingResult<IngestSummary> {
        let mut total = IngestSummary::default();
        for line in text.lines() {
            let report = match parse_report_line(line) {
                Ok(Some(report)) => report,
                Ok(None) => continue,
                Err(e) => {
                    warn!(node_id, error = %e, "skipping agent output line");
                    total.bad_lines += 1;
                    continue;
                }
            };
            let summary = self.ingest(node_id, &report).await?;
            total.reports += summary.reports;
            total.points += summary.points;
            total.periods_touched += summary.periods_touched;
            total.internal_users_touched += summary.internal_users_touched;
            total.unmatched += summary.unmatched;
        }
        if total.reports > 0 {
            info!(
                node_id,
                reports = total.reports,
                points = total.points,
                periods = total.periods_touched,
                "traffic ingested"
            );
        }
        Ok(total)
    }
}
