//! Runtime log lines to `connection_health` points.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use relay_core::NodeId;
use relaygrid_compiler::tags::{self, ResolvedTag};
use relaygrid_compiler::TopologyRepository;
use relaygrid_metrics::{Point, SeriesError, TimeSeriesWriter};
use relaygrid_state::{BindingScope, StateError};

use crate::tracker::LinkTracker;

pub const HEALTH_MEASUREMENT: &str = "connection_health";

static ALIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"outbound \[([^\]]+)\] is alive\D*?(\d+(?:\.\d+)?)\s*ms").expect("static pattern")
});
static DEAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"outbound \[([^\]]+)\] is dead:?\s*(.*?)\s*$").expect("static pattern")
});
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2})").expect("static pattern")
});

#[derive(Debug, Error)]
pub enum CorrelateError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("time-series error: {0}")]
    Series(#[from] SeriesError),
}

pub type CorrelateResult<T> = Result<T, CorrelateError>;

/// One probe outcome read from a log line.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub tag: String,
    pub alive: bool,
    pub delay_ms: Option<f64>,
    pub reason: Option<String>,
    /// Unix seconds from the log line's own timestamp, when it has one.
    pub at: Option<u64>,
}

/// Parse a probe log line; `None` for every other line.
pub fn parse_line(line: &str) -> Option<Observation> {
    let at = TIMESTAMP_RE.captures(line).and_then(|caps| {
        NaiveDateTime::parse_from_str(&caps[1], "%Y/%m/%d %H:%M:%S")
            .ok()
            .and_then(|t| u64::try_from(t.and_utc().timestamp()).ok())
    });

    if let Some(caps) = ALIVE_RE.captures(line) {
        return Some(Observation {
            tag: caps[1].to_string(),
            alive: true,
            delay_ms: caps[2].parse().ok(),
            reason: None,
            at,
        });
    }
    DEAD_RE.captures(line).map(|caps| Observation {
        tag: caps[1].to_string(),
        alive: false,
        delay_ms: None,
        reason: Some(caps[2].to_string()).filter(|r| !r.is_empty()),
        at,
    })
}

/// Correlates probe observations with the topology.
///
/// Tag resolutions are cached per `(node, tag)` until [`clear_cache`] is
/// called, which callers do after the topology changes.
///
/// [`clear_cache`]: TelemetryCorrelator::clear_cache
pub struct TelemetryCorrelator<R> {
    repo: R,
    dead_threshold: u32,
    resolved: HashMap<(NodeId, String), Option<ResolvedTag>>,
    trackers: HashMap<(NodeId, String), LinkTracker>,
}

impl<R: TopologyRepository> TelemetryCorrelator<R> {
    pub fn new(repo: R, dead_threshold: u32) -> Self {
        Self {
            repo,
            dead_threshold,
            resolved: HashMap::new(),
            trackers: HashMap::new(),
        }
    }

    pub fn clear_cache(&mut self) {
        self.resolved.clear();
    }

    pub fn tracker(&self, node_id: NodeId, tag: &str) -> Option<&LinkTracker> {
        self.trackers.get(&(node_id, tag.to_string()))
    }

    fn resolve(&mut self, node_id: NodeId, tag: &str) -> CorrelateResult<Option<ResolvedTag>> {
        let key = (node_id, tag.to_string());
        if let Some(hit) = self.resolved.get(&key) {
            return Ok(hit.clone());
        }
        let resolved = tags::resolve(&self.repo, node_id, tag)?;
        if resolved.is_none() {
            debug!(node_id, tag, "probe for unknown outbound");
        }
        self.resolved.insert(key, resolved.clone());
        Ok(resolved)
    }

    /// Turn one observation from `node_id` into a health point.
    ///
    /// Returns `None` for tags that do not resolve on that node.
    pub fn observe(
        &mut self,
        node_id: NodeId,
        observation: &Observation,
        default_at: u64,
    ) -> CorrelateResult<Option<Point>> {
        let Some(resolved) = self.resolve(node_id, &observation.tag)? else {
            return Ok(None);
        };

        let dead_threshold = self.dead_threshold;
        let tracker = self
            .trackers
            .entry((node_id, observation.tag.clone()))
            .or_insert_with(|| LinkTracker::new(dead_threshold));
        tracker.record(observation.alive);
        let link_up = tracker.is_up();

        let binding = &resolved.binding;
        let mut point = Point::new(HEALTH_MEASUREMENT, observation.at.unwrap_or(default_at))
            .tag("node_id", node_id)
            .tag("connection_name", &observation.tag)
            .tag("connection_type", resolved.role.as_str())
            .tag("source_node_id", resolved.source_node_id)
            .tag("binding_id", binding.id)
            .field("link_up", link_up);
        if let Some(dest) = resolved.dest_node_id {
            point = point.tag("dest_node_id", dest);
        }
        point = match binding.scope {
            BindingScope::Rule(id) => point.tag("connection_rule_id", id),
            BindingScope::Tunnel(id) => point.tag("tunnel_id", id),
        };
        if let Some(delay) = observation.delay_ms {
            point = point.field("delay", delay);
        }
        if let Some(reason) = &observation.reason {
            point = point.field("reason", reason.as_str());
        }
        Ok(Some(point))
    }

    /// Correlate every probe line of a log chunk.
    pub fn correlate_lines(
        &mut self,
        node_id: NodeId,
        text: &str,
        default_at: u64,
    ) -> CorrelateResult<Vec<Point>> {
        let mut points = Vec::new();
        for observation in text.lines().filter_map(parse_line) {
            points.extend(self.observe(node_id, &observation, default_at)?);
        }
        Ok(points)
    }

    /// Correlate a log chunk and write the points. Returns how many were written.
    pub async fn ingest<W: TimeSeriesWriter>(
        &mut self,
        writer: &W,
        node_id: NodeId,
        text: &str,
        default_at: u64,
    ) -> CorrelateResult<usize> {
        let points = self.correlate_lines(node_id, text, default_at)?;
        if !points.is_empty() {
            writer.write(&points).await?;
        }
        Ok(points.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_alive_lines() {
        let obs = parse_line(
            "2023/11/14 22:13:20 [Info] app/observatory: outbound [ro_1_10] is alive, delay 123.5ms",
        )
        .unwrap();
        assert_eq!(obs.tag, "ro_1_10");
        assert!(obs.alive);
        assert_eq!(obs.delay_ms, Some(123.5));
        assert_eq!(obs.at, Some(1_700_000_000));
    }

    #[test]
    fn parses_dead_lines() {
        let obs = parse_line("[Warning] outbound [ic-rb_1_20_1_main] is dead: connection refused ")
            .unwrap();
        assert_eq!(obs.tag, "ic-rb_1_20_1_main");
        assert!(!obs.alive);
        assert_eq!(obs.reason.as_deref(), Some("connection refused"));
        assert_eq!(obs.at, None);
    }

    #[test]
    fn other_lines_are_ignored() {
        assert!(parse_line("[Info] proxy started").is_none());
        assert!(parse_line("").is_none());
    }
}
