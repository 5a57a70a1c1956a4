//! relaygrid-health — link health from runtime telemetry.
//!
//! The proxy runtime probes every balancer member and logs the outcome.
//! Those log lines name outbounds only by tag; the correlator decodes the
//! tag back to its binding and emits a `connection_health` point carrying
//! the link's role and endpoints.
//!
//! # Architecture
//!
//! ```text
//! runtime log line
//!   └── parse_line() → Observation { tag, alive, delay / reason }
//!         └── TelemetryCorrelator
//!               ├── tags::resolve (cached per node + tag)
//!               ├── LinkTracker (consecutive dead observations)
//!               └── Point "connection_health" → TimeSeriesWriter
//! ```
//!
//! A single dead observation does not take a link down; it has to be seen
//! dead `dead_threshold` times in a row. One alive observation restores it.

pub mod correlator;
pub mod tracker;

pub use correlator::{CorrelateError, CorrelateResult, Observation, TelemetryCorrelator, parse_line};
pub use tracker::{LinkStatus, LinkTracker};
