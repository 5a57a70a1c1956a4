//! relaygrid-accounting — per-subscription usage accounting.
//!
//! # Architecture
//!
//! ```text
//!   node agent output ──► TrafficIngestor ──► xray_usage points ──► TimeSeriesWriter
//!                               │
//!                               └──► touch period / internal user usage window
//!
//!   UsageAccountant::sync ──────────────┐
//!   UsageAccountant::forward_flow_point ┴──► PeriodStore::claim (bounded batch)
//!                                              │
//!                                              ▼
//!                                   TimeSeriesReader::sum [start, stop)
//!                                              │
//!                                              ▼
//!                                   PeriodStore::commit (claim released)
//! ```
//!
//! Every query carries an explicit window; the accountant never asks the
//! time-series store for an open-ended range.

pub mod accountant;
pub mod error;
pub mod ingest;
pub mod store;

pub use accountant::{BatchReport, UsageAccountant, UsageAnomaly};
pub use error::{AccountingError, AccountingResult};
pub use ingest::{IngestSummary, TrafficIngestor, TrafficReport, parse_report_line};
pub use store::PeriodStore;
