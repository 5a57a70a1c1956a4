//! relaygrid-metrics — time-series plumbing for RelayGrid.
//!
//! # Architecture
//!
//! ```text
//!   ingest / health ──► Point ──► TimeSeriesWriter ──► /api/v2/write (line protocol)
//!
//!   accounting ──► SumQuery ──► TimeSeriesReader ──► /api/v2/query (Flux, annotated CSV)
//! ```
//!
//! Queries are always bounded: a `SumQuery` carries an explicit
//! `[start, stop)` window. `InMemorySeries` implements both traits for tests
//! and local runs.

pub mod error;
pub mod influx;
pub mod memory;
pub mod point;
pub mod series;

pub use error::{SeriesError, SeriesResult};
pub use influx::InfluxClient;
pub use memory::InMemorySeries;
pub use point::{FieldValue, Point};
pub use series::{FieldSums, SumQuery, TimeSeriesReader, TimeSeriesWriter};
