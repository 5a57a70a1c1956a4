//! relaygrid-state — embedded state store for RelayGrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds the fleet topology the
//! compiler reads and the subscription periods whose usage counters the
//! accountant maintains.
//!
//! # Architecture
//!
//! ```text
//!   panel / relay import ──► topology tables ──► relaygrid-compiler (read-only)
//!
//!   relaygrid-accounting ──► claim_periods ──► periods ──► commit_counter
//!                                 (one write txn per batch)
//! ```
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Ids are zero-padded in keys so range scans follow id order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod plans;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use plans::{PlanProvider, SimpleLimits, is_connectable, provider_for};
pub use store::StateStore;
pub use types::*;
