//! relaygrid-compiler — turns the fleet topology into one runtime config per node.
//!
//! # Architecture
//!
//! ```text
//!   TopologyRepository (read-only, StateStore)
//!            │
//!            ▼
//!   ConfigCompiler::compile(node) ──► TemplateRenderer (handlebars fragments)
//!            │                    ──► BalancerStrategy (costs, order, fallback)
//!            │                    ──► tags (outbound tag codec)
//!            ▼
//!   NodeArtifacts { config, hash, files, supervisor }
//! ```
//!
//! # Components
//!
//! - **`tags`** — Encode/decode outbound tags so telemetry maps back to bindings
//! - **`strategy`** — Weight-to-cost conversion and deterministic member order
//! - **`render`** — Strict handlebars rendering with per-site variable contracts
//! - **`repository`** — Read access to the topology plus proxy user derivation
//! - **`compiler`** — Assembles the runtime document and artifact list
//! - **`output`** — Writes a node's artifacts to disk, skipping unchanged configs

pub mod compiler;
pub mod error;
pub mod output;
pub mod render;
pub mod repository;
pub mod strategy;
pub mod tags;

pub use compiler::{CompileOptions, CompileReport, ConfigCompiler, NodeArtifacts, SkippedFragment};
pub use error::{CompileError, CompileResult};
pub use output::write_artifacts;
pub use render::{RenderEnv, RenderSite, TemplateRenderer};
pub use repository::{ProxyUser, TopologyRepository};
pub use strategy::{Candidate, StrategyPlan};
pub use tags::{LinkRole, ResolvedTag, ReverseSide, TagRef};
