//! redb table definitions for the RelayGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Numeric ids are zero-padded so range scans follow id order; composite keys
//! follow the pattern `{parent}/{child}`.

use redb::TableDefinition;

pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Nodes keyed by `{node_id}`.
pub const NODES: JsonTable = TableDefinition::new("nodes");

/// Program versions keyed by `{name}`.
pub const PROGRAMS: JsonTable = TableDefinition::new("programs");

/// Site settings under the single key [`SITE_KEY`].
pub const SITE: JsonTable = TableDefinition::new("site");

pub const SITE_KEY: &str = "site";

/// Connection rules keyed by `{rule_id}`.
pub const RULES: JsonTable = TableDefinition::new("rules");

/// Balancers keyed by `{rule|tunnel}:{id}/{name}`.
pub const BALANCERS: JsonTable = TableDefinition::new("balancers");

/// Outbound bindings keyed by `{binding_id}`.
pub const BINDINGS: JsonTable = TableDefinition::new("bindings");

/// Tunnels keyed by `{tunnel_id}`.
pub const TUNNELS: JsonTable = TableDefinition::new("tunnels");

/// Inbound types keyed by `{name}`.
pub const INBOUND_TYPES: JsonTable = TableDefinition::new("inbound_types");

/// Static inbounds keyed by `{id}`.
pub const STATIC_INBOUNDS: JsonTable = TableDefinition::new("static_inbounds");

/// Profiles keyed by `{profile_id}`.
pub const PROFILES: JsonTable = TableDefinition::new("profiles");

/// Plans keyed by `{plan_id}`.
pub const PLANS: JsonTable = TableDefinition::new("plans");

/// Subscription periods (with usage counters) keyed by `{period_id}`.
pub const PERIODS: JsonTable = TableDefinition::new("periods");

/// Internal users keyed by `{rule_id}/{node_id}`.
pub const INTERNAL_USERS: JsonTable = TableDefinition::new("internal_users");

pub const ALL_TABLES: [JsonTable; 13] = [
    NODES,
    PROGRAMS,
    SITE,
    RULES,
    BALANCERS,
    BINDINGS,
    TUNNELS,
    INBOUND_TYPES,
    STATIC_INBOUNDS,
    PROFILES,
    PLANS,
    PERIODS,
    INTERNAL_USERS,
];
