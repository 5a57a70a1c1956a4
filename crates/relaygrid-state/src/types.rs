//! Domain types for the RelayGrid state store.
//!
//! Topology (nodes, rules, bindings, tunnels, templates) is written by the
//! panel and only read by the compiler. Subscription periods carry the usage
//! counters owned by the accountant. All types are JSON-serialized into redb.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use relay_core::{BindingId, NodeId, PeriodId, PlanId, ProfileId, RuleId, TunnelId};

/// Zero-padded key so lexical table order matches numeric order.
pub fn id_key(id: u64) -> String {
    format!("{id:020}")
}

// ── Nodes & programs ───────────────────────────────────────────────

/// A fleet member hosting one proxy-runtime instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Target architecture, matched against program binaries ("amd64", "arm64").
    pub architecture: String,
    pub address: Option<String>,
    /// Nodes with the runtime disabled produce no config.
    #[serde(default = "default_true")]
    pub runtime_enabled: bool,
    /// Named file contents templates can reference (certificates, keys).
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl Node {
    pub fn table_key(&self) -> String {
        id_key(self.id)
    }
}

fn default_true() -> bool {
    true
}

/// A downloadable build of a program for one architecture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgramBinary {
    pub architecture: String,
    /// Source URI (`https://…`, `sha256:…`).
    pub source: String,
    /// sha256 of the binary.
    pub hash: String,
}

/// A program already installed on a specific node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeInnerProgram {
    pub node_id: NodeId,
    pub path: String,
}

/// A named program (runtime binary, geo asset) with its per-node locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgramVersion {
    pub name: String,
    #[serde(default)]
    pub binaries: Vec<ProgramBinary>,
    #[serde(default)]
    pub on_node: Vec<NodeInnerProgram>,
}

/// Where a node finds a program.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramLocation {
    Binary(ProgramBinary),
    OnNode { path: String },
}

impl ProgramVersion {
    /// An installed copy wins over a download; downloads must match the architecture.
    pub fn for_node(&self, node: &Node) -> Option<ProgramLocation> {
        if let Some(inner) = self.on_node.iter().find(|p| p.node_id == node.id) {
            return Some(ProgramLocation::OnNode {
                path: inner.path.clone(),
            });
        }
        self.binaries
            .iter()
            .find(|b| b.architecture == node.architecture)
            .cloned()
            .map(ProgramLocation::Binary)
    }
}

/// Site-wide settings (singleton).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SiteConfig {
    /// Program name of the proxy runtime.
    pub runtime_program: Option<String>,
    pub geosite_program: Option<String>,
    pub geoip_program: Option<String>,
    /// Base runtime document the compiled sections are merged over.
    pub base_config_template: Option<String>,
    /// Seed for reverse-link credentials of rule bindings.
    pub reverse_seed: String,
    /// Domain used in proxy user identities.
    pub user_domain: String,
    /// Fallback for named files not defined on the node.
    pub files: BTreeMap<String, String>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            runtime_program: None,
            geosite_program: None,
            geoip_program: None,
            base_config_template: None,
            reverse_seed: String::new(),
            user_domain: "relaygrid.local".to_string(),
            files: BTreeMap::new(),
        }
    }
}

// ── Connection rules ───────────────────────────────────────────────

/// A logical route from an origin region to a destination region.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionRule {
    pub id: RuleId,
    pub name: String,
    #[serde(default)]
    pub origin_region: String,
    #[serde(default)]
    pub destination_region: String,
    /// Renders to one or more routing rule objects.
    #[serde(default)]
    pub rules_template: String,
}

impl ConnectionRule {
    pub fn table_key(&self) -> String {
        id_key(self.id)
    }
}

/// What a binding or balancer belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum BindingScope {
    Rule(RuleId),
    Tunnel(TunnelId),
}

impl BindingScope {
    pub fn key(&self) -> String {
        match self {
            BindingScope::Rule(id) => format!("rule:{}", id_key(*id)),
            BindingScope::Tunnel(id) => format!("tunnel:{}", id_key(*id)),
        }
    }
}

/// A named group of outbounds selected by observed latency and cost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Balancer {
    pub scope: BindingScope,
    pub name: String,
    /// Replaces the default least-load strategy block when set.
    pub strategy_template: Option<String>,
    #[serde(default)]
    pub baselines_ms: Vec<u64>,
    pub max_rtt_ms: Option<u64>,
}

impl Balancer {
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.scope.key(), self.name)
    }
}

/// Resolved address of the remote inbound an outbound connects to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Combo {
    pub address: String,
    pub port: u16,
    pub sni: Option<String>,
    pub host_header: Option<String>,
}

/// How an outbound is rendered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connector {
    pub outbound_template: String,
    pub inbound_type: Option<String>,
    pub dest_node_id: Option<NodeId>,
    pub combo: Option<Combo>,
}

/// Weight of a binding inside one balancer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Allocation {
    pub balancer: String,
    pub weight: u32,
}

/// Marks a binding as a reverse link; `node_id` of the binding is the bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReverseLink {
    pub portal_node_id: NodeId,
}

/// A node participating in a rule or tunnel as an outbound hop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundBinding {
    pub id: BindingId,
    pub name: String,
    pub scope: BindingScope,
    pub node_id: NodeId,
    pub reverse: Option<ReverseLink>,
    pub connector: Connector,
    #[serde(default)]
    pub allocations: Vec<Allocation>,
}

impl OutboundBinding {
    pub fn table_key(&self) -> String {
        id_key(self.id)
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse.is_some()
    }

    pub fn bridge_node_id(&self) -> Option<NodeId> {
        self.reverse.as_ref().map(|_| self.node_id)
    }

    pub fn portal_node_id(&self) -> Option<NodeId> {
        self.reverse.as_ref().map(|r| r.portal_node_id)
    }
}

/// A point-to-point link between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tunnel {
    pub id: TunnelId,
    pub source_node_id: NodeId,
    pub dest_node_id: NodeId,
    /// Port of the forwarding inbound on the source node.
    pub listen_port: u16,
    pub target_address: String,
    pub target_port: u16,
    /// Balancer the forwarding inbound is routed to.
    pub balancer: String,
    /// Seed for per-connection reverse credentials.
    pub seed: String,
}

impl Tunnel {
    pub fn table_key(&self) -> String {
        id_key(self.id)
    }
}

// ── Inbounds ───────────────────────────────────────────────────────

/// A protocol template rendered on every node with the consumer list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundType {
    pub name: String,
    pub is_active: bool,
    /// Template inbounds are appended as-is, without consumers.
    #[serde(default)]
    pub is_template: bool,
    pub inbound_template: String,
    #[serde(default)]
    pub consumer_template: String,
}

/// A fixed endpoint, appended for one node or for every node when `node_id` is unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticInbound {
    pub id: u64,
    pub node_id: Option<NodeId>,
    pub template: String,
}

impl StaticInbound {
    pub fn table_key(&self) -> String {
        id_key(self.id)
    }
}

// ── Subscriptions ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub id: ProfileId,
    pub is_active: bool,
    pub proxy_uuid: String,
}

impl Profile {
    pub fn table_key(&self) -> String {
        id_key(self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub id: PlanId,
    pub connection_rule_id: RuleId,
    pub provider_key: String,
    #[serde(default)]
    pub provider_args: serde_json::Value,
}

impl Plan {
    pub fn table_key(&self) -> String {
        id_key(self.id)
    }
}

/// Windowed usage counter.
///
/// `flow_*` is the sum reported by the time-series store since
/// `flow_point_at`; `current_*` is the monotone billed total.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UsageCounter {
    pub flow_point_at: Option<u64>,
    pub flow_download_bytes: u64,
    pub flow_upload_bytes: u64,
    pub current_download_bytes: u64,
    pub current_upload_bytes: u64,
    pub last_flow_sync_at: Option<u64>,
}

/// Operation holding a claim on a period.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOp {
    Sync,
    ForwardFlowPoint,
}

/// Exclusive lease on a period's counter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claim {
    pub op: ClaimOp,
    /// Unix seconds after which the claim may be taken over.
    pub until: u64,
}

/// One billing period of a profile's subscription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionPeriod {
    pub id: PeriodId,
    pub profile_id: ProfileId,
    pub plan_id: PlanId,
    #[serde(default)]
    pub plan_args: serde_json::Value,
    pub selected_as_current: bool,
    pub first_usage_at: Option<u64>,
    pub last_usage_at: Option<u64>,
    #[serde(default)]
    pub counter: UsageCounter,
    #[serde(default)]
    pub claim: Option<Claim>,
}

impl SubscriptionPeriod {
    pub fn table_key(&self) -> String {
        id_key(self.id)
    }

    /// Whether a live claim is held at `now`.
    pub fn is_claimed(&self, now: u64) -> bool {
        self.claim.is_some_and(|c| c.until > now)
    }
}

/// Fleet-internal principal used by one node to reach a rule's outbounds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InternalUser {
    pub connection_rule_id: RuleId,
    pub node_id: NodeId,
    pub is_active: bool,
    pub proxy_uuid: String,
    pub first_usage_at: Option<u64>,
    pub last_usage_at: Option<u64>,
}

impl InternalUser {
    pub fn key_for(rule_id: RuleId, node_id: NodeId) -> String {
        format!("{}/{}", id_key(rule_id), id_key(node_id))
    }

    pub fn table_key(&self) -> String {
        Self::key_for(self.connection_rule_id, self.node_id)
    }
}

/// Widen a usage window to include `at`.
pub(crate) fn touch_window(first: &mut Option<u64>, last: &mut Option<u64>, at: u64) {
    *first = Some(first.map_or(at, |f| f.min(at)));
    *last = Some(last.map_or(at, |l| l.max(at)));
}

// ── Import / export ────────────────────────────────────────────────

/// Whole-store document used by `relay import` / `relay export`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TopologySnapshot {
    pub site: Option<SiteConfig>,
    pub nodes: Vec<Node>,
    pub programs: Vec<ProgramVersion>,
    pub rules: Vec<ConnectionRule>,
    pub balancers: Vec<Balancer>,
    pub bindings: Vec<OutboundBinding>,
    pub tunnels: Vec<Tunnel>,
    pub inbound_types: Vec<InboundType>,
    pub static_inbounds: Vec<StaticInbound>,
    pub profiles: Vec<Profile>,
    pub plans: Vec<Plan>,
    pub periods: Vec<SubscriptionPeriod>,
    pub internal_users: Vec<InternalUser>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: NodeId, arch: &str) -> Node {
        Node {
            id,
            name: format!("n{id}"),
            architecture: arch.to_string(),
            address: None,
            runtime_enabled: true,
            files: BTreeMap::new(),
        }
    }

    #[test]
    fn program_prefers_on_node_copy() {
        let program = ProgramVersion {
            name: "xray".to_string(),
            binaries: vec![ProgramBinary {
                architecture: "amd64".to_string(),
                source: "sha256:abcdef12".to_string(),
                hash: "abcdef12".to_string(),
            }],
            on_node: vec![NodeInnerProgram {
                node_id: 2,
                path: "/usr/bin/xray".to_string(),
            }],
        };

        assert!(matches!(
            program.for_node(&node(1, "amd64")),
            Some(ProgramLocation::Binary(_))
        ));
        assert_eq!(
            program.for_node(&node(2, "amd64")),
            Some(ProgramLocation::OnNode {
                path: "/usr/bin/xray".to_string()
            })
        );
        assert_eq!(program.for_node(&node(3, "arm64")), None);
    }

    #[test]
    fn scope_serializes_tagged() {
        let json = serde_json::to_string(&BindingScope::Tunnel(7)).unwrap();
        assert_eq!(json, r#"{"kind":"tunnel","id":7}"#);
    }

    #[test]
    fn touch_window_only_widens() {
        let (mut first, mut last) = (None, None);
        touch_window(&mut first, &mut last, 100);
        touch_window(&mut first, &mut last, 50);
        touch_window(&mut first, &mut last, 80);
        assert_eq!((first, last), (Some(50), Some(100)));
    }

    #[test]
    fn id_keys_sort_numerically() {
        assert!(id_key(9) < id_key(10));
    }
}
