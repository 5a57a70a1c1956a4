//! Read access to the topology and proxy user derivation.
//!
//! The compiler never writes topology. The one exception is the write-once
//! internal user a node needs to reach its rule's next hop, created the
//! first time a compile references it.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use relaygrid_state::{
    Balancer, BindingId, BindingScope, ConnectionRule, InboundType, InternalUser, Node, NodeId,
    OutboundBinding, PeriodId, ProfileId, ProgramVersion, RuleId, SiteConfig, StateResult,
    StateStore, StaticInbound, Tunnel, TunnelId, is_connectable,
};

/// A runtime auth principal. Its email is both the routing key and the
/// telemetry key the accountant bills against.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProxyUser {
    Period {
        period_id: PeriodId,
        profile_id: ProfileId,
        uuid: String,
    },
    Internal {
        rule_id: RuleId,
        node_id: NodeId,
        uuid: String,
    },
    Reverse {
        scope: BindingScope,
        binding_id: BindingId,
        allocation: String,
        uuid: String,
    },
    Tunnel {
        tunnel_id: TunnelId,
        uuid: String,
    },
}

impl ProxyUser {
    pub fn email(&self, domain: &str) -> String {
        match self {
            ProxyUser::Period {
                period_id,
                profile_id,
                ..
            } => format!("period{period_id}.profile{profile_id}@{domain}"),
            ProxyUser::Internal {
                rule_id, node_id, ..
            } => format!("rule{rule_id}.node{node_id}@{domain}"),
            ProxyUser::Reverse {
                scope: BindingScope::Rule(_),
                binding_id,
                allocation,
                ..
            } => format!("reverse{binding_id}.{allocation}@{domain}"),
            ProxyUser::Reverse {
                scope: BindingScope::Tunnel(_),
                binding_id,
                allocation,
                ..
            } => format!("treverse{binding_id}.{allocation}@{domain}"),
            ProxyUser::Tunnel { tunnel_id, .. } => format!("tunnel{tunnel_id}@{domain}"),
        }
    }

    pub fn uuid(&self) -> &str {
        match self {
            ProxyUser::Period { uuid, .. }
            | ProxyUser::Internal { uuid, .. }
            | ProxyUser::Reverse { uuid, .. }
            | ProxyUser::Tunnel { uuid, .. } => uuid,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProxyUser::Period { .. } => "period",
            ProxyUser::Internal { .. } => "internal",
            ProxyUser::Reverse { .. } => "reverse",
            ProxyUser::Tunnel { .. } => "tunnel",
        }
    }

    /// Template view: `{ email, uuid, kind }`.
    pub fn to_value(&self, domain: &str) -> Value {
        json!({
            "email": self.email(domain),
            "uuid": self.uuid(),
            "kind": self.kind(),
        })
    }

    pub fn from_internal(user: &InternalUser) -> Self {
        ProxyUser::Internal {
            rule_id: user.connection_rule_id,
            node_id: user.node_id,
            uuid: user.proxy_uuid.clone(),
        }
    }
}

/// Deterministic UUID-formatted secret from a seed and identifying parts.
pub fn derive_uuid(seed: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    for part in parts {
        hasher.update(b":");
        hasher.update(part.as_bytes());
    }
    let mut b: [u8; 16] = [0; 16];
    b.copy_from_slice(&hasher.finalize()[..16]);
    // Version 4 / RFC 4122 variant bits, so runtimes accept it as a UUID.
    b[6] = (b[6] & 0x0f) | 0x40;
    b[8] = (b[8] & 0x3f) | 0x80;
    let h = hex::encode(b);
    format!("{}-{}-{}-{}-{}", &h[0..8], &h[8..12], &h[12..16], &h[16..20], &h[20..32])
}

/// Credential of one reverse link (binding + allocation).
pub fn reverse_user(seed: &str, binding: &OutboundBinding, allocation: &str) -> ProxyUser {
    let id = binding.id.to_string();
    ProxyUser::Reverse {
        scope: binding.scope,
        binding_id: binding.id,
        allocation: allocation.to_string(),
        uuid: derive_uuid(seed, &["reverse", &id, allocation]),
    }
}

/// Credential a tunnel's source uses to reach its destination.
pub fn tunnel_user(tunnel: &Tunnel) -> ProxyUser {
    ProxyUser::Tunnel {
        tunnel_id: tunnel.id,
        uuid: derive_uuid(&tunnel.seed, &["tunnel", &tunnel.id.to_string()]),
    }
}

/// Domain shared by both halves of a reverse link.
pub fn reverse_domain(scope: BindingScope, binding_id: BindingId, allocation: &str, user_domain: &str) -> String {
    let digest = hex::encode(Sha256::digest(
        format!("{}/{binding_id}/{allocation}", scope.key()).as_bytes(),
    ));
    format!("{}.reverse.{user_domain}", &digest[..12])
}

/// Read-only view of the topology used by the compiler and the tag resolver.
pub trait TopologyRepository {
    fn site(&self) -> StateResult<SiteConfig>;
    fn node(&self, node_id: NodeId) -> StateResult<Option<Node>>;
    fn program(&self, name: &str) -> StateResult<Option<ProgramVersion>>;
    fn rules(&self) -> StateResult<Vec<ConnectionRule>>;
    fn balancers(&self, scope: BindingScope) -> StateResult<Vec<Balancer>>;
    fn bindings(&self) -> StateResult<Vec<OutboundBinding>>;
    fn binding(&self, binding_id: BindingId) -> StateResult<Option<OutboundBinding>>;
    fn tunnels(&self) -> StateResult<Vec<Tunnel>>;
    fn inbound_types(&self) -> StateResult<Vec<InboundType>>;
    fn static_inbounds(&self) -> StateResult<Vec<StaticInbound>>;

    /// Live principals of a rule: connectable periods whose plan targets
    /// the rule, then active internal users of other nodes.
    fn rule_consumers(
        &self,
        rule_id: RuleId,
        exclude_node: NodeId,
        now: u64,
    ) -> StateResult<Vec<ProxyUser>>;

    /// The node's own internal user for a rule, created on first use.
    fn internal_user_for(&self, rule_id: RuleId, node_id: NodeId) -> StateResult<InternalUser>;
}

impl TopologyRepository for StateStore {
    fn site(&self) -> StateResult<SiteConfig> {
        self.site_config()
    }

    fn node(&self, node_id: NodeId) -> StateResult<Option<Node>> {
        self.get_node(node_id)
    }

    fn program(&self, name: &str) -> StateResult<Option<ProgramVersion>> {
        self.get_program(name)
    }

    fn rules(&self) -> StateResult<Vec<ConnectionRule>> {
        self.list_rules()
    }

    fn balancers(&self, scope: BindingScope) -> StateResult<Vec<Balancer>> {
        self.list_balancers_for(scope)
    }

    fn bindings(&self) -> StateResult<Vec<OutboundBinding>> {
        self.list_bindings()
    }

    fn binding(&self, binding_id: BindingId) -> StateResult<Option<OutboundBinding>> {
        self.get_binding(binding_id)
    }

    fn tunnels(&self) -> StateResult<Vec<Tunnel>> {
        self.list_tunnels()
    }

    fn inbound_types(&self) -> StateResult<Vec<InboundType>> {
        self.list_inbound_types()
    }

    fn static_inbounds(&self) -> StateResult<Vec<StaticInbound>> {
        self.list_static_inbounds()
    }

    fn rule_consumers(
        &self,
        rule_id: RuleId,
        exclude_node: NodeId,
        now: u64,
    ) -> StateResult<Vec<ProxyUser>> {
        let plans: Vec<_> = self
            .list_plans()?
            .into_iter()
            .filter(|p| p.connection_rule_id == rule_id)
            .collect();
        let mut users = Vec::new();
        if !plans.is_empty() {
            for period in self.list_periods()? {
                let Some(plan) = plans.iter().find(|p| p.id == period.plan_id) else {
                    continue;
                };
                let Some(profile) = self.get_profile(period.profile_id)? else {
                    continue;
                };
                if is_connectable(&period, &profile, plan, now) {
                    users.push(ProxyUser::Period {
                        period_id: period.id,
                        profile_id: profile.id,
                        uuid: profile.proxy_uuid.clone(),
                    });
                }
            }
        }
        for user in self.list_internal_users()? {
            if user.connection_rule_id == rule_id && user.is_active && user.node_id != exclude_node {
                users.push(ProxyUser::from_internal(&user));
            }
        }
        Ok(users)
    }

    fn internal_user_for(&self, rule_id: RuleId, node_id: NodeId) -> StateResult<InternalUser> {
        let seed = self.site_config()?.reverse_seed;
        self.ensure_internal_user(rule_id, node_id, || {
            derive_uuid(&seed, &["internal", &rule_id.to_string(), &node_id.to_string()])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygrid_state::{Plan, Profile, SubscriptionPeriod, UsageCounter};

    fn limits() -> Value {
        json!({ "total_usage_limit_bytes": 1000, "expiry_seconds": 3600 })
    }

    fn seed_subscriptions(store: &StateStore) {
        store
            .put_plan(&Plan {
                id: 1,
                connection_rule_id: 10,
                provider_key: "type_simple_strict1".to_string(),
                provider_args: limits(),
            })
            .unwrap();
        store
            .put_plan(&Plan {
                id: 2,
                connection_rule_id: 20,
                provider_key: "type_simple_strict1".to_string(),
                provider_args: limits(),
            })
            .unwrap();
        for (id, plan_id, current) in [(1, 1, true), (2, 1, false), (3, 2, true)] {
            store
                .put_profile(&Profile {
                    id,
                    is_active: true,
                    proxy_uuid: format!("uuid-{id}"),
                })
                .unwrap();
            store
                .put_period(&SubscriptionPeriod {
                    id,
                    profile_id: id,
                    plan_id,
                    plan_args: Value::Null,
                    selected_as_current: current,
                    first_usage_at: None,
                    last_usage_at: None,
                    counter: UsageCounter::default(),
                    claim: None,
                })
                .unwrap();
        }
    }

    #[test]
    fn derived_uuid_is_stable_and_well_formed() {
        let a = derive_uuid("seed", &["reverse", "1", "main"]);
        let b = derive_uuid("seed", &["reverse", "1", "main"]);
        let c = derive_uuid("other", &["reverse", "1", "main"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 36);
        assert_eq!(&a[14..15], "4");
    }

    #[test]
    fn emails_identify_principals() {
        let period = ProxyUser::Period {
            period_id: 5,
            profile_id: 9,
            uuid: "u".to_string(),
        };
        assert_eq!(period.email("x.io"), "period5.profile9@x.io");
        let internal = ProxyUser::Internal {
            rule_id: 1,
            node_id: 2,
            uuid: "u".to_string(),
        };
        assert_eq!(internal.email("x.io"), "rule1.node2@x.io");
        assert_eq!(internal.to_value("x.io")["kind"], "internal");
    }

    #[test]
    fn rule_consumers_filter_by_rule_and_connectability() {
        let store = StateStore::open_in_memory().unwrap();
        seed_subscriptions(&store);

        let users = store.rule_consumers(10, 1, 1000).unwrap();
        assert_eq!(users.len(), 1, "only the current period of rule 10");
        assert_eq!(users[0].email("d"), "period1.profile1@d");
    }

    #[test]
    fn rule_consumers_exclude_compiling_node() {
        let store = StateStore::open_in_memory().unwrap();
        store.internal_user_for(10, 1).unwrap();
        store.internal_user_for(10, 2).unwrap();

        let users = store.rule_consumers(10, 1, 1000).unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].email("d"), "rule10.node2@d");
    }

    #[test]
    fn reverse_domain_is_shared_and_hostname_safe() {
        let d = reverse_domain(BindingScope::Rule(1), 2, "main_backup", "relay.example");
        assert_eq!(d, reverse_domain(BindingScope::Rule(1), 2, "main_backup", "relay.example"));
        assert!(d.ends_with(".reverse.relay.example"));
        assert!(!d.contains('_'));
    }
}
