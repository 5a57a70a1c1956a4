//! StateStore — redb-backed state persistence for RelayGrid.
//!
//! Provides typed CRUD over the topology tables plus the few multi-record
//! operations that must be atomic: batch claims on subscription periods,
//! write-once internal users and the current-period switch. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Codec))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Codec))
}

/// Insert into an already-open write transaction.
fn insert_in<T: Serialize>(
    txn: &WriteTransaction,
    def: JsonTable,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = encode(value)?;
    let mut table = txn.open_table(def).map_err(map_err!(Table))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for def in ALL_TABLES {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON table access ──────────────────────────────────

    fn put<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        insert_in(&txn, def, key, value)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    fn delete(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Nodes & programs ───────────────────────────────────────────

    /// Insert or update a node.
    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        self.put(NODES, &node.table_key(), node)?;
        debug!(node_id = node.id, "node stored");
        Ok(())
    }

    pub fn get_node(&self, node_id: NodeId) -> StateResult<Option<Node>> {
        self.get(NODES, &id_key(node_id))
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.list(NODES)
    }

    /// Delete a node by ID. Returns true if it existed.
    pub fn delete_node(&self, node_id: NodeId) -> StateResult<bool> {
        self.delete(NODES, &id_key(node_id))
    }

    pub fn put_program(&self, program: &ProgramVersion) -> StateResult<()> {
        self.put(PROGRAMS, &program.name, program)
    }

    pub fn get_program(&self, name: &str) -> StateResult<Option<ProgramVersion>> {
        self.get(PROGRAMS, name)
    }

    pub fn put_site_config(&self, site: &SiteConfig) -> StateResult<()> {
        self.put(SITE, SITE_KEY, site)
    }

    /// Site settings, or defaults when none were stored.
    pub fn site_config(&self) -> StateResult<SiteConfig> {
        Ok(self.get(SITE, SITE_KEY)?.unwrap_or_default())
    }

    // ── Rules, balancers, bindings, tunnels ────────────────────────

    pub fn put_rule(&self, rule: &ConnectionRule) -> StateResult<()> {
        self.put(RULES, &rule.table_key(), rule)
    }

    pub fn get_rule(&self, rule_id: RuleId) -> StateResult<Option<ConnectionRule>> {
        self.get(RULES, &id_key(rule_id))
    }

    pub fn list_rules(&self) -> StateResult<Vec<ConnectionRule>> {
        self.list(RULES)
    }

    pub fn put_balancer(&self, balancer: &Balancer) -> StateResult<()> {
        self.put(BALANCERS, &balancer.table_key(), balancer)
    }

    pub fn list_balancers(&self) -> StateResult<Vec<Balancer>> {
        self.list(BALANCERS)
    }

    /// Balancers of one rule or tunnel (prefix scan on the scope key).
    pub fn list_balancers_for(&self, scope: BindingScope) -> StateResult<Vec<Balancer>> {
        let prefix = format!("{}/", scope.key());
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BALANCERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    pub fn put_binding(&self, binding: &OutboundBinding) -> StateResult<()> {
        self.put(BINDINGS, &binding.table_key(), binding)
    }

    pub fn get_binding(&self, binding_id: BindingId) -> StateResult<Option<OutboundBinding>> {
        self.get(BINDINGS, &id_key(binding_id))
    }

    pub fn list_bindings(&self) -> StateResult<Vec<OutboundBinding>> {
        self.list(BINDINGS)
    }

    pub fn delete_binding(&self, binding_id: BindingId) -> StateResult<bool> {
        self.delete(BINDINGS, &id_key(binding_id))
    }

    pub fn put_tunnel(&self, tunnel: &Tunnel) -> StateResult<()> {
        self.put(TUNNELS, &tunnel.table_key(), tunnel)
    }

    pub fn get_tunnel(&self, tunnel_id: TunnelId) -> StateResult<Option<Tunnel>> {
        self.get(TUNNELS, &id_key(tunnel_id))
    }

    pub fn list_tunnels(&self) -> StateResult<Vec<Tunnel>> {
        self.list(TUNNELS)
    }

    // ── Inbounds ───────────────────────────────────────────────────

    pub fn put_inbound_type(&self, inbound: &InboundType) -> StateResult<()> {
        self.put(INBOUND_TYPES, &inbound.name, inbound)
    }

    pub fn list_inbound_types(&self) -> StateResult<Vec<InboundType>> {
        self.list(INBOUND_TYPES)
    }

    pub fn put_static_inbound(&self, inbound: &StaticInbound) -> StateResult<()> {
        self.put(STATIC_INBOUNDS, &inbound.table_key(), inbound)
    }

    pub fn list_static_inbounds(&self) -> StateResult<Vec<StaticInbound>> {
        self.list(STATIC_INBOUNDS)
    }

    // ── Subscriptions ──────────────────────────────────────────────

    pub fn put_profile(&self, profile: &Profile) -> StateResult<()> {
        self.put(PROFILES, &profile.table_key(), profile)
    }

    pub fn get_profile(&self, profile_id: ProfileId) -> StateResult<Option<Profile>> {
        self.get(PROFILES, &id_key(profile_id))
    }

    pub fn list_profiles(&self) -> StateResult<Vec<Profile>> {
        self.list(PROFILES)
    }

    pub fn put_plan(&self, plan: &Plan) -> StateResult<()> {
        self.put(PLANS, &plan.table_key(), plan)
    }

    pub fn get_plan(&self, plan_id: PlanId) -> StateResult<Option<Plan>> {
        self.get(PLANS, &id_key(plan_id))
    }

    pub fn list_plans(&self) -> StateResult<Vec<Plan>> {
        self.list(PLANS)
    }

    pub fn put_period(&self, period: &SubscriptionPeriod) -> StateResult<()> {
        self.put(PERIODS, &period.table_key(), period)
    }

    pub fn get_period(&self, period_id: PeriodId) -> StateResult<Option<SubscriptionPeriod>> {
        self.get(PERIODS, &id_key(period_id))
    }

    pub fn list_periods(&self) -> StateResult<Vec<SubscriptionPeriod>> {
        self.list(PERIODS)
    }

    /// Mark a period as its profile's current one, clearing every sibling.
    pub fn set_current_period(&self, period_id: PeriodId) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PERIODS).map_err(map_err!(Table))?;
            let target: SubscriptionPeriod = match table.get(id_key(period_id).as_str()) {
                Ok(Some(guard)) => decode(guard.value())?,
                Ok(None) => return Err(StateError::PeriodNotFound(period_id)),
                Err(e) => return Err(StateError::Read(e.to_string())),
            };

            let mut changed = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let mut period: SubscriptionPeriod = decode(value.value())?;
                if period.profile_id != target.profile_id {
                    continue;
                }
                let want = period.id == period_id;
                if period.selected_as_current != want {
                    period.selected_as_current = want;
                    changed.push(period);
                }
            }
            for period in &changed {
                let bytes = encode(period)?;
                table
                    .insert(period.table_key().as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(period_id, "current period switched");
        Ok(())
    }

    /// Atomically claim up to `limit` due, unclaimed periods for `op`.
    ///
    /// Candidates are filtered by `due`, ordered by `order` then id, and
    /// stamped with a claim lasting `lease_secs`. Claims whose lease has
    /// expired are treated as free. The whole scan-and-mark runs in one
    /// write transaction, so concurrent callers never share a period.
    pub fn claim_periods<F, K>(
        &self,
        op: ClaimOp,
        now: u64,
        lease_secs: u64,
        limit: usize,
        due: F,
        order: K,
    ) -> StateResult<Vec<SubscriptionPeriod>>
    where
        F: Fn(&SubscriptionPeriod) -> bool,
        K: Fn(&SubscriptionPeriod) -> Option<u64>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut claimed = Vec::new();
        {
            let mut table = txn.open_table(PERIODS).map_err(map_err!(Table))?;
            let mut candidates = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let period: SubscriptionPeriod = decode(value.value())?;
                if !period.is_claimed(now) && due(&period) {
                    candidates.push(period);
                }
            }
            candidates.sort_by_key(|p| (order(p), p.id));
            candidates.truncate(limit);

            for mut period in candidates {
                period.claim = Some(Claim {
                    op,
                    until: now + lease_secs,
                });
                let bytes = encode(&period)?;
                table
                    .insert(period.table_key().as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                claimed.push(period);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if !claimed.is_empty() {
            debug!(?op, count = claimed.len(), "periods claimed");
        }
        Ok(claimed)
    }

    /// Write back a counter and drop `claim`.
    ///
    /// Returns false, leaving the stored period untouched, when the period no
    /// longer holds that exact claim (expired and taken over, even by the same
    /// op, or already released).
    pub fn commit_counter(
        &self,
        period_id: PeriodId,
        claim: Claim,
        counter: &UsageCounter,
    ) -> StateResult<bool> {
        let committed = self.update_claimed(period_id, claim, |period| {
            period.counter = counter.clone();
        })?;
        if !committed {
            warn!(period_id, op = ?claim.op, until = claim.until, "claim lost before commit, counter not written");
        }
        Ok(committed)
    }

    /// Drop `claim` without changing the counter.
    pub fn release_claim(&self, period_id: PeriodId, claim: Claim) -> StateResult<bool> {
        self.update_claimed(period_id, claim, |_| {})
    }

    fn update_claimed(
        &self,
        period_id: PeriodId,
        claim: Claim,
        apply: impl FnOnce(&mut SubscriptionPeriod),
    ) -> StateResult<bool> {
        let key = id_key(period_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(PERIODS).map_err(map_err!(Table))?;
            let current: Option<SubscriptionPeriod> =
                match table.get(key.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => Some(decode(guard.value())?),
                    None => None,
                };
            updated = match current {
                Some(mut period) if period.claim == Some(claim) => {
                    apply(&mut period);
                    period.claim = None;
                    let bytes = encode(&period)?;
                    table
                        .insert(key.as_str(), bytes.as_slice())
                        .map_err(map_err!(Write))?;
                    true
                }
                _ => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Widen a period's usage window after traffic was observed at `at`.
    pub fn touch_period_usage(&self, period_id: PeriodId, at: u64) -> StateResult<bool> {
        let key = id_key(period_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let found;
        {
            let mut table = txn.open_table(PERIODS).map_err(map_err!(Table))?;
            let current: Option<SubscriptionPeriod> =
                match table.get(key.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => Some(decode(guard.value())?),
                    None => None,
                };
            found = current.is_some();
            if let Some(mut period) = current {
                touch_window(&mut period.first_usage_at, &mut period.last_usage_at, at);
                let bytes = encode(&period)?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(found)
    }

    // ── Internal users ─────────────────────────────────────────────

    pub fn get_internal_user(
        &self,
        rule_id: RuleId,
        node_id: NodeId,
    ) -> StateResult<Option<InternalUser>> {
        self.get(INTERNAL_USERS, &InternalUser::key_for(rule_id, node_id))
    }

    pub fn list_internal_users(&self) -> StateResult<Vec<InternalUser>> {
        self.list(INTERNAL_USERS)
    }

    /// Return the internal user for `(rule, node)`, creating it on first use.
    ///
    /// Write-once: an existing record is returned untouched, so its secret
    /// never rotates underneath running configs.
    pub fn ensure_internal_user(
        &self,
        rule_id: RuleId,
        node_id: NodeId,
        make_uuid: impl FnOnce() -> String,
    ) -> StateResult<InternalUser> {
        let key = InternalUser::key_for(rule_id, node_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existing: Option<InternalUser> = {
            let table = txn.open_table(INTERNAL_USERS).map_err(map_err!(Table))?;
            match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            }
        };
        let user = match existing {
            Some(user) => user,
            None => {
                let user = InternalUser {
                    connection_rule_id: rule_id,
                    node_id,
                    is_active: true,
                    proxy_uuid: make_uuid(),
                    first_usage_at: None,
                    last_usage_at: None,
                };
                insert_in(&txn, INTERNAL_USERS, &key, &user)?;
                info!(rule_id, node_id, "internal user created");
                user
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(user)
    }

    pub fn put_internal_user(&self, user: &InternalUser) -> StateResult<()> {
        self.put(INTERNAL_USERS, &user.table_key(), user)
    }

    /// Widen an internal user's usage window after traffic was observed at `at`.
    pub fn touch_internal_user_usage(
        &self,
        rule_id: RuleId,
        node_id: NodeId,
        at: u64,
    ) -> StateResult<bool> {
        let Some(mut user) = self.get_internal_user(rule_id, node_id)? else {
            return Ok(false);
        };
        touch_window(&mut user.first_usage_at, &mut user.last_usage_at, at);
        self.put_internal_user(&user)?;
        Ok(true)
    }

    // ── Import / export ────────────────────────────────────────────

    /// Upsert every record of a snapshot in one transaction.
    pub fn import_snapshot(&self, snapshot: &TopologySnapshot) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        if let Some(site) = &snapshot.site {
            insert_in(&txn, SITE, SITE_KEY, site)?;
        }
        for node in &snapshot.nodes {
            insert_in(&txn, NODES, &node.table_key(), node)?;
        }
        for program in &snapshot.programs {
            insert_in(&txn, PROGRAMS, &program.name, program)?;
        }
        for rule in &snapshot.rules {
            insert_in(&txn, RULES, &rule.table_key(), rule)?;
        }
        for balancer in &snapshot.balancers {
            insert_in(&txn, BALANCERS, &balancer.table_key(), balancer)?;
        }
        for binding in &snapshot.bindings {
            insert_in(&txn, BINDINGS, &binding.table_key(), binding)?;
        }
        for tunnel in &snapshot.tunnels {
            insert_in(&txn, TUNNELS, &tunnel.table_key(), tunnel)?;
        }
        for inbound in &snapshot.inbound_types {
            insert_in(&txn, INBOUND_TYPES, &inbound.name, inbound)?;
        }
        for inbound in &snapshot.static_inbounds {
            insert_in(&txn, STATIC_INBOUNDS, &inbound.table_key(), inbound)?;
        }
        for profile in &snapshot.profiles {
            insert_in(&txn, PROFILES, &profile.table_key(), profile)?;
        }
        for plan in &snapshot.plans {
            insert_in(&txn, PLANS, &plan.table_key(), plan)?;
        }
        for period in &snapshot.periods {
            insert_in(&txn, PERIODS, &period.table_key(), period)?;
        }
        for user in &snapshot.internal_users {
            insert_in(&txn, INTERNAL_USERS, &user.table_key(), user)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(
            nodes = snapshot.nodes.len(),
            bindings = snapshot.bindings.len(),
            periods = snapshot.periods.len(),
            "topology snapshot imported"
        );
        Ok(())
    }

    pub fn export_snapshot(&self) -> StateResult<TopologySnapshot> {
        Ok(TopologySnapshot {
            site: self.get(SITE, SITE_KEY)?,
            nodes: self.list(NODES)?,
            programs: self.list(PROGRAMS)?,
            rules: self.list(RULES)?,
            balancers: self.list(BALANCERS)?,
            bindings: self.list(BINDINGS)?,
            tunnels: self.list(TUNNELS)?,
            inbound_types: self.list(INBOUND_TYPES)?,
            static_inbounds: self.list(STATIC_INBOUNDS)?,
            profiles: self.list(PROFILES)?,
            plans: self.list(PLANS)?,
            periods: self.list(PERIODS)?,
            internal_users: self.list(INTERNAL_USERS)?,
        })
    }
}
