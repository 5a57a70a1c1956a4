//! ConfigCompiler — one deterministic runtime config per node.
//!
//! For a node, walks every rule and tunnel it takes part in and emits:
//! - direct outbounds and their balancer memberships
//! - reverse portals (user-routed) and reverse bridges (interconnect + catch-all)
//! - tunnel forwarding inbounds
//! - balancers with cost-based strategies
//! - inbounds carrying every live consumer
//!
//! Broken template fragments are skipped and reported, never fatal. The
//! document is serialized with sorted keys so recompiling an unchanged
//! topology is byte-identical.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use relay_core::config::CompilerConfig;
use relay_core::{FileSpec, NodeId, ProgramSource, RuleId, sha256_hex, short_hash};
use relaygrid_state::{
    Balancer, BindingScope, ConnectionRule, Node, OutboundBinding, ProgramLocation, SiteConfig,
    Tunnel,
};

use crate::error::{CompileError, CompileResult};
use crate::render::{
    ConsumerVars, INVALID_MARKER, InboundVars, NodeVars, OutboundVars, RenderEnv, RenderSite,
    RulesVars, StrategyVars, TemplateRenderer, dependent_file_names, parse_objects,
};
use crate::repository::{ProxyUser, TopologyRepository, reverse_domain, reverse_user, tunnel_user};
use crate::strategy::{self, Candidate, StrategyPlan};
use crate::tags::{ReverseSide, TagRef, balancer_tag, interconnect_tag, tunnel_inbound_tag};

/// Supervisor program name of the proxy runtime.
pub const SUPERVISOR_PROGRAM: &str = "proxy_runtime";

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Install root on the node.
    pub work_dir: String,
    /// Base URL content-addressed programs are fetched from.
    pub base_url: String,
    pub env: RenderEnv,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::from_config(&CompilerConfig::default())
    }
}

impl CompileOptions {
    pub fn from_config(config: &CompilerConfig) -> Self {
        Self {
            work_dir: config.work_dir.trim_end_matches('/').to_string(),
            base_url: config.base_url.clone(),
            env: RenderEnv::default(),
        }
    }
}

/// A fragment left out of the config.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedFragment {
    pub site: RenderSite,
    pub owner: String,
    pub reason: String,
}

/// What a compile did besides producing the document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileReport {
    pub skipped_fragments: Vec<SkippedFragment>,
    /// Rules the node takes part in that had no live consumer.
    pub skipped_rules: Vec<RuleId>,
    /// Structural rules dropped because their balancer ended up empty.
    pub dropped_rules: usize,
    pub outbounds: usize,
    pub balancers: usize,
    pub consumers: usize,
}

/// Everything a node agent needs to (re)start its runtime.
#[derive(Debug, Clone)]
pub struct NodeArtifacts {
    pub node_id: NodeId,
    pub config: Value,
    pub config_text: String,
    pub config_hash: String,
    /// Path of the runtime binary on the node.
    pub binary_path: String,
    /// Path the config is installed at on the node.
    pub config_path: String,
    pub files: Vec<FileSpec>,
    pub supervisor: String,
    /// Compiled membership of every balancer, keyed by balancer tag.
    pub balancers: BTreeMap<String, StrategyPlan>,
    pub report: CompileReport,
}

impl NodeArtifacts {
    /// Supervisor stanza without the generation timestamp line.
    pub fn supervisor_body(&self) -> &str {
        self.supervisor
            .split_once('\n')
            .map_or(self.supervisor.as_str(), |(_, rest)| rest)
    }
}

/// Compiles runtime configs from a topology repository.
pub struct ConfigCompiler<R> {
    repo: R,
    renderer: TemplateRenderer,
    options: CompileOptions,
}

impl<R: TopologyRepository> ConfigCompiler<R> {
    pub fn new(repo: R, options: CompileOptions) -> Self {
        Self {
            repo,
            renderer: TemplateRenderer::new(),
            options,
        }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    /// Compile the config of one node as of `now` (unix seconds).
    pub fn compile(&self, node_id: NodeId, now: u64) -> CompileResult<NodeArtifacts> {
        let node = self
            .repo
            .node(node_id)?
            .ok_or(CompileError::NodeNotFound(node_id))?;
        if !node.runtime_enabled {
            return Err(CompileError::RuntimeDisabled(node_id));
        }
        let site = self.repo.site()?;

        let runtime_name = site.runtime_program.clone().unwrap_or_default();
        let (binary_path, binary_file) = self
            .program_path(&node, &runtime_name)?
            .ok_or_else(|| CompileError::ProgramNotFound {
                node_id,
                program: runtime_name.clone(),
            })?;

        let mut build = NodeBuild::new(self, node, site, now);
        let bindings = self.repo.bindings()?;
        for rule in self.repo.rules()? {
            build.add_rule(&rule, &bindings)?;
        }
        for tunnel in self.repo.tunnels()? {
            build.add_tunnel(&tunnel, &bindings);
        }
        build.compile_balancers()?;
        build.prune_dangling_rules();
        let inbounds = build.render_inbounds()?;
        let document = build.assemble(inbounds);

        let config_text = serde_json::to_string_pretty(&document)?;
        let config_hash = sha256_hex(config_text.as_bytes());
        let work_dir = &self.options.work_dir;
        let config_path = format!("{work_dir}/conf/runtime_{}.json", short_hash(&config_hash));

        let mut files = Vec::new();
        files.extend(binary_file);
        let assets_dir = self.assets(&build.node, &build.site, &mut files)?;
        files.push(FileSpec::inline(config_path.clone(), config_text.clone()));
        files.extend(build.dependents.into_values());

        let supervisor = supervisor_stanza(&binary_path, &config_path, assets_dir.as_deref(), now);

        let mut report = build.report;
        report.outbounds = build.outbounds.len();
        report.balancers = build.plans.len();
        report.consumers = build.consumers.len();
        info!(
            node_id,
            hash = %short_hash(&config_hash),
            outbounds = report.outbounds,
            balancers = report.balancers,
            consumers = report.consumers,
            skipped = report.skipped_fragments.len(),
            "node config compiled"
        );

        Ok(NodeArtifacts {
            node_id,
            config: document,
            config_text,
            config_hash,
            binary_path,
            config_path,
            files,
            supervisor,
            balancers: build.plans,
            report,
        })
    }

    /// Where `program` lives on `node`, plus the file to install if it must be fetched.
    fn program_path(
        &self,
        node: &Node,
        program: &str,
    ) -> CompileResult<Option<(String, Option<FileSpec>)>> {
        if program.is_empty() {
            return Ok(None);
        }
        let Some(version) = self.repo.program(program)? else {
            return Ok(None);
        };
        match version.for_node(node) {
            None => Ok(None),
            Some(ProgramLocation::OnNode { path }) => Ok(Some((path, None))),
            Some(ProgramLocation::Binary(binary)) => match ProgramSource::parse(&binary.source) {
                Ok(ProgramSource::Local { path }) => Ok(Some((path, None))),
                Ok(source) => {
                    let dest = format!(
                        "{}/bin/{program}_{}",
                        self.options.work_dir,
                        short_hash(&binary.hash)
                    );
                    let file = source
                        .fetch_url(&self.options.base_url)
                        .map(|url| FileSpec::download(dest.clone(), url, &binary.hash));
                    Ok(Some((dest, file)))
                }
                Err(e) => {
                    warn!(node_id = node.id, program, error = %e, "unusable program source");
                    Ok(None)
                }
            },
        }
    }

    /// Resolve geo assets into one directory; returns the directory.
    fn assets(
        &self,
        node: &Node,
        site: &SiteConfig,
        files: &mut Vec<FileSpec>,
    ) -> CompileResult<Option<String>> {
        let wanted = [
            ("geosite.dat", site.geosite_program.as_deref()),
            ("geoip.dat", site.geoip_program.as_deref()),
        ];
        let mut downloads = Vec::new();
        let mut on_node = Vec::new();
        for (file_name, program) in wanted {
            let Some(program) = program else { continue };
            let location = self
                .repo
                .program(program)?
                .and_then(|version| version.for_node(node));
            match location {
                Some(ProgramLocation::Binary(binary)) => downloads.push((file_name, binary)),
                Some(ProgramLocation::OnNode { path }) => on_node.push(path),
                None => warn!(node_id = node.id, program, "geo asset not available for node"),
            }
        }

        if downloads.is_empty() {
            let dir = on_node.first().and_then(|path| {
                path.rsplit_once('/').map(|(dir, _)| dir.to_string())
            });
            return Ok(dir);
        }
        if !on_node.is_empty() {
            warn!(node_id = node.id, "on-node geo assets ignored, assets are downloaded");
        }

        let combined: String = downloads.iter().map(|(_, b)| b.hash.as_str()).collect();
        let dir = format!(
            "{}/bin/assets_{}",
            self.options.work_dir,
            short_hash(&sha256_hex(combined.as_bytes()))
        );
        for (file_name, binary) in downloads {
            let url = ProgramSource::parse(&binary.source)
                .ok()
                .and_then(|s| s.fetch_url(&self.options.base_url));
            match url {
                Some(url) => files.push(FileSpec::download(
                    format!("{dir}/{file_name}"),
                    url,
                    &binary.hash,
                )),
                None => warn!(node_id = node.id, file_name, "geo asset has no download source"),
            }
        }
        Ok(Some(dir))
    }
}

fn supervisor_stanza(binary: &str, config: &str, assets: Option<&str>, now: u64) -> String {
    let generated = i64::try_from(now)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| now.to_string());
    let mut out = format!("# config={generated}\n[program:{SUPERVISOR_PROGRAM}]\ncommand={binary} -c {config}\n");
    if let Some(assets) = assets {
        out.push_str(&format!("environment=XRAY_LOCATION_ASSET={assets}\n"));
    }
    out.push_str("autostart=true\nautorestart=true\npriority=10\n");
    out
}

/// Members collected for one balancer tag.
struct Members {
    scope: BindingScope,
    name: String,
    candidates: Vec<Candidate>,
}

/// Mutable state of one node compile.
struct NodeBuild<'c, R> {
    compiler: &'c ConfigCompiler<R>,
    node: Node,
    node_value: Value,
    site: SiteConfig,
    now: u64,
    outbounds: Vec<Value>,
    tunnel_inbounds: Vec<Value>,
    portal_rules: Vec<Value>,
    bridge_domain_rules: Vec<Value>,
    bridge_catchall_rules: Vec<Value>,
    tunnel_rules: Vec<Value>,
    template_rules: Vec<Value>,
    members: BTreeMap<String, Members>,
    balancers: Vec<Value>,
    plans: BTreeMap<String, StrategyPlan>,
    bridges: Vec<Value>,
    portals: Vec<Value>,
    /// Inbound consumers keyed by email.
    consumers: BTreeMap<String, ProxyUser>,
    /// Dependent files keyed by name.
    dependents: BTreeMap<String, FileSpec>,
    report: CompileReport,
}

impl<'c, R: TopologyRepository> NodeBuild<'c, R> {
    fn new(compiler: &'c ConfigCompiler<R>, node: Node, site: SiteConfig, now: u64) -> Self {
        let node_value = json!({
            "id": node.id,
            "name": node.name,
            "address": node.address,
            "architecture": node.architecture,
        });
        Self {
            compiler,
            node,
            node_value,
            site,
            now,
            outbounds: Vec::new(),
            tunnel_inbounds: Vec::new(),
            portal_rules: Vec::new(),
            bridge_domain_rules: Vec::new(),
            bridge_catchall_rules: Vec::new(),
            tunnel_rules: Vec::new(),
            template_rules: Vec::new(),
            members: BTreeMap::new(),
            balancers: Vec::new(),
            plans: BTreeMap::new(),
            bridges: Vec::new(),
            portals: Vec::new(),
            consumers: BTreeMap::new(),
            dependents: BTreeMap::new(),
            report: CompileReport::default(),
        }
    }

    fn env(&self) -> &'c RenderEnv {
        &self.compiler.options.env
    }

    fn involves(&self, binding: &OutboundBinding) -> bool {
        binding.node_id == self.node.id || binding.portal_node_id() == Some(self.node.id)
    }

    fn add_consumer(&mut self, user: ProxyUser) {
        self.consumers
            .insert(user.email(&self.site.user_domain), user);
    }

    fn skip(&mut self, site: RenderSite, owner: &str, reason: String) {
        warn!(node_id = self.node.id, %site, owner, %reason, "template fragment skipped");
        self.report.skipped_fragments.push(SkippedFragment {
            site,
            owner: owner.to_string(),
            reason,
        });
    }

    /// Render a fragment into JSON objects, or `None` if it had to be skipped.
    fn fragment<T: Serialize>(
        &mut self,
        site: RenderSite,
        owner: &str,
        template: &str,
        vars: &T,
    ) -> Option<Vec<Value>> {
        let rendered = match self.compiler.renderer.render(site, template, vars) {
            Ok(out) => out,
            Err(e) => {
                self.skip(site, owner, e.to_string());
                return None;
            }
        };
        if let Some(pos) = rendered.find(INVALID_MARKER) {
            let name: String = rendered[pos..]
                .chars()
                .take_while(|c| !c.is_whitespace() && *c != '"')
                .collect();
            self.skip(site, owner, format!("undefined variable ({name})"));
            return None;
        }
        let rendered = match self.substitute_dependents(&rendered) {
            Ok(out) => out,
            Err(reason) => {
                self.skip(site, owner, reason);
                return None;
            }
        };
        match parse_objects(&rendered) {
            Ok(objects) => Some(objects),
            Err(reason) => {
                self.skip(site, owner, format!("not JSON: {reason}"));
                None
            }
        }
    }

    /// Replace `*#path:name#*` placeholders with install paths, collecting the files.
    fn substitute_dependents(&mut self, rendered: &str) -> Result<String, String> {
        let mut out = rendered.to_string();
        for name in dependent_file_names(rendered) {
            let content = self
                .node
                .files
                .get(&name)
                .or_else(|| self.site.files.get(&name))
                .ok_or_else(|| format!("unknown dependent file {name:?}"))?;
            let dest = format!(
                "{}/files/{name}_{}",
                self.compiler.options.work_dir,
                short_hash(&sha256_hex(content.as_bytes()))
            );
            out = out.replace(&format!("*#path:{name}#*"), &dest);
            self.dependents
                .entry(name)
                .or_insert_with(|| FileSpec::inline(dest, content.clone()));
        }
        if out.contains("*#") {
            return Err("unsupported placeholder".to_string());
        }
        Ok(out)
    }

    fn add_member(&mut self, scope: BindingScope, balancer: &str, candidate: Candidate) -> String {
        let tag = balancer_tag(scope, balancer);
        self.members
            .entry(tag.clone())
            .or_insert_with(|| Members {
                scope,
                name: balancer.to_string(),
                candidates: Vec::new(),
            })
            .candidates
            .push(candidate);
        tag
    }

    /// Render an outbound; false when the fragment was skipped or empty.
    fn add_outbound(&mut self, binding: &OutboundBinding, tag: &str, user: Option<Value>) -> bool {
        let combo = binding
            .connector
            .combo
            .as_ref()
            .and_then(|c| serde_json::to_value(c).ok());
        let node_value = self.node_value.clone();
        let vars = OutboundVars {
            env: self.env(),
            tag,
            node: &node_value,
            user,
            combo,
        };
        let owner = format!("binding {}", binding.id);
        let Some(objects) = self.fragment(
            RenderSite::Outbound,
            &owner,
            &binding.connector.outbound_template,
            &vars,
        ) else {
            return false;
        };
        if objects.is_empty() {
            return false;
        }
        for (i, mut object) in objects.into_iter().enumerate() {
            if i == 0
                && let Some(map) = object.as_object_mut()
            {
                map.entry("tag").or_insert_with(|| Value::String(tag.to_string()));
            }
            self.outbounds.push(object);
        }
        true
    }

    /// Emit the parts of one binding that live on this node.
    fn add_binding(
        &mut self,
        binding: &OutboundBinding,
        reverse_seed: &str,
        user: Option<Value>,
        outbound_tags: &mut Vec<String>,
        balancer_tags: &mut BTreeSet<String>,
    ) {
        let scope = binding.scope;
        let domain = self.site.user_domain.clone();
        let allocations: Vec<_> = binding
            .allocations
            .iter()
            .filter(|a| a.weight > 0)
            .cloned()
            .collect();
        if allocations.is_empty() {
            debug!(binding_id = binding.id, "binding has no weighted allocation, skipped");
            return;
        }

        let Some(portal_node) = binding.portal_node_id() else {
            if binding.node_id != self.node.id {
                return;
            }
            let tag = TagRef::Outbound {
                scope,
                binding: binding.id,
            }
            .encode();
            if !self.add_outbound(binding, &tag, user) {
                return;
            }
            outbound_tags.push(tag.clone());
            for a in &allocations {
                let lb = self.add_member(scope, &a.balancer, Candidate::new(tag.clone(), a.weight));
                balancer_tags.insert(lb);
            }
            return;
        };

        for a in &allocations {
            let reverse = reverse_user(reverse_seed, binding, &a.balancer);
            let reverse_host = reverse_domain(scope, binding.id, &a.balancer, &domain);
            let lb = balancer_tag(scope, &a.balancer);

            if self.node.id == portal_node {
                let portal_tag = TagRef::Reverse {
                    scope,
                    side: ReverseSide::Portal,
                    binding: binding.id,
                    peer: binding.node_id,
                    allocation: a.balancer.clone(),
                }
                .encode();
                self.portals
                    .push(json!({ "tag": portal_tag, "domain": reverse_host }));
                self.portal_rules.push(json!({
                    "type": "field",
                    "user": [reverse.email(&domain)],
                    "outboundTag": portal_tag,
                }));
                self.add_consumer(reverse.clone());
                self.add_member(scope, &a.balancer, Candidate::new(portal_tag.clone(), a.weight));
                balancer_tags.insert(lb.clone());
                outbound_tags.push(portal_tag);
            }

            if self.node.id == binding.node_id {
                let bridge_tag = TagRef::Reverse {
                    scope,
                    side: ReverseSide::Bridge,
                    binding: binding.id,
                    peer: portal_node,
                    allocation: a.balancer.clone(),
                }
                .encode();
                let ic = interconnect_tag(&bridge_tag);
                if !self.add_outbound(binding, &ic, Some(reverse.to_value(&domain))) {
                    continue;
                }
                self.bridges
                    .push(json!({ "tag": bridge_tag, "domain": reverse_host }));
                self.bridge_domain_rules.push(json!({
                    "type": "field",
                    "inboundTag": [bridge_tag],
                    "domain": [format!("full:{reverse_host}")],
                    "outboundTag": ic,
                }));
                self.bridge_catchall_rules.push(json!({
                    "type": "field",
                    "inboundTag": [bridge_tag],
                    "balancerTag": lb,
                }));
            }
        }
    }

    fn add_rule(&mut self, rule: &ConnectionRule, bindings: &[OutboundBinding]) -> CompileResult<()> {
        let scope = BindingScope::Rule(rule.id);
        let rule_bindings: Vec<&OutboundBinding> = bindings
            .iter()
            .filter(|b| b.scope == scope && self.involves(b))
            .collect();
        if rule_bindings.is_empty() {
            return Ok(());
        }

        let consumers = self
            .compiler
            .repo
            .rule_consumers(rule.id, self.node.id, self.now)?;
        if consumers.is_empty() {
            debug!(node_id = self.node.id, rule_id = rule.id, "rule has no live consumers, skipped");
            self.report.skipped_rules.push(rule.id);
            return Ok(());
        }
        let domain = self.site.user_domain.clone();
        let mut consumer_emails: Vec<String> = consumers.iter().map(|c| c.email(&domain)).collect();
        consumer_emails.sort();
        for consumer in consumers {
            self.add_consumer(consumer);
        }

        // Every participant gets its internal user, bridge- and portal-only nodes included.
        let own = self.compiler.repo.internal_user_for(rule.id, self.node.id)?;
        let own_user = Some(ProxyUser::from_internal(&own).to_value(&domain));

        let seed = self.site.reverse_seed.clone();
        let mut outbound_tags = Vec::new();
        let mut balancer_tags = BTreeSet::new();
        for binding in rule_bindings {
            self.add_binding(
                binding,
                &seed,
                own_user.clone(),
                &mut outbound_tags,
                &mut balancer_tags,
            );
        }

        let node_value = self.node_value.clone();
        let vars = RulesVars {
            env: self.env(),
            node: &node_value,
            rule: json!({
                "id": rule.id,
                "name": rule.name,
                "origin_region": rule.origin_region,
                "destination_region": rule.destination_region,
            }),
            consumer_emails,
            outbound_tags,
            balancer_tags: balancer_tags.into_iter().collect(),
        };
        let owner = format!("rule {}", rule.id);
        if let Some(rules) = self.fragment(RenderSite::Rules, &owner, &rule.rules_template, &vars) {
            self.template_rules.extend(rules);
        }
        Ok(())
    }

    fn add_tunnel(&mut self, tunnel: &Tunnel, bindings: &[OutboundBinding]) {
        let scope = BindingScope::Tunnel(tunnel.id);
        let user = tunnel_user(tunnel);

        if self.node.id == tunnel.source_node_id {
            let inbound_tag = tunnel_inbound_tag(tunnel.id);
            self.tunnel_inbounds.push(json!({
                "tag": inbound_tag,
                "listen": "0.0.0.0",
                "port": tunnel.listen_port,
                "protocol": "dokodemo-door",
                "settings": {
                    "address": tunnel.target_address,
                    "port": tunnel.target_port,
                    "network": "tcp,udp",
                },
            }));
            self.tunnel_rules.push(json!({
                "type": "field",
                "inboundTag": [inbound_tag],
                "balancerTag": balancer_tag(scope, &tunnel.balancer),
            }));
        }
        if self.node.id == tunnel.dest_node_id {
            self.add_consumer(user.clone());
        }

        let domain = self.site.user_domain.clone();
        let mut outbound_tags = Vec::new();
        let mut balancer_tags = BTreeSet::new();
        let tunnel_bindings: Vec<&OutboundBinding> = bindings
            .iter()
            .filter(|b| b.scope == scope && self.involves(b))
            .collect();
        for binding in tunnel_bindings {
            self.add_binding(
                binding,
                &tunnel.seed,
                Some(user.to_value(&domain)),
                &mut outbound_tags,
                &mut balancer_tags,
            );
        }
    }

    fn compile_balancers(&mut self) -> CompileResult<()> {
        let members = std::mem::take(&mut self.members);
        let mut definitions: BTreeMap<BindingScope, Vec<Balancer>> = BTreeMap::new();
        for (tag, group) in members {
            let mut rng = strategy::seeded_rng(self.node.id, &tag);
            let Some(plan) = strategy::compile(&group.candidates, &mut rng) else {
                continue;
            };
            if !definitions.contains_key(&group.scope) {
                let defs = self.compiler.repo.balancers(group.scope)?;
                definitions.insert(group.scope, defs);
            }
            let definition = definitions
                .get(&group.scope)
                .and_then(|defs| defs.iter().find(|b| b.name == group.name))
                .cloned();

            let (baselines, max_rtt) = definition
                .as_ref()
                .map(|d| (d.baselines_ms.clone(), d.max_rtt_ms))
                .unwrap_or_default();
            let default = strategy::default_strategy(&plan, &baselines, max_rtt);
            let strategy = match definition.as_ref().and_then(|d| d.strategy_template.clone()) {
                Some(template) => self.render_strategy(&tag, &template, &plan, &baselines, max_rtt, default),
                None => default,
            };

            let mut balancer = Map::new();
            balancer.insert("tag".to_string(), Value::String(tag.clone()));
            balancer.insert("selector".to_string(), json!(plan.selector));
            balancer.insert("strategy".to_string(), strategy);
            if let Some(fallback) = &plan.fallback {
                balancer.insert("fallbackTag".to_string(), Value::String(fallback.clone()));
            }
            self.balancers.push(Value::Object(balancer));
            self.plans.insert(tag, plan);
        }
        Ok(())
    }

    fn render_strategy(
        &mut self,
        tag: &str,
        template: &str,
        plan: &StrategyPlan,
        baselines: &[u64],
        max_rtt: Option<u64>,
        default: Value,
    ) -> Value {
        let costs_part = plan
            .cost_entries()
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let vars = StrategyVars {
            env: self.env(),
            costs_part,
            baselines: baselines.iter().map(|ms| format!("{ms}ms")).collect(),
            max_rtt: max_rtt.map(|ms| format!("{ms}ms")),
            fallback_tag: plan.fallback.clone(),
        };
        let owner = format!("balancer {tag}");
        match self.fragment(RenderSite::Strategy, &owner, template, &vars) {
            Some(mut objects) if !objects.is_empty() => objects.swap_remove(0),
            _ => default,
        }
    }

    /// Drop structural rules that point at a balancer with no members here.
    fn prune_dangling_rules(&mut self) {
        let known: BTreeSet<String> = self.plans.keys().cloned().collect();
        let node_id = self.node.id;
        let mut dropped = 0;
        for rules in [&mut self.bridge_catchall_rules, &mut self.tunnel_rules] {
            rules.retain(|rule| match rule.get("balancerTag").and_then(Value::as_str) {
                Some(tag) if !known.contains(tag) => {
                    warn!(node_id, balancer = tag, "routing rule dropped, balancer has no members");
                    dropped += 1;
                    false
                }
                _ => true,
            });
        }
        self.report.dropped_rules += dropped;
    }

    fn render_inbounds(&mut self) -> CompileResult<Vec<Value>> {
        let repo = &self.compiler.repo;
        let inbound_types = repo.inbound_types()?;
        let static_inbounds = repo.static_inbounds()?;
        let domain = self.site.user_domain.clone();
        let node_value = self.node_value.clone();
        let consumers: Vec<Value> = self.consumers.values().map(|c| c.to_value(&domain)).collect();

        let mut inbounds = Vec::new();
        for inbound in &inbound_types {
            if !inbound.is_template && !inbound.is_active {
                continue;
            }
            let owner = format!("inbound {}", inbound.name);
            let mut parts = Vec::new();
            if !inbound.is_template {
                for user in &consumers {
                    let vars = ConsumerVars {
                        env: self.env(),
                        user: user.clone(),
                    };
                    if let Some(objects) =
                        self.fragment(RenderSite::Consumer, &owner, &inbound.consumer_template, &vars)
                    {
                        parts.extend(objects.iter().map(Value::to_string));
                    }
                }
            }
            let vars = InboundVars {
                env: self.env(),
                node: &node_value,
                inbound_tag: &inbound.name,
                consumers_part: parts.join(","),
            };
            if let Some(objects) =
                self.fragment(RenderSite::Inbound, &owner, &inbound.inbound_template, &vars)
            {
                inbounds.extend(objects);
            }
        }

        let node_id = self.node.id;
        for inbound in static_inbounds
            .iter()
            .filter(|s| s.node_id.is_none_or(|id| id == node_id))
        {
            let owner = format!("static inbound {}", inbound.id);
            let vars = NodeVars {
                env: self.env(),
                node: &node_value,
            };
            if let Some(objects) = self.fragment(RenderSite::StaticInbound, &owner, &inbound.template, &vars) {
                inbounds.extend(objects);
            }
        }

        inbounds.append(&mut self.tunnel_inbounds);
        Ok(inbounds)
    }

    /// Merge the compiled sections over the rendered base document.
    fn assemble(&mut self, inbounds: Vec<Value>) -> Value {
        let mut doc = Map::new();
        if let Some(template) = self.site.base_config_template.clone() {
            let node_value = self.node_value.clone();
            let vars = NodeVars {
                env: self.env(),
                node: &node_value,
            };
            if let Some(mut objects) = self.fragment(RenderSite::BaseConfig, "base config", &template, &vars)
                && !objects.is_empty()
                && let Value::Object(base) = objects.swap_remove(0)
            {
                doc = base;
            }
        }

        append_array(&mut doc, "inbounds", inbounds);
        append_array(&mut doc, "outbounds", std::mem::take(&mut self.outbounds));

        let mut rules = Vec::new();
        rules.append(&mut self.portal_rules);
        rules.append(&mut self.bridge_domain_rules);
        rules.append(&mut self.bridge_catchall_rules);
        rules.append(&mut self.tunnel_rules);
        rules.append(&mut self.template_rules);

        let routing = doc
            .entry("routing")
            .or_insert_with(|| Value::Object(Map::new()));
        if !routing.is_object() {
            warn!(node_id = self.node.id, "base config routing is not an object, replaced");
            *routing = Value::Object(Map::new());
        }
        if let Value::Object(routing) = routing {
            // Compiled rules take precedence over the base rules.
            let base_rules = match routing.remove("rules") {
                Some(Value::Array(existing)) => existing,
                _ => Vec::new(),
            };
            rules.extend(base_rules);
            routing.insert("rules".to_string(), Value::Array(rules));
            append_array(routing, "balancers", std::mem::take(&mut self.balancers));
        }

        if !self.bridges.is_empty() || !self.portals.is_empty() {
            let reverse = doc
                .entry("reverse")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(reverse) = reverse {
                append_array(reverse, "bridges", std::mem::take(&mut self.bridges));
                append_array(reverse, "portals", std::mem::take(&mut self.portals));
            }
        }

        // Outbound count is read back for the report.
        self.outbounds = doc
            .get("outbounds")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Value::Object(doc)
    }
}

/// Append `items` to the array at `key`, creating or replacing a non-array value.
fn append_array(map: &mut Map<String, Value>, key: &str, items: Vec<Value>) {
    match map.get_mut(key) {
        Some(Value::Array(existing)) => existing.extend(items),
        _ => {
            map.insert(key.to_string(), Value::Array(items));
        }
    }
}
