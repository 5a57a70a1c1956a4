use std::path::Path;

use relay_core::epoch_secs;
use relaygrid_compiler::tags::{self, ReverseSide, TagRef};
use relaygrid_compiler::{CompileOptions, ConfigCompiler, write_artifacts};
use relaygrid_state::BindingScope;

use super::{load_config, open_store};

pub fn compile(config_path: &Path, node_id: u64, out: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let compiler = ConfigCompiler::new(store, CompileOptions::from_config(&config.compiler));
    let artifacts = compiler.compile(node_id, epoch_secs())?;

    let Some(dir) = out else {
        println!("{}", artifacts.config_text);
        return Ok(());
    };

    let changed = write_artifacts(&artifacts, dir)?;
    let report = &artifacts.report;
    println!(
        "✓ Node {node_id}: {} ({})",
        relay_core::short_hash(&artifacts.config_hash),
        if changed { "written" } else { "unchanged" },
    );
    println!("  Output: {}", dir.display());
    println!(
        "  {} outbounds, {} balancers, {} consumers",
        report.outbounds, report.balancers, report.consumers
    );
    for skipped in &report.skipped_fragments {
        println!("  skipped {:?} {}: {}", skipped.site, skipped.owner, skipped.reason);
    }
    if !report.skipped_rules.is_empty() {
        println!("  rules without consumers: {:?}", report.skipped_rules);
    }
    Ok(())
}

pub fn decode_tag(config_path: &Path, tag: &str, node_id: Option<u64>) -> anyhow::Result<()> {
    let Some(tag_ref) = TagRef::decode(tag) else {
        anyhow::bail!("not a relay outbound tag: {tag}");
    };
    println!("{}", describe(&tag_ref));

    let Some(node_id) = node_id else {
        return Ok(());
    };
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    match tags::resolve(&store, node_id, tag)? {
        Some(resolved) => {
            println!("  role:   {}", resolved.role.as_str());
            println!("  source: node {}", resolved.source_node_id);
            if let Some(dest) = resolved.dest_node_id {
                println!("  dest:   node {dest}");
            }
        }
        None => println!("  does not resolve on node {node_id}"),
    }
    Ok(())
}

fn scope_label(scope: BindingScope) -> String {
    match scope {
        BindingScope::Rule(id) => format!("rule {id}"),
        BindingScope::Tunnel(id) => format!("tunnel {id}"),
    }
}

fn describe(tag_ref: &TagRef) -> String {
    match tag_ref {
        TagRef::Outbound { scope, binding } => {
            format!("outbound of {}, binding {binding}", scope_label(*scope))
        }
        TagRef::Reverse {
            scope,
            side,
            binding,
            peer,
            allocation,
        } => {
            let side = match side {
                ReverseSide::Bridge => "bridge",
                ReverseSide::Portal => "portal",
            };
            format!(
                "reverse {side} of {}, binding {binding}, peer node {peer}, balancer {allocation}",
                scope_label(*scope)
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_both_tag_shapes() {
        let outbound = TagRef::decode("to_7_40").unwrap();
        assert_eq!(describe(&outbound), "outbound of tunnel 7, binding 40");

        let bridge = TagRef::decode("ic-rb_1_20_1_main").unwrap();
        assert_eq!(
            describe(&bridge),
            "reverse bridge of rule 1, binding 20, peer node 1, balancer main"
        );
    }
}
