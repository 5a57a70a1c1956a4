use std::path::Path;

use relay_core::RelayConfig;
use relaygrid_state::TopologySnapshot;

use super::{load_config, open_store};

pub fn init(config_path: &Path, root: &Path) -> anyhow::Result<()> {
    if config_path.exists() {
        anyhow::bail!("{} already exists", config_path.display());
    }
    let root = std::path::absolute(root)?;
    let config = RelayConfig::scaffold(&root);
    std::fs::write(config_path, config.to_toml_string()?)?;
    println!("✓ Generated {}", config_path.display());
    Ok(())
}

pub fn import(config_path: &Path, file: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let content = std::fs::read_to_string(file)?;
    let snapshot: TopologySnapshot = serde_json::from_str(&content)?;

    let store = open_store(&config)?;
    store.import_snapshot(&snapshot)?;
    println!(
        "✓ Imported {} nodes, {} rules, {} bindings, {} tunnels, {} periods",
        snapshot.nodes.len(),
        snapshot.rules.len(),
        snapshot.bindings.len(),
        snapshot.tunnels.len(),
        snapshot.periods.len(),
    );
    Ok(())
}

pub fn export(config_path: &Path, out: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let json = serde_json::to_string_pretty(&store.export_snapshot()?)?;
    match out {
        Some(path) => {
            std::fs::write(path, json)?;
            println!("✓ Exported {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
