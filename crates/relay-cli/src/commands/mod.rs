pub mod compile;
pub mod health;
pub mod topology;
pub mod usage;

use std::path::Path;

use relay_core::RelayConfig;
use relaygrid_state::StateStore;

/// Load relay.toml, falling back to defaults when it is absent.
pub fn load_config(path: &Path) -> anyhow::Result<RelayConfig> {
    if path.exists() {
        RelayConfig::from_file(path)
    } else {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        Ok(RelayConfig::default())
    }
}

pub fn open_store(config: &RelayConfig) -> anyhow::Result<StateStore> {
    let store = StateStore::open(&config.store.path)?;
    tracing::debug!(path = %config.store.path.display(), "state store opened");
    Ok(store)
}
