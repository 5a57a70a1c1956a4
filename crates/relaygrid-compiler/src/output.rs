//! Writing compiled artifacts to a local directory.
//!
//! Layout per node:
//!
//! ```text
//! {dir}/config.json      runtime document
//! {dir}/supervisor.conf  supervisor stanza
//! {dir}/files.json       files the node agent installs
//! ```

use std::path::Path;

use tracing::debug;

use relay_core::sha256_hex;

use crate::compiler::NodeArtifacts;
use crate::error::CompileResult;

pub const CONFIG_FILE: &str = "config.json";
pub const SUPERVISOR_FILE: &str = "supervisor.conf";
pub const FILES_FILE: &str = "files.json";

/// Write the artifacts into `dir`, creating it if needed.
///
/// Returns `false` without touching anything when `dir` already holds the
/// same config, the same supervisor stanza (ignoring its timestamp line) and
/// the same file list, so an unchanged node does not churn the timestamp.
pub fn write_artifacts(artifacts: &NodeArtifacts, dir: &Path) -> CompileResult<bool> {
    let config_file = dir.join(CONFIG_FILE);
    let files_json = serde_json::to_string_pretty(&artifacts.files)?;
    if is_current(artifacts, &files_json, dir) {
        debug!(node_id = artifacts.node_id, dir = %dir.display(), "artifacts unchanged");
        return Ok(false);
    }

    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(SUPERVISOR_FILE), &artifacts.supervisor)?;
    std::fs::write(dir.join(FILES_FILE), files_json)?;
    // Config last: its hash marks the directory as complete.
    std::fs::write(&config_file, &artifacts.config_text)?;
    Ok(true)
}

fn is_current(artifacts: &NodeArtifacts, files_json: &str, dir: &Path) -> bool {
    let Ok(config) = std::fs::read(dir.join(CONFIG_FILE)) else {
        return false;
    };
    if sha256_hex(&config) != artifacts.config_hash {
        return false;
    }
    let supervisor = std::fs::read_to_string(dir.join(SUPERVISOR_FILE)).unwrap_or_default();
    let supervisor_body = supervisor
        .split_once('\n')
        .map_or(supervisor.as_str(), |(_, rest)| rest);
    supervisor_body == artifacts.supervisor_body()
        && std::fs::read_to_string(dir.join(FILES_FILE)).is_ok_and(|f| f == files_json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileOptions, ConfigCompiler};
    use relaygrid_state::{Node, ProgramVersion, SiteConfig, StateStore};
    use std::collections::BTreeMap;

    fn compiler() -> ConfigCompiler<StateStore> {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_site_config(&SiteConfig {
                runtime_program: Some("xray".to_string()),
                ..SiteConfig::default()
            })
            .unwrap();
        store
            .put_program(&ProgramVersion {
                name: "xray".to_string(),
                binaries: vec![],
                on_node: vec![relaygrid_state::NodeInnerProgram {
                    node_id: 1,
                    path: "/usr/local/bin/xray".to_string(),
                }],
            })
            .unwrap();
        store
            .put_node(&Node {
                id: 1,
                name: "edge-1".to_string(),
                architecture: "amd64".to_string(),
                address: None,
                runtime_enabled: true,
                files: BTreeMap::new(),
            })
            .unwrap();
        ConfigCompiler::new(store, CompileOptions::default())
    }

    #[test]
    fn writes_once_per_config_hash() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("node-1");
        let compiler = compiler();

        let first = compiler.compile(1, 100).unwrap();
        assert!(write_artifacts(&first, &out).unwrap());
        let written = std::fs::read_to_string(out.join(CONFIG_FILE)).unwrap();
        assert_eq!(written, first.config_text);
        let files: Vec<relay_core::FileSpec> =
            serde_json::from_str(&std::fs::read_to_string(out.join(FILES_FILE)).unwrap()).unwrap();
        assert_eq!(files, first.files);

        let supervisor = std::fs::read_to_string(out.join(SUPERVISOR_FILE)).unwrap();
        let second = compiler.compile(1, 200).unwrap();
        assert!(!write_artifacts(&second, &out).unwrap());
        assert_eq!(std::fs::read_to_string(out.join(SUPERVISOR_FILE)).unwrap(), supervisor);
    }

    #[test]
    fn runtime_upgrade_rewrites_supervisor_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("node-1");
        let compiler = compiler();
        let xray = |hash: &str| ProgramVersion {
            name: "xray".to_string(),
            binaries: vec![relaygrid_state::ProgramBinary {
                architecture: "amd64".to_string(),
                source: format!("sha256:{hash}"),
                hash: hash.to_string(),
            }],
            on_node: vec![],
        };

        compiler.repo().put_program(&xray("aaaaaaaaaaaa")).unwrap();
        let old = compiler.compile(1, 100).unwrap();
        assert!(write_artifacts(&old, &out).unwrap());

        compiler.repo().put_program(&xray("bbbbbbbbbbbb")).unwrap();
        let new = compiler.compile(1, 200).unwrap();
        assert_eq!(new.config_hash, old.config_hash);
        assert!(write_artifacts(&new, &out).unwrap());

        let supervisor = std::fs::read_to_string(out.join(SUPERVISOR_FILE)).unwrap();
        assert!(supervisor.contains("/opt/relaygrid/bin/xray_bbbbbb"));
        let files = std::fs::read_to_string(out.join(FILES_FILE)).unwrap();
        assert!(files.contains("bbbbbbbbbbbb"));
        assert!(!files.contains("aaaaaaaaaaaa"));
    }
}
