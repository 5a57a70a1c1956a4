//! Fleet compile job — recompiles every node and writes changed artifacts.
//!
//! Each node compiles on the blocking pool; one failing node is logged and
//! does not stop the others.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use relay_core::{NodeId, epoch_secs};
use relaygrid_compiler::{CompileError, ConfigCompiler, write_artifacts};
use relaygrid_state::StateStore;

/// Outcome of one pass over the fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetSummary {
    pub written: usize,
    pub unchanged: usize,
    pub disabled: usize,
    pub failed: Vec<NodeId>,
}

pub struct FleetCompiler {
    compiler: Arc<ConfigCompiler<StateStore>>,
    output_dir: PathBuf,
}

impl FleetCompiler {
    pub fn new(compiler: ConfigCompiler<StateStore>, output_dir: PathBuf) -> Self {
        Self {
            compiler: Arc::new(compiler),
            output_dir,
        }
    }

    pub fn node_dir(output_dir: &Path, node_id: NodeId) -> PathBuf {
        output_dir.join(format!("node-{node_id}"))
    }

    /// Compile every node as of `now`.
    pub async fn compile_all(&self, now: u64) -> anyhow::Result<FleetSummary> {
        let nodes = self.compiler.repo().list_nodes()?;
        let mut summary = FleetSummary::default();
        let mut tasks = JoinSet::new();

        for node in nodes {
            if !node.runtime_enabled {
                summary.disabled += 1;
                continue;
            }
            let compiler = Arc::clone(&self.compiler);
            let dir = Self::node_dir(&self.output_dir, node.id);
            tasks.spawn_blocking(move || {
                let result = compiler
                    .compile(node.id, now)
                    .and_then(|artifacts| write_artifacts(&artifacts, &dir));
                (node.id, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (node_id, result): (NodeId, Result<bool, CompileError>) = joined?;
            match result {
                Ok(true) => summary.written += 1,
                Ok(false) => summary.unchanged += 1,
                Err(e) => {
                    warn!(node_id, error = %e, "node compile failed");
                    summary.failed.push(node_id);
                }
            }
        }
        summary.failed.sort_unstable();
        Ok(summary)
    }

    /// Recompile the fleet every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), output = %self.output_dir.display(), "fleet compiler started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.compile_all(epoch_secs()).await {
                        Ok(summary) if summary.written > 0 || !summary.failed.is_empty() => {
                            info!(
                                written = summary.written,
                                unchanged = summary.unchanged,
                                failed = summary.failed.len(),
                                "fleet compiled"
                            );
                        }
                        Ok(summary) => debug!(unchanged = summary.unchanged, "fleet unchanged"),
                        Err(e) => warn!(error = %e, "fleet compile failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("fleet compiler shutting down");
                    break;
                }
            }
        }
    }
}
