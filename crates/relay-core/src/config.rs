//! relay.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub store: StoreConfig,
    pub compiler: CompilerConfig,
    pub accounting: AccountingConfig,
    pub timeseries: TimeSeriesConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("relaygrid.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Root directory on the node where binaries and configs are installed.
    pub work_dir: String,
    /// Base URL programs are downloaded from (`{base_url}/programs/{hash}`).
    pub base_url: String,
    /// Local directory `relayd` writes per-node artifacts into.
    pub output_dir: PathBuf,
    /// Interval between fleet compiles, in seconds. Zero disables the job.
    pub interval_secs: u64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            work_dir: "/opt/relaygrid".to_string(),
            base_url: "http://127.0.0.1:8080".to_string(),
            output_dir: PathBuf::from("artifacts"),
            interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    /// Maximum periods claimed per run.
    pub batch_size: usize,
    /// Window used when a period has no flow point yet.
    pub regulate_seconds: u64,
    /// How far behind `now` the flow point is allowed to trail.
    pub flow_point_retention_seconds: u64,
    /// Minimum gap between last usage and last sync before a period is due.
    pub min_activity_gap_secs: u64,
    /// Lifetime of a claim on a period.
    pub claim_lease_secs: u64,
    /// Multiplier applied to deltas folded into the current counters.
    pub correction_factor: f64,
    pub sync_interval_secs: u64,
    pub forward_interval_secs: u64,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            regulate_seconds: 3600,
            flow_point_retention_seconds: 5 * 24 * 3600,
            min_activity_gap_secs: 60,
            claim_lease_secs: 120,
            correction_factor: 1.0,
            sync_interval_secs: 60,
            forward_interval_secs: 3600,
        }
    }
}

impl AccountingConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn forward_interval(&self) -> Duration {
        Duration::from_secs(self.forward_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSeriesConfig {
    /// `host:port` of the InfluxDB v2 HTTP endpoint.
    pub address: String,
    pub org: String,
    pub bucket: String,
    pub token: Option<String>,
    pub query_timeout_secs: u64,
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8086".to_string(),
            org: "relaygrid".to_string(),
            bucket: "relaygrid".to_string(),
            token: None,
            query_timeout_secs: 10,
        }
    }
}

impl TimeSeriesConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive dead observations before a link is reported down.
    pub dead_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { dead_threshold: 3 }
    }
}

impl RelayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a relay.toml pointing the store and artifacts at `root`.
    pub fn scaffold(root: &Path) -> Self {
        RelayConfig {
            store: StoreConfig {
                path: root.join("relaygrid.redb"),
            },
            compiler: CompilerConfig {
                output_dir: root.join("artifacts"),
                ..CompilerConfig::default()
            },
            ..RelayConfig::default()
        }
    }
}
