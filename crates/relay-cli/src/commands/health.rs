use std::path::Path;

use relay_core::epoch_secs;
use relaygrid_health::TelemetryCorrelator;
use relaygrid_metrics::InfluxClient;

use super::{load_config, open_store};

pub async fn ingest(config_path: &Path, node_id: u64, file: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let text = std::fs::read_to_string(file)?;
    let mut correlator = TelemetryCorrelator::new(open_store(&config)?, config.health.dead_threshold);
    let written = correlator
        .ingest(&InfluxClient::new(&config.timeseries), node_id, &text, epoch_secs())
        .await?;
    println!("✓ {written} health points written");
    Ok(())
}
