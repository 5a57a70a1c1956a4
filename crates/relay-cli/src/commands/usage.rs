use std::path::Path;

use relay_core::epoch_secs;
use relaygrid_accounting::{BatchReport, TrafficIngestor, UsageAccountant};
use relaygrid_metrics::InfluxClient;

use super::{load_config, open_store};

pub async fn sync(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let accountant = UsageAccountant::new(
        open_store(&config)?,
        InfluxClient::new(&config.timeseries),
        config.accounting.clone(),
    );
    let report = accountant.sync(epoch_secs()).await?;
    print_report("sync", &report);
    Ok(())
}

pub async fn forward(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let accountant = UsageAccountant::new(
        open_store(&config)?,
        InfluxClient::new(&config.timeseries),
        config.accounting.clone(),
    );
    let report = accountant.forward_flow_point(epoch_secs()).await?;
    print_report("forward", &report);
    Ok(())
}

pub async fn ingest(config_path: &Path, node_id: u64, file: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let text = std::fs::read_to_string(file)?;
    let ingestor = TrafficIngestor::new(open_store(&config)?, InfluxClient::new(&config.timeseries));
    let summary = ingestor.ingest_lines(node_id, &text).await?;
    println!(
        "✓ {} reports, {} points, {} periods, {} internal users",
        summary.reports, summary.points, summary.periods_touched, summary.internal_users_touched
    );
    if summary.unmatched > 0 || summary.bad_lines > 0 {
        println!("  {} unmatched stats, {} bad lines", summary.unmatched, summary.bad_lines);
    }
    Ok(())
}

fn print_report(job: &str, report: &BatchReport) {
    println!(
        "✓ {job}: {} claimed, {} updated, {} skipped, {} lost",
        report.claimed, report.updated, report.skipped, report.lost
    );
    for anomaly in &report.anomalies {
        println!("  {anomaly:?}");
    }
}
