//! Windowed usage accounting against the real state store and an in-memory
//! time series.

use std::time::Duration;

use serde_json::Value;

use relay_core::config::AccountingConfig;
use relaygrid_accounting::{
    AccountingError, TrafficIngestor, TrafficReport, UsageAccountant, UsageAnomaly,
};
use relaygrid_accounting::ingest::TrafficStat;
use relaygrid_metrics::{InMemorySeries, Point};
use relaygrid_state::{ClaimOp, StateStore, SubscriptionPeriod, UsageCounter};

const NOW: u64 = 1_700_000_000;

fn config() -> AccountingConfig {
    AccountingConfig {
        batch_size: 10,
        regulate_seconds: 3600,
        flow_point_retention_seconds: 86_400,
        min_activity_gap_secs: 60,
        claim_lease_secs: 120,
        correction_factor: 1.0,
        ..AccountingConfig::default()
    }
}

fn period(id: u64, counter: UsageCounter, last_usage_at: Option<u64>) -> SubscriptionPeriod {
    SubscriptionPeriod {
        id,
        profile_id: id,
        plan_id: 1,
        plan_args: Value::Null,
        selected_as_current: true,
        first_usage_at: last_usage_at,
        last_usage_at,
        counter,
        claim: None,
    }
}

fn usage(period_id: u64, at: u64, dl: i64, up: i64) -> Point {
    Point::new("xray_usage", at)
        .tag("usage_type", "user")
        .tag("period_id", period_id)
        .field("dl_bytes", dl)
        .field("up_bytes", up)
}

fn counter(floor: u64, flow: (u64, u64), current: (u64, u64), synced: Option<u64>) -> UsageCounter {
    UsageCounter {
        flow_point_at: Some(floor),
        flow_download_bytes: flow.0,
        flow_upload_bytes: flow.1,
        current_download_bytes: current.0,
        current_upload_bytes: current.1,
        last_flow_sync_at: synced,
    }
}

// ── Sync ───────────────────────────────────────────────────────────

#[tokio::test]
async fn sync_folds_window_growth_into_current() {
    let store = StateStore::open_in_memory().unwrap();
    let series = InMemorySeries::new();
    let floor = NOW - 7_200;
    store
        .put_period(&period(1, counter(floor, (100, 50), (1_000, 500), Some(NOW - 1_000)), Some(NOW - 10)))
        .unwrap();
    series.push(usage(1, floor + 10, 100, 50));
    series.push(usage(1, NOW - 30, 40, 20));
    // Another period's traffic in the same window.
    series.push(usage(2, NOW - 30, 999, 999));

    let accountant = UsageAccountant::new(store.clone(), series, config());
    let report = accountant.sync(NOW).await.unwrap();
    assert_eq!((report.claimed, report.updated), (1, 1));
    assert!(report.anomalies.is_empty());

    let synced = store.get_period(1).unwrap().unwrap();
    assert_eq!(
        (synced.counter.flow_download_bytes, synced.counter.flow_upload_bytes),
        (140, 70)
    );
    assert_eq!(
        (synced.counter.current_download_bytes, synced.counter.current_upload_bytes),
        (1_040, 520)
    );
    assert_eq!(synced.counter.last_flow_sync_at, Some(NOW));
    assert!(synced.claim.is_none());

    // Nothing new since the sync: not due any more.
    let again = accountant.sync(NOW + 30).await.unwrap();
    assert_eq!(again.claimed, 0);
}

#[tokio::test]
async fn first_sync_defaults_the_floor_to_the_regulation_window() {
    let store = StateStore::open_in_memory().unwrap();
    let series = InMemorySeries::new();
    store
        .put_period(&period(1, UsageCounter::default(), Some(NOW - 100)))
        .unwrap();
    // Older than the regulation window, never counted.
    series.push(usage(1, NOW - 4_000, 1_000, 1_000));
    series.push(usage(1, NOW - 100, 10, 5));

    let accountant = UsageAccountant::new(store.clone(), series, config());
    accountant.sync(NOW).await.unwrap();

    let synced = store.get_period(1).unwrap().unwrap();
    assert_eq!(synced.counter.flow_point_at, Some(NOW - 3_600));
    assert_eq!(
        (synced.counter.current_download_bytes, synced.counter.current_upload_bytes),
        (10, 5)
    );
}

#[tokio::test]
async fn regressed_window_is_reported_and_current_never_drops() {
    let store = StateStore::open_in_memory().unwrap();
    let series = InMemorySeries::new();
    let floor = NOW - 7_200;
    store
        .put_period(&period(1, counter(floor, (100, 50), (1_000, 500), Some(NOW - 1_000)), Some(NOW - 10)))
        .unwrap();
    series.push(usage(1, NOW - 30, 80, 60));

    let accountant = UsageAccountant::new(store.clone(), series, config());
    let report = accountant.sync(NOW).await.unwrap();
    assert_eq!(
        report.anomalies,
        vec![UsageAnomaly::CounterRegressed {
            period_id: 1,
            download: 20,
            upload: 0
        }]
    );

    let synced = store.get_period(1).unwrap().unwrap();
    assert_eq!(
        (synced.counter.current_download_bytes, synced.counter.current_upload_bytes),
        (1_000, 510)
    );
    assert_eq!(synced.counter.flow_download_bytes, 80);
}

#[tokio::test]
async fn batches_are_bounded_and_never_synced_go_first() {
    let store = StateStore::open_in_memory().unwrap();
    let series = InMemorySeries::new();
    store
        .put_period(&period(1, counter(NOW - 100, (0, 0), (0, 0), Some(NOW - 900)), Some(NOW - 10)))
        .unwrap();
    store
        .put_period(&period(2, counter(NOW - 100, (0, 0), (0, 0), Some(NOW - 500)), Some(NOW - 10)))
        .unwrap();
    store
        .put_period(&period(3, UsageCounter::default(), Some(NOW - 10)))
        .unwrap();
    for id in 1..=3 {
        series.push(usage(id, NOW - 50, 1, 1));
    }

    let accountant = UsageAccountant::new(
        store.clone(),
        series,
        AccountingConfig {
            batch_size: 2,
            ..config()
        },
    );
    let report = accountant.sync(NOW).await.unwrap();
    assert_eq!(report.claimed, 2);

    let synced: Vec<u64> = store
        .list_periods()
        .unwrap()
        .into_iter()
        .filter(|p| p.counter.last_flow_sync_at == Some(NOW))
        .map(|p| p.id)
        .collect();
    assert_eq!(synced, vec![1, 3]);
}

#[tokio::test]
async fn claimed_periods_are_not_processed_twice() {
    let store = StateStore::open_in_memory().unwrap();
    let series = InMemorySeries::new();
    store
        .put_period(&period(1, UsageCounter::default(), Some(NOW - 10)))
        .unwrap();
    series.push(usage(1, NOW - 50, 5, 5));

    // Another worker holds the period.
    let held = store
        .claim_periods(ClaimOp::ForwardFlowPoint, NOW, 120, 10, |_| true, |p| Some(p.id))
        .unwrap();
    assert_eq!(held.len(), 1);

    let accountant = UsageAccountant::new(store.clone(), series, config());
    assert_eq!(accountant.sync(NOW).await.unwrap().claimed, 0);
    // The lease expires and the period becomes claimable again.
    assert_eq!(accountant.sync(NOW + 121).await.unwrap().claimed, 1);
}

#[tokio::test]
async fn stale_sync_holder_cannot_overwrite_newer_sync() {
    let store = StateStore::open_in_memory().unwrap();
    let series = InMemorySeries::new();
    store
        .put_period(&period(1, UsageCounter::default(), Some(NOW - 10)))
        .unwrap();
    series.push(usage(1, NOW - 50, 5, 5));

    let stale = store
        .claim_periods(ClaimOp::Sync, NOW, 120, 10, |_| true, |p| Some(p.id))
        .unwrap()[0]
        .claim
        .unwrap();

    // The lease runs out and a second sync takes the period over.
    let accountant = UsageAccountant::new(store.clone(), series, config());
    let report = accountant.sync(NOW + 121).await.unwrap();
    assert_eq!((report.claimed, report.updated, report.lost), (1, 1, 0));
    let written = store.get_period(1).unwrap().unwrap().counter;
    assert_eq!(written.current_download_bytes, 5);

    // The first holder wakes up with an outdated counter.
    assert!(!store.commit_counter(1, stale, &UsageCounter::default()).unwrap());
    assert_eq!(store.get_period(1).unwrap().unwrap().counter, written);
}

#[tokio::test]
async fn query_timeout_releases_claim_and_leaves_state_untouched() {
    let store = StateStore::open_in_memory().unwrap();
    let series = InMemorySeries::new().with_latency(Duration::from_millis(200), Duration::from_millis(10));
    let before = period(1, counter(NOW - 7_200, (100, 50), (1_000, 500), Some(NOW - 1_000)), Some(NOW - 10));
    store.put_period(&before).unwrap();
    series.push(usage(1, NOW - 30, 140, 70));

    let accountant = UsageAccountant::new(store.clone(), series, config());
    let err = accountant.sync(NOW).await.unwrap_err();
    assert!(matches!(err, AccountingError::ExternalQueryTimeout(_)));
    assert!(err.is_retryable());

    let after = store.get_period(1).unwrap().unwrap();
    assert_eq!(after, before);
}

// ── Forward flow point ─────────────────────────────────────────────

#[tokio::test]
async fn forward_subtracts_usage_leaving_the_window() {
    let store = StateStore::open_in_memory().unwrap();
    let series = InMemorySeries::new();
    let new_floor = NOW - 86_400;
    let floor = new_floor - 3_600;
    store
        .put_period(&period(1, counter(floor, (140, 70), (1_000, 500), Some(NOW - 10)), Some(NOW - 20)))
        .unwrap();
    series.push(usage(1, floor + 60, 40, 20));
    series.push(usage(1, new_floor + 60, 100, 50));

    let accountant = UsageAccountant::new(store.clone(), series, config());
    let report = accountant.forward_flow_point(NOW).await.unwrap();
    assert_eq!(report.updated, 1);
    assert!(report.anomalies.is_empty());

    let forwarded = store.get_period(1).unwrap().unwrap();
    assert_eq!(forwarded.counter.flow_point_at, Some(new_floor));
    assert_eq!(
        (forwarded.counter.flow_download_bytes, forwarded.counter.flow_upload_bytes),
        (100, 50)
    );
    assert_eq!(
        (forwarded.counter.current_download_bytes, forwarded.counter.current_upload_bytes),
        (1_000, 500)
    );
}

#[tokio::test]
async fn forward_overshoot_is_an_anomaly_folded_into_current() {
    let store = StateStore::open_in_memory().unwrap();
    let series = InMemorySeries::new();
    let new_floor = NOW - 86_400;
    let floor = new_floor - 3_600;
    store
        .put_period(&period(1, counter(floor, (140, 70), (1_000, 500), Some(NOW - 10)), Some(NOW - 20)))
        .unwrap();
    series.push(usage(1, floor + 60, 150, 70));

    let accountant = UsageAccountant::new(store.clone(), series, config());
    let report = accountant.forward_flow_point(NOW).await.unwrap();
    assert_eq!(
        report.anomalies,
        vec![UsageAnomaly::NegativeDelta {
            period_id: 1,
            download: 10,
            upload: 0
        }]
    );

    let forwarded = store.get_period(1).unwrap().unwrap();
    assert_eq!(
        (forwarded.counter.flow_download_bytes, forwarded.counter.flow_upload_bytes),
        (0, 0)
    );
    assert_eq!(forwarded.counter.current_download_bytes, 1_010);
    assert_eq!(forwarded.counter.current_upload_bytes, 500);
}

#[tokio::test]
async fn forward_moves_the_floor_even_without_data() {
    let store = StateStore::open_in_memory().unwrap();
    let new_floor = NOW - 86_400;
    store
        .put_period(&period(1, counter(new_floor - 10, (5, 5), (5, 5), None), None))
        .unwrap();
    // Already at the floor: not due.
    store
        .put_period(&period(2, counter(new_floor, (5, 5), (5, 5), None), None))
        .unwrap();

    let accountant = UsageAccountant::new(store.clone(), InMemorySeries::new(), config());
    let report = accountant.forward_flow_point(NOW).await.unwrap();
    assert_eq!(report.claimed, 1);
    let forwarded = store.get_period(1).unwrap().unwrap();
    assert_eq!(forwarded.counter.flow_point_at, Some(new_floor));
    assert_eq!(forwarded.counter.flow_download_bytes, 5);
}

// ── Ingest to sync ─────────────────────────────────────────────────

#[tokio::test]
async fn ingested_traffic_makes_a_period_due_and_is_counted() {
    let store = StateStore::open_in_memory().unwrap();
    let series = InMemorySeries::new();
    store
        .put_period(&period(1, UsageCounter::default(), None))
        .unwrap();

    let ingestor = TrafficIngestor::new(store.clone(), series.clone());
    let report = TrafficReport {
        collected_at: NOW - 300,
        stats: vec![
            TrafficStat {
                name: "user>>>period1.profile1@relay.test>>>traffic>>>downlink".to_string(),
                value: 4_096,
            },
            TrafficStat {
                name: "user>>>period1.profile1@relay.test>>>traffic>>>uplink".to_string(),
                value: 1_024,
            },
        ],
    };
    let summary = ingestor.ingest(4, &report).await.unwrap();
    assert_eq!((summary.points, summary.periods_touched), (1, 1));
    assert_eq!(store.get_period(1).unwrap().unwrap().last_usage_at, Some(NOW - 300));

    let accountant = UsageAccountant::new(store.clone(), series, config());
    accountant.sync(NOW).await.unwrap();
    let synced = store.get_period(1).unwrap().unwrap();
    assert_eq!(
        (synced.counter.current_download_bytes, synced.counter.current_upload_bytes),
        (4_096, 1_024)
    );
}

#[tokio::test]
async fn ingest_lines_skips_malformed_output() {
    let store = StateStore::open_in_memory().unwrap();
    let series = InMemorySeries::new();
    let ingestor = TrafficIngestor::new(store, series.clone());
    let text = concat!(
        "{\"result_type\":\"xray_raw_traffic_v1\",\"timestamp\":\"2023-11-14T22:13:20Z\",",
        "\"msg\":\"{\\\"stats\\\":[{\\\"name\\\":\\\"outbound>>>ro_1_10>>>traffic>>>downlink\\\",\\\"value\\\":9}]}\"}\n",
        "{\"result_type\":\"xray_raw_tr\n",
        "\n",
    );
    let summary = ingestor.ingest_lines(2, text).await.unwrap();
    assert_eq!((summary.reports, summary.points, summary.bad_lines), (1, 1, 1));
    assert_eq!(series.points()[0].tags["outbound_tag"], "ro_1_10");
}
