//! Probe log lines correlated against a stored topology.

use relaygrid_health::TelemetryCorrelator;
use relaygrid_health::tracker::LinkStatus;
use relaygrid_metrics::{FieldValue, InMemorySeries};
use relaygrid_state::{
    Allocation, BindingScope, Connector, OutboundBinding, ReverseLink, StateStore, Tunnel,
};

const AT: u64 = 1_700_000_000;

fn binding(id: u64, scope: BindingScope, node_id: u64, portal: Option<u64>) -> OutboundBinding {
    OutboundBinding {
        id,
        name: format!("b{id}"),
        scope,
        node_id,
        reverse: portal.map(|portal_node_id| ReverseLink { portal_node_id }),
        connector: Connector {
            outbound_template: String::new(),
            inbound_type: None,
            dest_node_id: Some(3),
            combo: None,
        },
        allocations: vec![Allocation {
            balancer: "main".to_string(),
            weight: 1,
        }],
    }
}

fn topology() -> StateStore {
    let store = StateStore::open_in_memory().unwrap();
    store.put_binding(&binding(10, BindingScope::Rule(1), 1, None)).unwrap();
    store.put_binding(&binding(20, BindingScope::Rule(1), 2, Some(1))).unwrap();
    store
        .put_tunnel(&Tunnel {
            id: 7,
            source_node_id: 1,
            dest_node_id: 3,
            listen_port: 2222,
            target_address: "127.0.0.1".to_string(),
            target_port: 22,
            balancer: "main".to_string(),
            seed: "s".to_string(),
        })
        .unwrap();
    store.put_binding(&binding(40, BindingScope::Tunnel(7), 1, None)).unwrap();
    store
}

#[test]
fn alive_direct_outbound_becomes_a_health_point() {
    let mut correlator = TelemetryCorrelator::new(topology(), 3);
    let points = correlator
        .correlate_lines(1, "[Info] outbound [ro_1_10] is alive, delay 50ms\n[Info] unrelated", AT)
        .unwrap();
    assert_eq!(points.len(), 1);

    let point = &points[0];
    assert_eq!(point.measurement, "connection_health");
    assert_eq!(point.timestamp, AT);
    assert_eq!(point.tags["connection_name"], "ro_1_10");
    assert_eq!(point.tags["connection_type"], "node_outbound");
    assert_eq!(point.tags["source_node_id"], "1");
    assert_eq!(point.tags["dest_node_id"], "3");
    assert_eq!(point.tags["binding_id"], "10");
    assert_eq!(point.tags["connection_rule_id"], "1");
    assert_eq!(point.fields["delay"], FieldValue::Float(50.0));
    assert_eq!(point.fields["link_up"], FieldValue::Bool(true));
}

#[test]
fn interconnect_goes_down_after_threshold() {
    let mut correlator = TelemetryCorrelator::new(topology(), 3);
    let line = "[Warning] outbound [ic-rb_1_20_1_main] is dead: i/o timeout\n";
    let points = correlator.correlate_lines(2, &line.repeat(3), AT).unwrap();
    assert_eq!(points.len(), 3);

    let ups: Vec<_> = points.iter().map(|p| p.fields["link_up"].clone()).collect();
    assert_eq!(
        ups,
        vec![
            FieldValue::Bool(true),
            FieldValue::Bool(true),
            FieldValue::Bool(false)
        ]
    );
    let last = &points[2];
    assert_eq!(last.tags["connection_type"], "reverse_interconn");
    assert_eq!(last.tags["source_node_id"], "2");
    assert_eq!(last.tags["dest_node_id"], "1");
    assert_eq!(last.fields["reason"], FieldValue::Str("i/o timeout".to_string()));
    assert_eq!(
        correlator.tracker(2, "ic-rb_1_20_1_main").map(|t| t.status()),
        Some(LinkStatus::Down)
    );
}

#[test]
fn portal_side_and_tunnel_roles() {
    let mut correlator = TelemetryCorrelator::new(topology(), 3);
    let portal = correlator
        .correlate_lines(1, "outbound [rp_1_20_2_main] is alive 12ms", AT)
        .unwrap();
    assert_eq!(portal[0].tags["connection_type"], "reverse");
    assert_eq!(portal[0].tags["dest_node_id"], "2");

    let tunnel = correlator
        .correlate_lines(1, "outbound [to_7_40] is alive 8ms", AT)
        .unwrap();
    assert_eq!(tunnel[0].tags["connection_type"], "tunnel_outbound");
    assert_eq!(tunnel[0].tags["tunnel_id"], "7");
    assert!(!tunnel[0].tags.contains_key("connection_rule_id"));
}

#[test]
fn unresolved_tags_produce_nothing() {
    let mut correlator = TelemetryCorrelator::new(topology(), 3);
    let text = "outbound [direct] is alive 1ms\noutbound [ro_1_10] is alive 1ms\noutbound [ro_1_99] is dead: gone";
    // Node 2 does not own ro_1_10; ro_1_99 does not exist.
    assert!(correlator.correlate_lines(2, text, AT).unwrap().is_empty());
}

#[tokio::test]
async fn ingest_writes_points() {
    let series = InMemorySeries::new();
    let mut correlator = TelemetryCorrelator::new(topology(), 3);
    let written = correlator
        .ingest(&series, 1, "2023/11/14 22:13:20 outbound [ro_1_10] is alive 5ms", 0)
        .await
        .unwrap();
    assert_eq!(written, 1);
    assert_eq!(series.points()[0].timestamp, AT);
}
