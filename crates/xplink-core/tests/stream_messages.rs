//! Integration tests for the streaming protocol layer.
//!
//! These tests drive the metadata catalog, subscription ledger, request
//! correlation, and JSON envelope together through the public API, the
//! way the client's receiver loop uses them: resolve paths to remote ids,
//! put subscriptions on the wire, then route inbound frames back onto
//! registry variables.

use std::collections::HashMap;

use serde_json::json;
use xplink_core::protocol::subscriptions::{split_indexed_path, SubscriptionLedger};
use xplink_core::protocol::{parse_beacon, Catalog, RequestCounter, RequestLog};
use xplink_core::{DataType, StreamReply, StreamRequest, Value, VariableRegistry};

const DATAREF_PAGE: &str = r#"{"data": [
    {"id": 1, "name": "sim/cockpit/autopilot/altitude", "value_type": "float", "is_writable": true},
    {"id": 3, "name": "sim/flightmodel/engine/ENGN_thro", "value_type": "float_array", "is_writable": true},
    {"id": 5, "name": "sim/time/zulu_time_sec", "value_type": "double"}
]}"#;

const COMMAND_PAGE: &str = r#"{"data": [
    {"id": 301, "name": "sim/autopilot/heading_up", "description": "Nudge heading bug up"}
]}"#;

fn loaded_catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog
        .load_datarefs(DATAREF_PAGE)
        .expect("dataref page must load");
    catalog
        .load_commands(COMMAND_PAGE)
        .expect("command page must load");
    catalog
}

/// Resolves deck-style paths (`name` or `name[i]`) into ledger entries,
/// the way the client does before subscribing a collection.
fn resolve(catalog: &Catalog, paths: &[&str]) -> Vec<(u64, Option<usize>)> {
    paths
        .iter()
        .map(|path| {
            let (name, index) = split_indexed_path(path);
            let meta = catalog.dataref_by_name(name).expect("path must be known");
            (meta.id, index)
        })
        .collect()
}

/// Routes one inbound `dataref_update_values` frame onto registry
/// variables, mirroring the receiver loop's decode path.
fn apply_update(
    catalog: &Catalog,
    ledger: &SubscriptionLedger,
    registry: &VariableRegistry,
    data: &HashMap<u64, serde_json::Value>,
) {
    for (&id, value) in data {
        let Some(meta) = catalog.dataref_by_id(id) else {
            continue;
        };
        match value.as_array() {
            Some(values) => {
                let Ok(indices) = ledger.align(id, values.len()) else {
                    continue;
                };
                for (idx, raw) in indices.iter().zip(values) {
                    let name = format!("{}[{idx}]", meta.name);
                    let variable = registry
                        .get_or_create(&name, DataType::Float)
                        .expect("element variable");
                    variable.update_value(raw.as_f64().map(Value::Float), true);
                }
            }
            None => {
                let variable = registry
                    .get_or_create(&meta.name, meta.value_type.data_type())
                    .expect("scalar variable");
                variable.update_value(value.as_f64().map(Value::Float), true);
            }
        }
    }
}

#[test]
fn test_subscribe_request_carries_coalesced_indices() {
    let catalog = loaded_catalog();
    let mut ledger = SubscriptionLedger::new();
    let counter = RequestCounter::new();

    let entries = resolve(
        &catalog,
        &[
            "sim/cockpit/autopilot/altitude",
            "sim/flightmodel/engine/ENGN_thro[1]",
            "sim/flightmodel/engine/ENGN_thro[0]",
        ],
    );
    let wire = ledger.subscribe(&entries);
    let request = StreamRequest::subscribe_datarefs(counter.next(), wire);

    assert_eq!(
        serde_json::to_value(&request).expect("serialize"),
        json!({
            "type": "dataref_subscribe_values",
            "req_id": 1,
            "params": {"datarefs": [{"id": 1}, {"id": 3, "index": [0, 1]}]}
        })
    );
}

#[test]
fn test_result_frame_resolves_the_pending_request() {
    let counter = RequestCounter::new();
    let log = RequestLog::new();

    let request = StreamRequest::subscribe_commands(counter.next(), [301]);
    log.record(request.req_id(), request.type_name());
    assert!(log.contains(1));

    let reply: StreamReply = serde_json::from_value(json!({
        "type": "result",
        "req_id": 1,
        "success": false,
        "error_message": "command not found"
    }))
    .expect("result frame must parse");
    let StreamReply::Result {
        req_id: Some(req_id),
        success,
        error_message,
        ..
    } = reply
    else {
        panic!("expected a result frame");
    };
    log.resolve(req_id, success, error_message.as_deref());
    assert!(log.is_empty());
}

#[test]
fn test_scalar_update_reaches_the_registry_variable() {
    let catalog = loaded_catalog();
    let mut ledger = SubscriptionLedger::new();
    let registry = VariableRegistry::new();

    let entries = resolve(&catalog, &["sim/cockpit/autopilot/altitude"]);
    ledger.subscribe(&entries);

    let reply: StreamReply = serde_json::from_value(json!({
        "type": "dataref_update_values",
        "data": {"1": 8000.0}
    }))
    .expect("update frame must parse");
    let StreamReply::DatarefUpdateValues { data } = reply else {
        panic!("expected a dataref update");
    };
    apply_update(&catalog, &ledger, &registry, &data);

    let variable = registry
        .get("sim/cockpit/autopilot/altitude")
        .expect("variable must exist after the update");
    assert_eq!(variable.value(), Some(Value::Float(8000.0)));
    assert_eq!(variable.changed_count(), 1);
}

#[test]
fn test_array_update_maps_values_to_subscribed_indices() {
    let catalog = loaded_catalog();
    let mut ledger = SubscriptionLedger::new();
    let registry = VariableRegistry::new();

    // Subscribed out of order; the wire set is sorted.
    let entries = resolve(
        &catalog,
        &[
            "sim/flightmodel/engine/ENGN_thro[7]",
            "sim/flightmodel/engine/ENGN_thro[1]",
            "sim/flightmodel/engine/ENGN_thro[5]",
        ],
    );
    ledger.subscribe(&entries);

    let data: HashMap<u64, serde_json::Value> =
        HashMap::from([(3, json!([10.0, 20.0, 30.0]))]);
    apply_update(&catalog, &ledger, &registry, &data);

    let value_of = |path: &str| registry.value_of(path).expect("element variable");
    assert_eq!(
        value_of("sim/flightmodel/engine/ENGN_thro[1]"),
        Value::Float(10.0)
    );
    assert_eq!(
        value_of("sim/flightmodel/engine/ENGN_thro[5]"),
        Value::Float(20.0)
    );
    assert_eq!(
        value_of("sim/flightmodel/engine/ENGN_thro[7]"),
        Value::Float(30.0)
    );
}

#[test]
fn test_update_raced_by_resubscription_uses_previous_indices() {
    let catalog = loaded_catalog();
    let mut ledger = SubscriptionLedger::new();
    let registry = VariableRegistry::new();

    ledger.subscribe(&resolve(
        &catalog,
        &[
            "sim/flightmodel/engine/ENGN_thro[0]",
            "sim/flightmodel/engine/ENGN_thro[1]",
        ],
    ));
    // The index set grows, but a frame shaped for the old set is already
    // in flight.
    ledger.subscribe(&resolve(&catalog, &["sim/flightmodel/engine/ENGN_thro[3]"]));

    let data: HashMap<u64, serde_json::Value> = HashMap::from([(3, json!([0.55, 0.56]))]);
    apply_update(&catalog, &ledger, &registry, &data);

    assert_eq!(
        registry.value_of("sim/flightmodel/engine/ENGN_thro[0]"),
        Some(Value::Float(0.55))
    );
    assert_eq!(
        registry.value_of("sim/flightmodel/engine/ENGN_thro[1]"),
        Some(Value::Float(0.56))
    );
    assert_eq!(
        registry.value_of("sim/flightmodel/engine/ENGN_thro[3]"),
        None,
        "the in-flight frame predates this element"
    );
}

#[test]
fn test_unreconcilable_array_update_is_dropped() {
    let catalog = loaded_catalog();
    let mut ledger = SubscriptionLedger::new();
    let registry = VariableRegistry::new();

    ledger.subscribe(&resolve(
        &catalog,
        &[
            "sim/flightmodel/engine/ENGN_thro[0]",
            "sim/flightmodel/engine/ENGN_thro[1]",
        ],
    ));

    let data: HashMap<u64, serde_json::Value> =
        HashMap::from([(3, json!([1.0, 2.0, 3.0, 4.0, 5.0]))]);
    apply_update(&catalog, &ledger, &registry, &data);

    assert_eq!(registry.len(), 0, "no variable may be written from a frame that fits no index generation");
}

#[test]
fn test_command_activity_frame_maps_ids_to_names() {
    let catalog = loaded_catalog();

    let reply: StreamReply = serde_json::from_value(json!({
        "type": "command_update_is_active",
        "data": {"301": true, "999": false}
    }))
    .expect("command frame must parse");
    let StreamReply::CommandUpdateIsActive { data } = reply else {
        panic!("expected a command update");
    };

    let named: Vec<(String, bool)> = data
        .iter()
        .filter_map(|(&id, &active)| {
            catalog.command_by_id(id).map(|meta| (meta.name.clone(), active))
        })
        .collect();
    assert_eq!(
        named,
        vec![("sim/autopilot/heading_up".to_string(), true)],
        "ids missing from the catalog are skipped"
    );
}

#[test]
fn test_discovery_hands_over_to_the_catalog() {
    // The beacon announces the web API port; everything after that is
    // HTTP + WebSocket against it.
    let mut packet = b"BECN\0".to_vec();
    packet.extend_from_slice(&[1u8, 2u8]);
    packet.extend_from_slice(&1i32.to_le_bytes());
    packet.extend_from_slice(&121103i32.to_le_bytes());
    packet.extend_from_slice(&1u32.to_le_bytes());
    packet.extend_from_slice(&8086u16.to_le_bytes());
    packet.extend_from_slice(b"hangar-pc\0");

    let beacon = parse_beacon(&packet).expect("beacon must parse");
    assert!(beacon.version_supported());
    assert_eq!(beacon.port, 8086);

    let catalog = loaded_catalog();
    assert_eq!(catalog.dataref_count(), 3);
    assert_eq!(catalog.command_count(), 1);
}
