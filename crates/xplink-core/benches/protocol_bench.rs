//! Criterion benchmarks for the wire-facing protocol layer.
//!
//! The receiver loop decodes every pushed frame and routes it through the
//! catalog and subscription ledger, so decode + routing cost bounds the
//! update rate the client can absorb. Catalog loading runs once per
//! (re)connect but covers tens of thousands of rows.
//!
//! Run with:
//! ```bash
//! cargo bench --package xplink-core --bench protocol_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use xplink_core::protocol::subscriptions::SubscriptionLedger;
use xplink_core::protocol::{parse_beacon, Catalog, DatarefSubscription};
use xplink_core::{StreamReply, StreamRequest};

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn beacon_packet() -> Vec<u8> {
    let mut buf = b"BECN\0".to_vec();
    buf.push(1);
    buf.push(2);
    buf.extend_from_slice(&1i32.to_le_bytes());
    buf.extend_from_slice(&121103i32.to_le_bytes());
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&8086u16.to_le_bytes());
    buf.extend_from_slice(b"bench-host\0");
    buf
}

fn catalog_page(rows: usize) -> String {
    let data: Vec<serde_json::Value> = (0..rows)
        .map(|i| {
            json!({
                "id": i as u64 + 1,
                "name": format!("sim/bench/dataref_{i}"),
                "value_type": if i % 5 == 0 { "float_array" } else { "float" },
                "is_writable": i % 2 == 0,
            })
        })
        .collect();
    json!({ "data": data }).to_string()
}

fn update_frame(entries: usize) -> String {
    let data: serde_json::Map<String, serde_json::Value> = (0..entries)
        .map(|i| ((i as u64 + 1).to_string(), json!(i as f64 * 0.5)))
        .collect();
    json!({ "type": "dataref_update_values", "data": data }).to_string()
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

fn bench_parse_beacon(c: &mut Criterion) {
    let packet = beacon_packet();
    c.bench_function("parse_beacon", |b| {
        b.iter(|| parse_beacon(black_box(&packet)).expect("beacon must parse"))
    });
}

/// Benchmarks outbound request serialization for typical shapes.
fn bench_serialize_requests(c: &mut Criterion) {
    let subscribe = StreamRequest::subscribe_datarefs(
        1,
        (1..=32u64).map(DatarefSubscription::whole).collect(),
    );
    let subscribe_indexed = StreamRequest::subscribe_datarefs(
        2,
        vec![DatarefSubscription::elements(7, (0..16).collect())],
    );
    let activate = StreamRequest::activate_command(3, 301, true, Some(0.0));

    let requests: &[(&str, &StreamRequest)] = &[
        ("subscribe_32_whole", &subscribe),
        ("subscribe_16_indices", &subscribe_indexed),
        ("command_activate", &activate),
    ];

    let mut group = c.benchmark_group("serialize_request");
    for (name, request) in requests {
        group.bench_with_input(BenchmarkId::new("req", name), request, |b, request| {
            b.iter(|| serde_json::to_string(black_box(request)).expect("serialize"))
        });
    }
    group.finish();
}

/// Benchmarks inbound frame decoding at increasing update sizes.
fn bench_decode_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_update_frame");
    for entries in [1usize, 16, 128] {
        let frame = update_frame(entries);
        group.bench_with_input(
            BenchmarkId::from_parameter(entries),
            &frame,
            |b, frame| {
                b.iter(|| {
                    serde_json::from_str::<StreamReply>(black_box(frame))
                        .expect("frame must decode")
                })
            },
        );
    }
    group.finish();
}

/// Benchmarks catalog loading at realistic sizes. A live simulator
/// reports on the order of tens of thousands of datarefs.
fn bench_catalog_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("catalog_load");
    group.sample_size(20);
    for rows in [1_000usize, 10_000] {
        let page = catalog_page(rows);
        group.bench_with_input(BenchmarkId::from_parameter(rows), &page, |b, page| {
            b.iter(|| {
                let mut catalog = Catalog::new();
                catalog.load_datarefs(black_box(page)).expect("page must load")
            })
        });
    }
    group.finish();
}

/// Benchmarks the ledger's subscribe/align hot path.
fn bench_ledger(c: &mut Criterion) {
    let entries: Vec<(u64, Option<usize>)> =
        (0..8usize).map(|i| (7u64, Some(i))).collect();

    let mut group = c.benchmark_group("subscription_ledger");
    group.bench_function("subscribe_8_elements", |b| {
        b.iter(|| {
            let mut ledger = SubscriptionLedger::new();
            ledger.subscribe(black_box(&entries))
        })
    });

    let mut ledger = SubscriptionLedger::new();
    ledger.subscribe(&entries);
    group.bench_function("align", |b| {
        b.iter(|| ledger.align(black_box(7), black_box(8)).expect("aligned"))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_parse_beacon,
    bench_serialize_requests,
    bench_decode_updates,
    bench_catalog_load,
    bench_ledger
);
criterion_main!(benches);
