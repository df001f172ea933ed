//! Admission and decode benchmarks
//!
//! Measures the per-record hot path of a decoder worker: frame decoding and
//! the throttle decision.

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use prost::Message;
use std::time::{Duration, Instant};
use stream_ingester::MessageType;
use stream_ingester::decoder::{decode_frames, encode_frames};
use stream_ingester::proto;
use stream_ingester::throttle::Throttler;

fn flow_log(i: u64) -> Vec<u8> {
    proto::FlowLog {
        device_id: (i % 64) as u32,
        flow_id: i,
        ip_src: vec![10, 0, 0, 1],
        ip_dst: vec![10, 0, 0, 2],
        port_src: 40000,
        port_dst: 443,
        protocol: 6,
        byte_tx: 1500 * i,
        ..Default::default()
    }
    .encode_to_vec()
}

fn bench_admit(c: &mut Criterion) {
    let mut group = c.benchmark_group("throttle_admit");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("unlimited", |b| {
        let mut throttler = Throttler::new(MessageType::TaggedFlow, 0, 0, Duration::from_secs(1));
        b.iter(|| {
            let now = Instant::now();
            (0..10_000).filter(|_| throttler.admit(now)).count()
        })
    });

    group.bench_function("quota_1000_mostly_dropping", |b| {
        let mut throttler =
            Throttler::new(MessageType::TaggedFlow, 0, 1000, Duration::from_secs(3600));
        b.iter(|| {
            let now = Instant::now();
            (0..10_000).filter(|_| throttler.admit(now)).count()
        })
    });

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_frames");

    for frames in [1, 16, 256] {
        let bodies: Vec<Vec<u8>> = (0..frames as u64).map(flow_log).collect();
        let payload = encode_frames(bodies.iter().map(Vec::as_slice));

        group.throughput(Throughput::Elements(frames as u64));
        group.bench_function(format!("flow_logs_{}", frames), |b| {
            b.iter(|| {
                let decoded = decode_frames(MessageType::TaggedFlow, &payload);
                assert_eq!(decoded.records.len(), frames);
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_admit, bench_decode);
criterion_main!(benches);
