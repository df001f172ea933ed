//! Queue set benchmarks
//!
//! Measures enqueue/recv cost of the sharded ingress queues, single key and
//! spread across partitions.

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::sync::Arc;
use std::time::Duration;
use stream_ingester::queue::{BackpressurePolicy, QueueItem, QueueOptions, QueueSet};

fn make_queue(partitions: usize, capacity: usize, policy: BackpressurePolicy) -> QueueSet<u64> {
    let options = QueueOptions {
        capacity,
        partition_count: partitions,
        producer_count: 1,
        flush_interval: Duration::from_secs(60),
        backpressure: policy,
    };
    QueueSet::new("bench", options, Arc::new(|_: u64| {})).unwrap()
}

fn bench_enqueue_drain(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("queue_enqueue_drain");

    for batch_size in [100, 1000, 10_000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_function(format!("single_key_{}", batch_size), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let queues = make_queue(1, batch_size, BackpressurePolicy::Block);
                    let mut reader = queues.take_reader(0).unwrap();

                    for i in 0..batch_size as u64 {
                        queues.enqueue(0, i).await.unwrap();
                    }
                    let mut drained = 0;
                    while reader.try_recv().is_some() {
                        drained += 1;
                    }
                    assert_eq!(drained, batch_size);
                })
            })
        });
    }

    group.finish();
}

fn bench_spread_keys(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("queue_spread");
    const ITEMS: u64 = 10_000;
    group.throughput(Throughput::Elements(ITEMS));

    for partitions in [1, 4, 16] {
        group.bench_function(format!("partitions_{}", partitions), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let queues = Arc::new(make_queue(partitions, 1024, BackpressurePolicy::Block));
                    let consumers: Vec<_> = (0..partitions)
                        .map(|index| {
                            let mut reader = queues.take_reader(index).unwrap();
                            tokio::spawn(async move {
                                let mut count = 0u64;
                                loop {
                                    match reader.recv().await {
                                        QueueItem::Item(_) => count += 1,
                                        QueueItem::Flush => {}
                                        QueueItem::Closed => break count,
                                    }
                                }
                            })
                        })
                        .collect();

                    for key in 0..ITEMS {
                        queues.enqueue(key, key).await.unwrap();
                    }
                    queues.close();

                    let mut total = 0;
                    for consumer in consumers {
                        total += consumer.await.unwrap();
                    }
                    assert_eq!(total, ITEMS);
                })
            })
        });
    }

    group.finish();
}

fn bench_drop_oldest_overflow(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("queue_overflow");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("drop_oldest_capacity_64", |b| {
        let queues = make_queue(1, 64, BackpressurePolicy::DropOldest);
        let _reader = queues.take_reader(0).unwrap();

        b.iter(|| {
            rt.block_on(async {
                for i in 0..10_000u64 {
                    queues.enqueue(0, i).await.unwrap();
                }
            })
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_drain,
    bench_spread_keys,
    bench_drop_oldest_overflow
);
criterion_main!(benches);
