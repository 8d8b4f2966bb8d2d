//! Performance benchmarks for channels and stores.

use capped_pubsub::{
    BoundedCollection, ChannelOptions, CollectionOptions, Connection, FileStore, RecordInput,
    StoreAdapter,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn options() -> ChannelOptions {
    ChannelOptions::default()
        .with_retry_interval(Duration::from_millis(10))
        .with_max_count(10_000)
}

/// Raw insert throughput into a bounded collection at varying caps.
fn bench_bounded_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("bounded_insert");

    for max_count in [100u64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("max_count", max_count), &max_count, |b, &max| {
            let collection = BoundedCollection::new(
                "bench",
                CollectionOptions {
                    capacity_bytes: 64 * 1024 * 1024,
                    max_count: Some(max),
                },
            );
            let mut i = 0u64;
            b.iter(|| {
                i += 1;
                black_box(collection.insert(RecordInput::message("e", json!(i))).unwrap());
            });
        });
    }

    group.finish();
}

/// Publish through a channel and wait for the subscriber to see each record.
fn bench_publish_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_roundtrip");

    for subscribers in [1usize, 4, 16] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &count| {
                let conn = Connection::memory();
                let channel = conn.channel_with("bench", options()).unwrap();
                channel.wait_ready(Duration::from_secs(5)).unwrap();
                for _ in 1..count {
                    channel.subscribe("e", |p| {
                        black_box(p);
                    });
                }
                let queue = channel.subscribe_channel("e", 1024);

                b.iter(|| {
                    channel.publish("e", json!({"n": 1})).unwrap();
                    black_box(queue.recv_timeout(Duration::from_secs(5)).unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Durable vs buffered publishes against the file store.
fn bench_file_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_publish");

    for durable in [false, true] {
        group.bench_with_input(BenchmarkId::new("durable", durable), &durable, |b, &durable| {
            let dir = TempDir::new().unwrap();
            let store: Arc<dyn StoreAdapter> =
                Arc::new(FileStore::open_or_create(dir.path().join("store")).unwrap());
            let conn = Connection::new(store);
            let channel = conn
                .channel_with("bench", options().with_durable_publish(durable))
                .unwrap();

            b.iter(|| {
                black_box(channel.publish("e", json!("payload")).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_bounded_insert,
    bench_publish_roundtrip,
    bench_file_publish
);
criterion_main!(benches);
