//! Throughput Benchmark for Strata
//!
//! Measures the wire codec, command execution over the in-memory store,
//! and reclaim passes.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::sync::Arc;
use strata::commands::CommandHandler;
use strata::protocol::{Decoder, Encoder, Frame};
use strata::reclaim::{Reclaimer, WorkKind};
use strata::store::{unix_now, Database, MemoryStore, Object, ObjectId, ObjectType};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn command_bytes(parts: &[&[u8]]) -> Vec<u8> {
    Frame::array(parts.iter().map(|p| Frame::bulk_string(Bytes::copy_from_slice(p))).collect()).serialize()
}

/// Benchmark frame encoding
fn bench_encode(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));

    let value = vec![b'x'; 1024];
    group.bench_function("bulk_string_1k", |b| {
        b.iter(|| {
            let mut encoder = Encoder::new(Vec::with_capacity(2048));
            encoder.bulk_string(&value);
            rt.block_on(encoder.flush()).unwrap();
            black_box(encoder.into_inner());
        });
    });

    let reply = Frame::array((0..100).map(|i| Frame::bulk_string(format!("field:{}", i))).collect());
    group.bench_function("array_100", |b| {
        b.iter(|| {
            let mut encoder = Encoder::new(Vec::with_capacity(4096));
            encoder.frame(&reply);
            rt.block_on(encoder.flush()).unwrap();
            black_box(encoder.into_inner());
        });
    });

    group.finish();
}

/// Benchmark command decoding
fn bench_decode(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));

    let set = command_bytes(&[b"SET", b"user:1000", b"some-small-value"]);
    group.bench_function("set_command", |b| {
        b.iter(|| {
            let mut decoder = Decoder::new(&set[..]);
            black_box(rt.block_on(decoder.command()).unwrap());
        });
    });

    let pipeline: Vec<u8> = (0..100).flat_map(|_| set.iter().copied()).collect();
    group.throughput(Throughput::Elements(100));
    group.bench_function("pipeline_100", |b| {
        b.iter(|| {
            let mut decoder = Decoder::new(&pipeline[..]);
            rt.block_on(async {
                for _ in 0..100 {
                    black_box(decoder.command().await.unwrap());
                }
            });
        });
    });

    group.finish();
}

/// Benchmark SET and GET through the command handler
fn bench_commands(c: &mut Criterion) {
    let rt = runtime();
    let store = MemoryStore::new();
    let mut handler = CommandHandler::new(Arc::new(store), "bench", 16);

    let mut group = c.benchmark_group("commands");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let args = vec![
                Bytes::from_static(b"SET"),
                Bytes::from(format!("key:{}", i)),
                Bytes::from_static(b"value"),
            ];
            black_box(rt.block_on(handler.execute(args)));
            i += 1;
        });
    });

    group.bench_function("get", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let args = vec![Bytes::from_static(b"GET"), Bytes::from(format!("key:{}", i % 1000))];
            black_box(rt.block_on(handler.execute(args)));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark one expire pass over fully expired records
fn bench_reclaim(c: &mut Criterion) {
    let rt = runtime();
    let db = Database::new("bench", 0);
    let now = unix_now();

    let mut group = c.benchmark_group("reclaim");
    for batch in [64usize, 256, 1024] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_function(format!("expire_pass_{}", batch), |b| {
            b.iter_batched(
                || {
                    let store = MemoryStore::new();
                    for i in 0..batch {
                        let object = Object::new(ObjectId::from_u128(i as u128), ObjectType::String, now - 1000)
                            .with_expire_at(now - 600);
                        store.put(db.meta_key(format!("k{:06}", i).as_bytes()), object.encode(b"v"));
                    }
                    Reclaimer::new(Arc::new(store), db.clone())
                },
                |reclaimer| {
                    black_box(rt.block_on(reclaimer.run_pass(WorkKind::Expire, None, batch, now)).unwrap());
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_commands, bench_reclaim);

criterion_main!(benches);
