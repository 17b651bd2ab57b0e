//! Performance benchmarks for message processing.
//!
//! These benchmarks measure the hot paths in the daemon:
//! - Command decoding (discriminate-then-decode)
//! - Glob matching during `get` planning
//! - Chunk hashing and throttle accounting during transfers
//! - Directory listing

use std::fs;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use daemon::files::{list_directory, SessionRoot};
use protocol::messages::{self, PutRequest, Request};
use protocol::transfer::glob_match;
use protocol::{FileEntry, Throttle};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Benchmark request decoding.
fn bench_message_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_decoding");

    let ls = r#"{"Type":"ls"}"#;
    group.throughput(Throughput::Bytes(ls.len() as u64));
    group.bench_function("ls", |b| {
        b.iter(|| messages::decode::<Request>(black_box(ls)).unwrap());
    });

    let unmapped = r#"{"Type":"frobnicate","Payload":"x"}"#;
    group.bench_function("unmapped", |b| {
        b.iter(|| messages::decode::<Request>(black_box(unmapped)).unwrap());
    });

    // A put announcing a few hundred files
    let files = (0..300)
        .map(|i| FileEntry::file(format!("dir/file-{i:04}.bin"), 4096, Utc::now()))
        .collect();
    let put = messages::encode(&Request::Put(PutRequest { files })).unwrap();
    group.throughput(Throughput::Bytes(put.len() as u64));
    group.bench_function("put_300_files", |b| {
        b.iter(|| messages::decode::<Request>(black_box(&put)).unwrap());
    });

    group.finish();
}

/// Benchmark glob matching.
fn bench_glob(c: &mut Criterion) {
    let mut group = c.benchmark_group("glob");

    group.bench_function("star_extension", |b| {
        b.iter(|| glob_match(black_box("*.txt"), black_box("notes-2024.txt")));
    });

    group.bench_function("double_star_deep", |b| {
        b.iter(|| {
            glob_match(
                black_box("**/*.jpg"),
                black_box("photos/2024/summer/beach/img_0042.jpg"),
            )
        });
    });

    group.bench_function("miss", |b| {
        b.iter(|| glob_match(black_box("a*b*c*d"), black_box("aaaaaaaaaaaaaaaaaaaaaaaax")));
    });

    group.finish();
}

/// Benchmark per-chunk transfer work.
fn bench_transfer_chunk(c: &mut Criterion) {
    let mut group = c.benchmark_group("transfer_chunk");

    let chunk = vec![0xA5u8; protocol::DEFAULT_CHUNK_SIZE];
    group.throughput(Throughput::Bytes(chunk.len() as u64));
    group.bench_function("sha256_128KB", |b| {
        b.iter(|| {
            let mut hasher = Sha256::new();
            hasher.update(black_box(&chunk));
            hasher.finalize()
        });
    });

    group.bench_function("throttle_record_unlimited", |b| {
        let mut throttle = Throttle::new(0);
        b.iter(|| throttle.record(black_box(chunk.len()), Instant::now()));
    });

    group.bench_function("throttle_record_capped", |b| {
        let mut throttle = Throttle::new(u64::MAX / 2);
        b.iter(|| throttle.record(black_box(chunk.len()), Instant::now()));
    });

    group.finish();
}

/// Benchmark directory listing with recursive sizes.
fn bench_listing(c: &mut Criterion) {
    let temp = tempfile::TempDir::new().unwrap();
    for d in 0..10 {
        let dir = temp.path().join(format!("dir{d}"));
        fs::create_dir(&dir).unwrap();
        for f in 0..20 {
            fs::write(dir.join(format!("f{f}")), [0u8; 64]).unwrap();
        }
    }
    for f in 0..50 {
        fs::write(temp.path().join(format!("top{f}.txt")), [0u8; 16]).unwrap();
    }
    let root = SessionRoot::new(temp.path()).unwrap();

    c.bench_function("list_directory_260_entries", |b| {
        b.iter(|| list_directory(black_box(&root), root.path()).unwrap());
    });
}

criterion_group!(
    benches,
    bench_message_decoding,
    bench_glob,
    bench_transfer_chunk,
    bench_listing,
);

criterion_main!(benches);
