//! Performance benchmarks for the branch store.

use branchdb::{varint, CommitRange, ConnectOptions, Connection, Store, StoreConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::TempDir;

fn create_store(dir: &TempDir) -> Store {
    Store::open(StoreConfig {
        path: dir.path().join("bench.db"),
        create_if_missing: true,
        ..Default::default()
    })
    .unwrap()
}

/// Branching connection without the per-connection page cache, so every
/// read walks the ancestry.
fn uncached(store: &Store) -> Connection {
    store
        .connect(ConnectOptions {
            page_cache_size: 0,
            ..ConnectOptions::branching()
        })
        .unwrap()
}

fn commit_page(conn: &mut Connection, page: u64, data: &[u8]) {
    conn.write_page(page, data).unwrap();
    conn.log_statement("update pages set data = ?").unwrap();
    conn.commit().unwrap();
}

/// Benchmark reading a page written only on the root, through chains of forks
fn bench_ancestry_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("ancestry_depth");

    for depth in [1, 10, 50, 200] {
        group.bench_with_input(BenchmarkId::new("forks", depth), &depth, |b, &depth| {
            let dir = TempDir::new().unwrap();
            let store = create_store(&dir);
            let mut conn = uncached(&store);

            commit_page(&mut conn, 1, &[1u8; 4096]);
            for level in 0..depth {
                conn.create_branch(&format!("level-{}", level), None).unwrap();
                // Each branch owns one commit so the chain cannot collapse.
                commit_page(&mut conn, 2, &[level as u8; 64]);
            }

            b.iter(|| {
                black_box(conn.read_page(1).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark page reads with and without the connection cache
fn bench_page_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("page_cache");

    for cache_size in [0usize, 256] {
        group.bench_with_input(
            BenchmarkId::new("cache_size", cache_size),
            &cache_size,
            |b, &cache_size| {
                let dir = TempDir::new().unwrap();
                let store = create_store(&dir);
                let mut conn = store
                    .connect(ConnectOptions {
                        page_cache_size: cache_size,
                        ..ConnectOptions::branching()
                    })
                    .unwrap();
                for page in 1..=64u64 {
                    commit_page(&mut conn, page, &[page as u8; 1024]);
                }

                b.iter(|| {
                    for page in 1..=64u64 {
                        black_box(conn.read_page(page).unwrap());
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark commit throughput for different page sizes
fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");
    group.sample_size(20);

    for size in [64usize, 1024, 4096] {
        group.bench_with_input(BenchmarkId::new("page_size", size), &size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let store = create_store(&dir);
            let mut conn = store.connect(ConnectOptions::branching()).unwrap();
            let data = vec![0xABu8; size];
            let mut page = 0u64;

            b.iter(|| {
                page = page % 32 + 1;
                commit_page(&mut conn, page, &data);
            });
        });
    }

    group.finish();
}

/// Benchmark statement log queries over a long history
fn bench_branch_log(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);
    let mut conn = store.connect(ConnectOptions::branching()).unwrap();

    for i in 0..500u64 {
        commit_page(&mut conn, 1 + i % 8, &i.to_le_bytes());
        if i % 100 == 99 {
            conn.create_branch(&format!("release-{}", i / 100), None).unwrap();
        }
    }

    c.bench_function("branch_log_full", |b| {
        b.iter(|| {
            black_box(conn.branch_log(None, CommitRange::All, false).unwrap());
        });
    });

    c.bench_function("branch_log_tail", |b| {
        b.iter(|| {
            black_box(
                conn.branch_log(
                    None,
                    CommitRange::Span {
                        start: Some(490),
                        end: None,
                    },
                    false,
                )
                .unwrap(),
            );
        });
    });
}

/// Benchmark the order-preserving integer codec
fn bench_varint(c: &mut Criterion) {
    let values: Vec<u64> = (0..1000u64)
        .map(|i| i.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> (i % 64))
        .collect();

    c.bench_function("varint_encode_decode", |b| {
        b.iter(|| {
            for &v in &values {
                let bytes = varint::encode(v);
                black_box(varint::decode_exact(&bytes).unwrap());
            }
        });
    });
}

criterion_group!(
    benches,
    bench_ancestry_depth,
    bench_page_cache,
    bench_commit,
    bench_branch_log,
    bench_varint,
);

criterion_main!(benches);
