//! Benchmark for the reverse-index range query
//!
//! The range query runs once per frontier expansion, so it dominates the
//! search phase together with the anchor check.

use std::io::Cursor;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ptrscan::{DumpOptions, Perm, PointerIndex, PtrWidth, SnapshotReader, write_pointer_map};

/// Build an index with `pairs` evenly spread pointer words in one region.
fn synthetic_index(pairs: u64) -> PointerIndex {
    let len = (pairs + 1) * 16;
    let mut snap = SnapshotReader::new();
    snap.add_region(0x10000, "[heap]", Perm::RW, vec![0; len as usize]);
    for i in 0..pairs {
        let src = 0x10000 + i * 16;
        let dst = 0x10000 + ((i * 7919) % pairs) * 16;
        snap.write_word(src, dst, 8);
    }

    let mut out = Cursor::new(Vec::new());
    let opts = DumpOptions { width: PtrWidth::U64, align_only: false };
    write_pointer_map(&snap, &opts, &mut out).unwrap();
    PointerIndex::from_bytes(out.into_inner()).unwrap()
}

fn benchmark_range_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_query");

    for pairs in [1_000u64, 10_000, 100_000] {
        let index = synthetic_index(pairs);
        let mid = 0x10000 + pairs * 8;

        group.bench_with_input(BenchmarkId::new("window_1k", pairs), &index, |b, index| {
            b.iter(|| index.range_query(black_box(mid - 0x200), black_box(mid + 0x200)).len());
        });

        group.bench_with_input(BenchmarkId::new("point", pairs), &index, |b, index| {
            b.iter(|| index.range_query(black_box(mid), black_box(mid)).len());
        });
    }

    group.finish();
}

fn benchmark_forward_lookup(c: &mut Criterion) {
    let index = synthetic_index(100_000);

    c.bench_function("forward_lookup_hit", |b| {
        b.iter(|| index.forward_lookup(black_box(0x10000 + 4_242 * 16)));
    });
    c.bench_function("forward_lookup_miss", |b| {
        b.iter(|| index.forward_lookup(black_box(0x10008)));
    });
}

criterion_group!(benches, benchmark_range_query, benchmark_forward_lookup);
criterion_main!(benches);
