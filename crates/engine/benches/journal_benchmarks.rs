//! History Performance Benchmarks
//!
//! Measures mutation and undo/redo throughput for both engine modes.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use histree_engine::{HistoryOptions, UndoableSpace};

fn journal_space() -> UndoableSpace {
    let space = UndoableSpace::new(HistoryOptions::default());
    space
        .enable_history(
            "/bench",
            HistoryOptions {
                use_mutation_journal: true,
                ..HistoryOptions::default()
            },
        )
        .expect("enable journal root");
    space
}

/// Benchmark: journaled inserts, one entry per mutation
fn bench_journal_insert(c: &mut Criterion) {
    let space = journal_space();

    let mut group = c.benchmark_group("journal");
    group.throughput(Throughput::Elements(1));

    group.bench_function("insert", |b| {
        let mut i = 0u64;
        b.iter(|| {
            space
                .insert(&format!("/bench/item{}", i % 64), &i)
                .expect("insert");
            black_box(i);
            i += 1;
        });
    });

    group.bench_function("undo_redo_pair", |b| {
        space.insert("/bench/cycle", &1u64).expect("seed");
        b.iter(|| {
            space.undo("/bench", 1).expect("undo");
            space.redo("/bench", 1).expect("redo");
        });
    });

    group.finish();
}

/// Benchmark: snapshot-mode commit of a batched transaction
fn bench_snapshot_commit(c: &mut Criterion) {
    let space = UndoableSpace::new(HistoryOptions::default());
    space
        .enable_history("/snap", HistoryOptions::default())
        .expect("enable snapshot root");

    let mut group = c.benchmark_group("snapshot");
    group.throughput(Throughput::Elements(64));

    group.bench_function("commit_batch_64", |b| {
        let mut round = 0u64;
        b.iter(|| {
            let tx = space.begin_transaction("/snap").expect("begin");
            for i in 0..64u64 {
                space
                    .insert(&format!("/snap/item{i}"), &(round + i))
                    .expect("insert");
            }
            tx.commit().expect("commit");
            round += 1;
        });
    });

    group.finish();
}

criterion_group!(benches, bench_journal_insert, bench_snapshot_commit);
criterion_main!(benches);
