//! Criterion benchmarks for the SQLite state backend.
//!
//! These measure the per-envelope state traffic: a dedup lookup, the
//! applied-sequence check, and the journalled commit.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use changebyte_state::prelude::*;

fn bench_run_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("state/run_lifecycle");

    group.bench_function("start_and_complete", |b| {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let pipeline = PipelineId::new("bench_pipeline");

        b.iter(|| {
            let run_id = backend.start_run(&pipeline).unwrap();
            backend
                .complete_run(
                    run_id,
                    RunStatus::Completed,
                    &RunStats {
                        events_read: 1000,
                        events_applied: 1000,
                        ..RunStats::default()
                    },
                )
                .unwrap();
        });
    });

    group.finish();
}

fn bench_apply_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("state/apply_path");

    for source_count in [1, 100, 1_000] {
        group.bench_with_input(
            BenchmarkId::new("sources", source_count),
            &source_count,
            |b, &source_count| {
                let backend = SqliteStateBackend::in_memory().unwrap();
                let pipeline = PipelineId::new("bench_pipeline");
                let sources: Vec<String> =
                    (0..source_count).map(|i| format!("src-{i}")).collect();
                let mut sequence = 0u64;

                b.iter(|| {
                    sequence += 1;
                    for source_id in &sources {
                        let key = DedupKey::derive(source_id, sequence);
                        if backend.lookup_dedup(&pipeline, &key).unwrap().is_some() {
                            continue;
                        }
                        let _ = backend.applied_sequence(&pipeline, source_id).unwrap();
                        backend
                            .begin_apply(
                                &pipeline,
                                &PendingApply {
                                    dedup_key: key.clone(),
                                    source_id: source_id.clone(),
                                    sequence,
                                    started_at: Timestamp::new("2026-01-01T00:00:00Z"),
                                },
                            )
                            .unwrap();
                        backend
                            .commit_apply(
                                &pipeline,
                                &key,
                                source_id,
                                sequence,
                                &ApplyResult::applied(format!("dest:{source_id}")),
                            )
                            .unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_run_lifecycle, bench_apply_path);
criterion_main!(benches);
