// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Criterion benchmark suite for the spend gate.
//!
//! Benchmarks cover the gate's hot paths against the in-memory store:
//!
//! - Fixed-cost check on the ALLOW and BLOCK paths
//! - Guard overhead (`guard`, `guard_result`)
//! - Reserve/commit and reserve/release cycles
//! - ALLOW latency as the number of live ledgers grows
//!
//! Run with: `cargo bench --bench budgetgate_benchmark`
//!
//! Every ALLOW appends ledger state, so paths that mutate reset the measured
//! ledger in untimed setup to keep each iteration on a near-empty ledger.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rust_decimal_macros::dec;

use budgetgate_core::{Budget, Engine, EngineConfig, InMemoryStore, Ledger};

// ---------------------------------------------------------------------------
// Fixed-cost check
// ---------------------------------------------------------------------------

fn check_benchmark(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("check");

    let engine = Engine::new(EngineConfig::default(), InMemoryStore::new());
    let allow_ledger = Ledger::new("bench", "check", "user:0");
    engine
        .register(allow_ledger.clone(), Budget::hourly(dec!(999999999.0)).unwrap())
        .unwrap();

    for _ in 0..200 {
        let _ = engine.check(&allow_ledger, dec!(0.001));
    }

    group.bench_function("allow", |bencher| {
        bencher.iter_batched(
            || engine.clear(&allow_ledger).unwrap(),
            |()| {
                let decision = engine.check(black_box(&allow_ledger), black_box(dec!(0.001))).unwrap();
                assert!(decision.allowed());
                black_box(decision);
            },
            BatchSize::PerIteration,
        );
    });

    let block_ledger = Ledger::new("bench", "block", "user:0");
    engine
        .register(block_ledger.clone(), Budget::hourly(dec!(0.001)).unwrap())
        .unwrap();
    let _ = engine.check(&block_ledger, dec!(0.001));

    group.bench_function("block", |bencher| {
        bencher.iter(|| {
            let decision = engine.check(black_box(&block_ledger), black_box(dec!(0.001))).unwrap();
            assert!(decision.blocked());
            black_box(decision);
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Guard overhead
// ---------------------------------------------------------------------------

fn guard_benchmark(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("guard");

    let engine = Engine::new(EngineConfig::default(), InMemoryStore::new());
    let ledger = Ledger::new("bench", "guard", "user:0");
    let budget = Budget::hourly(dec!(999999999.0)).unwrap();

    group.bench_function("guard_allow", |bencher| {
        bencher.iter_batched(
            || engine.clear(&ledger).unwrap(),
            |()| {
                let value = engine.guard(&ledger, &budget, black_box(dec!(0.01)), || 42).unwrap();
                black_box(value);
            },
            BatchSize::PerIteration,
        );
    });

    group.bench_function("guard_result_allow", |bencher| {
        bencher.iter_batched(
            || engine.clear(&ledger).unwrap(),
            |()| {
                let guarded = engine
                    .guard_result(&ledger, &budget, black_box(dec!(0.01)), || 42)
                    .unwrap();
                assert!(guarded.ok());
                black_box(guarded);
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Reservation lifecycle
// ---------------------------------------------------------------------------

fn reservation_benchmark(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("reservation");

    let engine = Engine::new(EngineConfig::default(), InMemoryStore::new());
    let ledger = Ledger::new("bench", "reserve", "user:0");
    let budget = Budget::hourly(dec!(999999999.0)).unwrap();

    group.bench_function("reserve_commit", |bencher| {
        bencher.iter_batched(
            || engine.clear(&ledger).unwrap(),
            |()| {
                let decision = engine
                    .evaluate_bounded_reserve(&ledger, &budget, black_box(dec!(0.50)))
                    .unwrap();
                let id = decision.reservation.unwrap();
                black_box(engine.commit(&id, black_box(dec!(0.31))).unwrap());
            },
            BatchSize::PerIteration,
        );
    });

    group.bench_function("reserve_release", |bencher| {
        bencher.iter_batched(
            || engine.clear(&ledger).unwrap(),
            |()| {
                let decision = engine
                    .evaluate_bounded_reserve(&ledger, &budget, black_box(dec!(0.50)))
                    .unwrap();
                let id = decision.reservation.unwrap();
                black_box(engine.release(&id).unwrap());
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Ledger population
// ---------------------------------------------------------------------------

/// ALLOW latency on one ledger while many others hold state.
fn ledger_population_benchmark(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("ledger_population");
    let budget = Budget::hourly(dec!(999999999.0)).unwrap();

    for population in [1usize, 1_000, 100_000] {
        let engine = Engine::new(EngineConfig::default(), InMemoryStore::new());
        for index in 0..population {
            let ledger = Ledger::new("bench", "population", format!("user:{index:06}"));
            let _ = engine.evaluate_fixed(&ledger, &budget, dec!(0.01));
        }
        let target = Ledger::new("bench", "population", "user:000000");

        group.bench_with_input(BenchmarkId::from_parameter(population), &target, |bencher, target| {
            bencher.iter_batched(
                || engine.clear(target).unwrap(),
                |()| black_box(engine.evaluate_fixed(target, &budget, black_box(dec!(0.01))).unwrap()),
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    check_benchmark,
    guard_benchmark,
    reservation_benchmark,
    ledger_population_benchmark,
);

criterion_main!(benches);
