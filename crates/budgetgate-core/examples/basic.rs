// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! # Basic Spend Gate Example
//!
//! Walks through both cost disclosure timings against the in-memory store.
//! Run with:
//!
//! ```bash
//! RUST_LOG=budgetgate_core=debug cargo run --example basic
//! ```

use std::time::Duration;

use rust_decimal_macros::dec;
use tracing_subscriber::EnvFilter;

use budgetgate_core::{
    enforce, Budget, Decision, Engine, EngineConfig, GuardError, InMemoryStore, Ledger, Mode,
    StoreOptions,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("BudgetGate: Basic Example\n");

    // -----------------------------------------------------------------------
    // 1. Construct the engine
    // -----------------------------------------------------------------------
    let store = InMemoryStore::with_options(
        StoreOptions::default()
            .with_reservation_ttl(Duration::from_secs(300))
            .and_then(|options| options.with_retention(Duration::from_secs(86_400)))
            .expect("durations are non-zero"),
    );
    let engine = Engine::new(EngineConfig::default(), store);
    engine.on_decision(|decision| {
        if decision.is_store_error() {
            eprintln!("  [alert] store error on {}", decision.ledger);
        }
    });

    // -----------------------------------------------------------------------
    // 2. Fixed cost: embeddings at $0.0001 each, $0.0003 per hour
    // -----------------------------------------------------------------------
    let embeddings = Ledger::new("openai", "embedding", "user:42");
    let per_hour = Budget::hourly(dec!(0.0003)).expect("valid budget");
    engine.register(embeddings.clone(), per_hour).expect("valid budget");

    for call in 1..=4 {
        let decision = engine.check(&embeddings, dec!(0.0001)).expect("valid request");
        print_decision(&format!("embed #{call}"), &decision);
    }
    println!();

    // -----------------------------------------------------------------------
    // 3. Bounded cost: reserve the worst case, commit what was actually used
    // -----------------------------------------------------------------------
    let chat = Ledger::new("openai", "gpt-4", "user:42");
    let daily = Budget::new(dec!(1.00), Some(Duration::from_secs(86_400))).expect("valid budget");

    let decision = engine
        .evaluate_bounded_reserve(&chat, &daily, dec!(0.50))
        .expect("valid request");
    print_decision("chat reserve $0.50", &decision);

    if let Some(id) = decision.reservation {
        let settlement = engine.commit(&id, dec!(0.18)).expect("active reservation");
        println!("  settled: {settlement:?}");
    }
    let remaining = engine.remaining(&chat, &daily).expect("store reachable");
    println!("  remaining today: ${remaining}\n");

    // -----------------------------------------------------------------------
    // 4. Boundary helpers
    // -----------------------------------------------------------------------
    let result = engine.guard_bounded(
        &chat,
        &daily,
        dec!(0.90),
        || Ok::<_, std::io::Error>("long answer"),
        |_| dec!(0.90),
    );
    match result {
        Ok(answer) => println!("guard_bounded: {answer}"),
        Err(GuardError::Blocked(exceeded)) => println!("guard_bounded: blocked ({exceeded})"),
        Err(err) => println!("guard_bounded: failed ({err})"),
    }

    let soft = daily.clone().with_mode(Mode::Soft);
    let decision = engine.evaluate_fixed(&chat, &soft, dec!(5.00)).expect("valid request");
    match enforce(decision) {
        Ok(decision) => print_decision("soft-mode spend", &decision),
        Err(exceeded) => println!("soft-mode spend raised: {exceeded}"),
    }
}

fn print_decision(label: &str, decision: &Decision) {
    let status = if decision.allowed() { "ALLOW" } else { "BLOCK" };
    println!(
        "  {label:<22} {status}  spent={:<8} remaining={:<8} {}",
        decision.spent_in_window.to_string(),
        decision.remaining.to_string(),
        decision.message.as_deref().unwrap_or(""),
    );
}
