// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! # budgetgate-core
//!
//! Deterministic spend-decision engine.  Before an action that costs money
//! runs, the engine answers ALLOW or BLOCK against a windowed budget and, on
//! ALLOW, atomically records or reserves the spend so concurrent callers can
//! never jointly exceed the limit.
//!
//! ## Architecture
//!
//! ```text
//! Engine<S: SpendStore>
//!   ├── evaluate_fixed            — known cost: atomic check-and-commit
//!   ├── evaluate_bounded_reserve  — upper bound: atomic check-and-reserve
//!   ├── commit / release          — resolve a reservation
//!   └── registry, listeners, reads and maintenance
//!
//! SpendStore                      — the only mutator of spend state
//!   └── InMemoryStore             — per-ledger locks over LedgerState
//! ```
//!
//! Budget outcomes and store failures are always [`Decision`] values.  How a
//! BLOCK surfaces at the boundary (error or value) is decided by the helpers
//! in [`enforce`], never by the core.
//!
//! ## Quick Start
//!
//! ```rust
//! use rust_decimal::Decimal;
//! use budgetgate_core::{Budget, Engine, EngineConfig, InMemoryStore, Ledger};
//!
//! let engine = Engine::new(EngineConfig::default(), InMemoryStore::new());
//! let ledger = Ledger::new("openai", "gpt-4", "user:42");
//! let budget = Budget::hourly(Decimal::new(5000, 2)).unwrap();
//!
//! // Bounded cost: hold the estimate, then settle with the actual.
//! let decision = engine
//!     .evaluate_bounded_reserve(&ledger, &budget, Decimal::new(50, 2))
//!     .unwrap();
//! assert!(decision.allowed());
//!
//! let id = decision.reservation.unwrap();
//! engine.commit(&id, Decimal::new(31, 2)).unwrap();
//! assert_eq!(engine.remaining(&ledger, &budget).unwrap(), Decimal::new(4969, 2));
//! ```
//!
//! ## Features
//!
//! - `async`: [`AsyncEngine`](async_engine::AsyncEngine) on Tokio's blocking pool.
//! - `config-loader`: TOML file and environment configuration.

pub mod async_engine;
pub mod clock;
pub mod config;
pub mod config_loader;
pub mod engine;
pub mod enforce;
pub mod error;
pub mod storage;
pub mod types;

// Re-export the most commonly used items at the crate root so consumers can
// write `use budgetgate_core::Engine;` instead of the fully qualified path.
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, StoreOptions};
pub use engine::Engine;
pub use enforce::{enforce, GuardError, Guarded};
pub use error::{BudgetExceeded, GateError, LifecycleError, StoreError};
pub use storage::{InMemoryStore, SpendStore};
pub use types::{
    Amount, BlockReason, Budget, Decision, Ledger, Mode, Reservation, ReservationId,
    ReservationState, Settlement, Status, StoreErrorMode,
};
