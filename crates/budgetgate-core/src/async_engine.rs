// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Async decision engine backed by Tokio.
//!
//! This module is only compiled when the `async` feature flag is enabled:
//!
//! ```toml
//! [dependencies]
//! budgetgate-core = { version = "0.2", features = ["async"] }
//! ```
//!
//! # Design
//!
//! [`AsyncEngine`] shares one [`Engine`] behind an [`Arc`] and runs every
//! store-touching call on Tokio's blocking pool, so a task waiting on a
//! ledger lock or a file flush never stalls a runtime worker.  Decisions are
//! identical to the sync engine's; the atomicity lives in the store.
//!
//! # Example
//!
//! ```rust,no_run
//! use rust_decimal::Decimal;
//! use budgetgate_core::{
//!     async_engine::AsyncEngine,
//!     config::EngineConfig,
//!     storage::InMemoryStore,
//!     types::{Budget, Ledger},
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = AsyncEngine::new(EngineConfig::default(), InMemoryStore::new());
//!     let ledger = Ledger::new("openai", "gpt-4", "user:1");
//!     let budget = Budget::hourly(Decimal::new(50, 0)).unwrap();
//!
//!     let decision = engine.evaluate_fixed(ledger, budget, Decimal::ONE).await.unwrap();
//!     assert!(decision.allowed());
//! }
//! ```

#![cfg(feature = "async")]

use std::sync::Arc;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::GateError;
use crate::storage::SpendStore;
use crate::types::{Amount, Budget, Decision, Ledger, Reservation, ReservationId, Settlement};

// ---------------------------------------------------------------------------
// AsyncEngine
// ---------------------------------------------------------------------------

/// Async facade over a shared [`Engine`].  Cheap to clone.
pub struct AsyncEngine<S: SpendStore> {
    inner: Arc<Engine<S>>,
}

impl<S: SpendStore> Clone for AsyncEngine<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S: SpendStore + 'static> AsyncEngine<S> {
    pub fn new(config: EngineConfig, store: S) -> Self {
        Self::from_engine(Engine::new(config, store))
    }

    /// Wrap an engine that was already configured (clock, budgets, listeners).
    pub fn from_engine(engine: Engine<S>) -> Self {
        Self { inner: Arc::new(engine) }
    }

    /// The shared sync engine, for registry and listener setup.
    pub fn engine(&self) -> &Engine<S> {
        &self.inner
    }

    async fn run<T, F>(&self, op: F) -> Result<T, GateError>
    where
        T: Send + 'static,
        F: FnOnce(&Engine<S>) -> Result<T, GateError> + Send + 'static,
    {
        let engine = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&engine))
            .await
            .map_err(|err| GateError::TaskFailed(err.to_string()))?
    }

    // -----------------------------------------------------------------------
    // Core API
    // -----------------------------------------------------------------------

    pub async fn evaluate_fixed(
        &self,
        ledger: Ledger,
        budget: Budget,
        amount: Amount,
    ) -> Result<Decision, GateError> {
        self.run(move |engine| engine.evaluate_fixed(&ledger, &budget, amount)).await
    }

    pub async fn evaluate_bounded_reserve(
        &self,
        ledger: Ledger,
        budget: Budget,
        estimate: Amount,
    ) -> Result<Decision, GateError> {
        self.run(move |engine| engine.evaluate_bounded_reserve(&ledger, &budget, estimate)).await
    }

    pub async fn check(&self, ledger: Ledger, amount: Amount) -> Result<Decision, GateError> {
        self.run(move |engine| engine.check(&ledger, amount)).await
    }

    pub async fn reserve(&self, ledger: Ledger, estimate: Amount) -> Result<Decision, GateError> {
        self.run(move |engine| engine.reserve(&ledger, estimate)).await
    }

    pub async fn commit(&self, id: ReservationId, actual: Amount) -> Result<Settlement, GateError> {
        self.run(move |engine| engine.commit(&id, actual)).await
    }

    pub async fn release(&self, id: ReservationId) -> Result<Settlement, GateError> {
        self.run(move |engine| engine.release(&id)).await
    }

    // -----------------------------------------------------------------------
    // Read-only and maintenance
    // -----------------------------------------------------------------------

    pub async fn spent(&self, ledger: Ledger, window: Option<Duration>) -> Result<Amount, GateError> {
        self.run(move |engine| engine.spent(&ledger, window)).await
    }

    pub async fn remaining(&self, ledger: Ledger, budget: Budget) -> Result<Amount, GateError> {
        self.run(move |engine| engine.remaining(&ledger, &budget)).await
    }

    pub async fn reservation(&self, id: ReservationId) -> Result<Option<Reservation>, GateError> {
        self.run(move |engine| engine.reservation(&id)).await
    }

    pub async fn prune(&self, ledger: Ledger, horizon: Duration) -> Result<usize, GateError> {
        self.run(move |engine| engine.prune(&ledger, horizon)).await
    }

    pub async fn clear(&self, ledger: Ledger) -> Result<(), GateError> {
        self.run(move |engine| engine.clear(&ledger)).await
    }

    pub async fn clear_all(&self) -> Result<(), GateError> {
        self.run(|engine| engine.clear_all()).await
    }
}
