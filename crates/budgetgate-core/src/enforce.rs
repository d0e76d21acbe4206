// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Boundary helpers that turn decisions into control flow.
//!
//! The engine only ever returns [`Decision`] values.  This module is the thin
//! layer that surfaces a BLOCK the way the caller asked for it: as an error
//! ([`Mode::Hard`](crate::types::Mode::Hard), [`enforce`], [`Engine::guard`])
//! or as a plain value ([`Engine::guard_result`]).

use std::convert::Infallible;

use thiserror::Error;
use tracing::warn;

use crate::engine::Engine;
use crate::error::{BudgetExceeded, GateError};
use crate::storage::SpendStore;
use crate::types::{Amount, Budget, Decision, Ledger, Mode, ReservationId, Settlement};

/// Surface a decision per its budget's mode.
///
/// A BLOCK under [`Mode::Hard`] becomes `Err(BudgetExceeded)`; every other
/// decision is passed through.
///
/// # Examples
///
/// ```rust
/// use rust_decimal::Decimal;
/// use budgetgate_core::{
///     config::EngineConfig, engine::Engine, enforce::enforce,
///     storage::InMemoryStore, types::{Budget, Ledger, Mode},
/// };
///
/// let engine = Engine::new(EngineConfig::default(), InMemoryStore::new());
/// let ledger = Ledger::global("openai", "gpt-4");
///
/// let hard = Budget::new(Decimal::ONE, None).unwrap();
/// let decision = engine.evaluate_fixed(&ledger, &hard, Decimal::TWO).unwrap();
/// assert!(enforce(decision).is_err());
///
/// let soft = hard.with_mode(Mode::Soft);
/// let decision = engine.evaluate_fixed(&ledger, &soft, Decimal::TWO).unwrap();
/// assert!(enforce(decision).unwrap().blocked());
/// ```
pub fn enforce(decision: Decision) -> Result<Decision, BudgetExceeded> {
    if decision.blocked() && decision.budget.mode == Mode::Hard {
        return Err(BudgetExceeded::new(decision));
    }
    Ok(decision)
}

/// Outcome of a guarded call that reports a BLOCK as a value.
#[derive(Debug, Clone, PartialEq)]
pub struct Guarded<T> {
    pub decision: Decision,
    /// `None` when the call was blocked and the action never ran.
    pub value: Option<T>,
}

impl<T> Guarded<T> {
    pub fn ok(&self) -> bool {
        self.value.is_some()
    }

    pub fn value_or(self, fallback: T) -> T {
        self.value.unwrap_or(fallback)
    }
}

/// Failure of a guarded call.
#[derive(Debug, Error)]
pub enum GuardError<E = Infallible> {
    /// The spend was blocked; the action never ran.
    #[error(transparent)]
    Blocked(BudgetExceeded),

    /// Invalid input or a reservation lifecycle violation.
    #[error(transparent)]
    Gate(#[from] GateError),

    /// The action itself failed.  Its reservation was released.
    #[error("guarded action failed: {0}")]
    Failed(E),

    /// The action ran but the store could not record its cost.  The
    /// reservation is still active and holds its estimate; commit `actual`
    /// against `reservation_id` once the store recovers, or let the
    /// reservation TTL reclaim it.
    #[error("reservation {reservation_id} left unsettled: {message}")]
    Unsettled {
        reservation_id: ReservationId,
        actual: Amount,
        message: String,
    },
}

impl<S: SpendStore> Engine<S> {
    /// Run `f` only if a fixed spend of `cost` is allowed.
    ///
    /// Any BLOCK is an error here regardless of [`Mode`]: without an ALLOW
    /// there is no `T` to return.  Use [`guard_result`](Self::guard_result)
    /// to receive blocks as values.
    pub fn guard<T>(
        &self,
        ledger: &Ledger,
        budget: &Budget,
        cost: Amount,
        f: impl FnOnce() -> T,
    ) -> Result<T, GuardError> {
        let decision = self.evaluate_fixed(ledger, budget, cost)?;
        if decision.blocked() {
            return Err(GuardError::Blocked(BudgetExceeded::new(decision)));
        }
        Ok(f())
    }

    /// Run `f` only if a fixed spend of `cost` is allowed, returning the
    /// decision alongside the value.
    pub fn guard_result<T>(
        &self,
        ledger: &Ledger,
        budget: &Budget,
        cost: Amount,
        f: impl FnOnce() -> T,
    ) -> Result<Guarded<T>, GateError> {
        let decision = self.evaluate_fixed(ledger, budget, cost)?;
        let value = decision.allowed().then(f);
        Ok(Guarded { decision, value })
    }

    /// Reserve `estimate`, run `f`, then commit `actual(&value)`.
    ///
    /// If `f` fails the reservation is released and the error is returned as
    /// [`GuardError::Failed`].
    pub fn guard_bounded<T, E>(
        &self,
        ledger: &Ledger,
        budget: &Budget,
        estimate: Amount,
        f: impl FnOnce() -> Result<T, E>,
        actual: impl FnOnce(&T) -> Amount,
    ) -> Result<T, GuardError<E>> {
        let guarded = self.guard_bounded_result(ledger, budget, estimate, f, actual)?;
        match guarded.value {
            Some(value) => Ok(value),
            None => Err(GuardError::Blocked(BudgetExceeded::new(guarded.decision))),
        }
    }

    /// [`guard_bounded`](Self::guard_bounded) with BLOCK reported as a value.
    pub fn guard_bounded_result<T, E>(
        &self,
        ledger: &Ledger,
        budget: &Budget,
        estimate: Amount,
        f: impl FnOnce() -> Result<T, E>,
        actual: impl FnOnce(&T) -> Amount,
    ) -> Result<Guarded<T>, GuardError<E>> {
        let decision = self.evaluate_bounded_reserve(ledger, budget, estimate)?;
        if decision.blocked() {
            return Ok(Guarded { decision, value: None });
        }

        // A fail-open allow holds nothing, so there is nothing to settle.
        let Some(id) = decision.reservation else {
            let value = f().map_err(GuardError::Failed)?;
            return Ok(Guarded { decision, value: Some(value) });
        };

        let value = match f() {
            Ok(value) => value,
            Err(err) => {
                self.release_quietly(&id);
                return Err(GuardError::Failed(err));
            }
        };

        let actual = actual(&value);
        match self.commit(&id, actual) {
            Ok(Settlement::Unsettled { message, .. }) => {
                warn!(reservation_id = %id, %actual, error = %message, "guarded spend left unsettled");
                Err(GuardError::Unsettled { reservation_id: id, actual, message })
            }
            Ok(_) => Ok(Guarded { decision, value: Some(value) }),
            Err(err) => {
                // Never leave the headroom held by a reservation nobody owns.
                self.release_quietly(&id);
                Err(err.into())
            }
        }
    }

    fn release_quietly(&self, id: &ReservationId) {
        match self.release(id) {
            Ok(Settlement::Unsettled { message, .. }) => {
                warn!(reservation_id = %id, error = %message, "guarded reservation left held");
            }
            Ok(_) => {}
            Err(err) => {
                warn!(reservation_id = %id, error = %err, "could not release guarded reservation");
            }
        }
    }
}
