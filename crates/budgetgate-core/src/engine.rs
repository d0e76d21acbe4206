// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Decision engine: the top-level spend gate.
//!
//! [`Engine`] turns a `(ledger, budget, amount)` request into a [`Decision`]
//! by delegating the check-and-mutate step to its [`SpendStore`] and then
//! applying the budget's failure policy if the store could not answer.
//!
//! ## Cost disclosure timings
//!
//! 1. **Fixed cost** ([`evaluate_fixed`](Engine::evaluate_fixed)): the cost
//!    is known up front.  An ALLOW records the spend immediately.
//! 2. **Bounded cost** ([`evaluate_bounded_reserve`](Engine::evaluate_bounded_reserve)):
//!    only an upper bound is known up front.  An ALLOW holds the estimate in
//!    a reservation; the caller later [`commit`](Engine::commit)s the actual
//!    cost or [`release`](Engine::release)s the hold.
//!
//! Unbounded costs have no place here: every request carries a finite
//! decimal amount that is enforced before execution.
//!
//! ## Outcomes
//!
//! Budget and store-error outcomes are always values.  Only invalid input
//! and reservation lifecycle violations come back as [`GateError`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{GateError, SettleError, StoreError};
use crate::storage::{Admission, SpendStore};
use crate::types::{
    window_to_ms, Amount, BlockReason, Budget, Decision, Ledger, Reservation, ReservationId,
    Settlement, Status, StoreErrorMode,
};

type Listener = Arc<dyn Fn(&Decision) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disclosure {
    Fixed,
    Bounded,
}

/// Spend gate over a [`SpendStore`].
///
/// All methods take `&self`; share one engine across threads with [`Arc`].
///
/// # Examples
///
/// ```rust
/// use rust_decimal::Decimal;
/// use budgetgate_core::{
///     config::EngineConfig,
///     engine::Engine,
///     storage::InMemoryStore,
///     types::{Budget, Ledger},
/// };
///
/// let engine = Engine::new(EngineConfig::default(), InMemoryStore::new());
/// let ledger = Ledger::new("openai", "embedding", "user:1");
/// let budget = Budget::hourly(Decimal::new(10, 0)).unwrap();
///
/// let decision = engine.evaluate_fixed(&ledger, &budget, Decimal::new(4, 0)).unwrap();
/// assert!(decision.allowed());
/// assert_eq!(decision.remaining, Decimal::new(6, 0));
///
/// let decision = engine.evaluate_fixed(&ledger, &budget, Decimal::new(7, 0)).unwrap();
/// assert!(decision.blocked());
/// ```
pub struct Engine<S: SpendStore> {
    config: EngineConfig,
    store: S,
    clock: Arc<dyn Clock>,
    budgets: RwLock<HashMap<Ledger, Budget>>,
    listeners: RwLock<Vec<Listener>>,
    listener_errors: AtomicU64,
}

impl<S: SpendStore> Engine<S> {
    /// Construct an engine reading time from the system clock.
    pub fn new(config: EngineConfig, store: S) -> Self {
        Self {
            config,
            store,
            clock: Arc::new(SystemClock),
            budgets: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            listener_errors: AtomicU64::new(0),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Borrow the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current time according to the engine's clock.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    /// Register (or replace) the budget used by [`check`](Self::check) and
    /// [`reserve`](Self::reserve) for `ledger`.
    pub fn register(&self, ledger: Ledger, budget: Budget) -> Result<(), GateError> {
        budget.validate()?;
        info!(ledger = %ledger, max_spend = %budget.max_spend, window = ?budget.window, "registered budget");
        self.budgets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ledger, budget);
        Ok(())
    }

    /// The registered budget for `ledger`, or [`Budget::unlimited`] when none
    /// is registered and `pass_on_unregistered` is set.
    pub fn budget_for(&self, ledger: &Ledger) -> Result<Budget, GateError> {
        let registered = self
            .budgets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ledger)
            .cloned();
        match registered {
            Some(budget) => Ok(budget),
            None if self.config.pass_on_unregistered => Ok(Budget::unlimited()),
            None => Err(GateError::UnregisteredLedger { ledger: ledger.to_string() }),
        }
    }

    /// Add a listener called with every decision the engine produces.
    ///
    /// Listeners run after the store has recorded the outcome.  A listener
    /// that panics is skipped and counted in
    /// [`listener_errors`](Self::listener_errors); the decision is still
    /// returned to the caller.
    pub fn on_decision(&self, listener: impl Fn(&Decision) + Send + Sync + 'static) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Number of listener calls that panicked since construction.
    pub fn listener_errors(&self) -> u64 {
        self.listener_errors.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Core API
    // -----------------------------------------------------------------------

    /// Decide a fixed-cost spend.  On ALLOW the spend is already recorded.
    pub fn evaluate_fixed(
        &self,
        ledger: &Ledger,
        budget: &Budget,
        amount: Amount,
    ) -> Result<Decision, GateError> {
        self.evaluate(Disclosure::Fixed, ledger, budget, amount)
    }

    /// Decide a bounded-cost spend.  On ALLOW the estimate is held by the
    /// reservation in [`Decision::reservation`], which must be committed or
    /// released.
    ///
    /// A FAIL_OPEN allow on a store error carries no reservation: there was
    /// no store state to hold headroom in, so there is nothing to resolve.
    pub fn evaluate_bounded_reserve(
        &self,
        ledger: &Ledger,
        budget: &Budget,
        estimate: Amount,
    ) -> Result<Decision, GateError> {
        self.evaluate(Disclosure::Bounded, ledger, budget, estimate)
    }

    /// [`evaluate_fixed`](Self::evaluate_fixed) against the registered budget.
    pub fn check(&self, ledger: &Ledger, amount: Amount) -> Result<Decision, GateError> {
        let budget = self.budget_for(ledger)?;
        self.evaluate_fixed(ledger, &budget, amount)
    }

    /// [`evaluate_bounded_reserve`](Self::evaluate_bounded_reserve) against
    /// the registered budget.
    pub fn reserve(&self, ledger: &Ledger, estimate: Amount) -> Result<Decision, GateError> {
        let budget = self.budget_for(ledger)?;
        self.evaluate_bounded_reserve(ledger, &budget, estimate)
    }

    /// Resolve an active reservation into a committed spend of `actual`.
    ///
    /// Accounting of `actual > estimate` and the entry's timestamp follow
    /// [`EngineConfig::settlement`].
    ///
    /// # Errors
    ///
    /// [`LifecycleError`](crate::error::LifecycleError) if the reservation is
    /// unknown or no longer active, or if the overrun policy rejects the
    /// commit.  Store failures are returned as [`Settlement::Unsettled`].
    pub fn commit(&self, id: &ReservationId, actual: Amount) -> Result<Settlement, GateError> {
        validate_amount("actual", actual)?;
        let now_ms = self.clock.now_ms();
        let settled = match self.store.commit(id, actual, now_ms, &self.config.settlement) {
            Ok(settled) => settled,
            Err(err) => return self.unsettled(id, err),
        };

        let reservation = settled.reservation;
        let recorded = settled.recorded.unwrap_or(actual);
        if let Some(overrun) = settled.overrun {
            warn!(
                reservation_id = %id,
                ledger = %reservation.ledger,
                estimate = %reservation.amount,
                actual = %actual,
                overrun = %overrun,
                recorded = %recorded,
                "commit exceeded reserved estimate"
            );
        }
        debug!(reservation_id = %id, ledger = %reservation.ledger, recorded = %recorded, "committed reservation");

        Ok(Settlement::Committed {
            reservation_id: *id,
            ledger: reservation.ledger,
            reserved: reservation.amount,
            recorded,
            overrun: settled.overrun,
        })
    }

    /// Drop an active reservation with no spend recorded.  Safe to call on
    /// the error path of an execution that failed after a successful reserve.
    pub fn release(&self, id: &ReservationId) -> Result<Settlement, GateError> {
        let now_ms = self.clock.now_ms();
        let settled = match self.store.release(id, now_ms) {
            Ok(settled) => settled,
            Err(err) => return self.unsettled(id, err),
        };
        debug!(reservation_id = %id, ledger = %settled.reservation.ledger, "released reservation");
        Ok(Settlement::Released {
            reservation_id: *id,
            ledger: settled.reservation.ledger,
            reserved: settled.reservation.amount,
        })
    }

    // -----------------------------------------------------------------------
    // Read-only and maintenance
    // -----------------------------------------------------------------------

    /// Spend currently counted against a budget with `window`.
    pub fn spent(&self, ledger: &Ledger, window: Option<Duration>) -> Result<Amount, GateError> {
        Ok(self.store.spent(ledger, window, self.clock.now_ms())?)
    }

    /// Headroom left under `budget`, without reserving anything.
    pub fn remaining(&self, ledger: &Ledger, budget: &Budget) -> Result<Amount, GateError> {
        budget.validate()?;
        let spent = self.spent(ledger, budget.window)?;
        Ok(headroom(budget.max_spend, spent))
    }

    /// Inspect a reservation in any lifecycle state.
    pub fn reservation(&self, id: &ReservationId) -> Result<Option<Reservation>, GateError> {
        Ok(self.store.reservation(id)?)
    }

    /// Delete spend older than `horizon` and reservations resolved before it.
    ///
    /// `horizon` must cover the longest window evaluated on this ledger.
    pub fn prune(&self, ledger: &Ledger, horizon: Duration) -> Result<usize, GateError> {
        if horizon.is_zero() {
            return Err(GateError::invalid("horizon", "must be > 0"));
        }
        let horizon_ms = self.clock.now_ms().saturating_sub(window_to_ms(horizon));
        Ok(self.store.prune(ledger, horizon_ms)?)
    }

    /// Clear all spend history and reservations of `ledger`.
    pub fn clear(&self, ledger: &Ledger) -> Result<(), GateError> {
        self.store.clear(ledger)?;
        info!(ledger = %ledger, "cleared ledger");
        Ok(())
    }

    /// Clear all spend history.
    pub fn clear_all(&self) -> Result<(), GateError> {
        self.store.clear_all()?;
        info!("cleared all ledgers");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn evaluate(
        &self,
        disclosure: Disclosure,
        ledger: &Ledger,
        budget: &Budget,
        amount: Amount,
    ) -> Result<Decision, GateError> {
        validate_amount("amount", amount)?;
        budget.validate()?;

        let now_ms = self.clock.now_ms();
        let outcome = match disclosure {
            Disclosure::Fixed => self.store.atomic_check_and_commit(
                ledger,
                budget.window,
                amount,
                budget.max_spend,
                now_ms,
            ),
            Disclosure::Bounded => {
                self.store.reserve(ledger, budget.window, amount, budget.max_spend, now_ms)
            }
        };

        let decision = match outcome {
            Ok(admission) => admission_decision(ledger, budget, amount, admission, now_ms),
            Err(err) => store_error_decision(ledger, budget, amount, &err, now_ms),
        };
        debug!(
            ledger = %ledger,
            disclosure = ?disclosure,
            status = ?decision.status,
            reason = ?decision.reason,
            requested = %amount,
            spent_in_window = %decision.spent_in_window,
            remaining = %decision.remaining,
            "spend decision"
        );
        self.emit(&decision);
        Ok(decision)
    }

    fn unsettled(&self, id: &ReservationId, err: SettleError) -> Result<Settlement, GateError> {
        match err {
            SettleError::Lifecycle(lifecycle) => Err(lifecycle.into()),
            SettleError::Store(store) => {
                warn!(reservation_id = %id, error = %store, "store error while settling reservation");
                Ok(Settlement::Unsettled { reservation_id: *id, message: store.to_string() })
            }
        }
    }

    fn emit(&self, decision: &Decision) {
        // Snapshot so a listener may register further listeners.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            // The store has already been mutated; a panicking listener must
            // not unwind past it and lose the decision.
            if panic::catch_unwind(AssertUnwindSafe(|| listener(decision))).is_err() {
                self.listener_errors.fetch_add(1, Ordering::Relaxed);
                warn!(ledger = %decision.ledger, status = ?decision.status, "decision listener panicked");
            }
        }
    }
}

fn validate_amount(field: &str, amount: Amount) -> Result<(), GateError> {
    if amount < Amount::ZERO {
        return Err(GateError::invalid(field, "must be >= 0"));
    }
    Ok(())
}

fn headroom(max_spend: Amount, spent: Amount) -> Amount {
    (max_spend - spent).max(Amount::ZERO)
}

fn admission_decision(
    ledger: &Ledger,
    budget: &Budget,
    amount: Amount,
    admission: Admission,
    now_ms: u64,
) -> Decision {
    if admission.admitted {
        let spent = admission.spent_before.saturating_add(amount);
        return Decision {
            status: Status::Allow,
            ledger: ledger.clone(),
            budget: budget.clone(),
            reason: None,
            message: None,
            spent_in_window: spent,
            requested: amount,
            remaining: headroom(budget.max_spend, spent),
            reservation: admission.reservation,
            decided_at_ms: now_ms,
        };
    }

    let spent = admission.spent_before;
    Decision {
        status: Status::Block,
        ledger: ledger.clone(),
        budget: budget.clone(),
        reason: Some(BlockReason::BudgetExceeded),
        message: Some(format!(
            "budget exceeded: {} + {} > {}",
            spent, amount, budget.max_spend
        )),
        spent_in_window: spent,
        requested: amount,
        remaining: headroom(budget.max_spend, spent),
        reservation: None,
        decided_at_ms: now_ms,
    }
}

fn store_error_decision(
    ledger: &Ledger,
    budget: &Budget,
    amount: Amount,
    err: &StoreError,
    now_ms: u64,
) -> Decision {
    let (status, policy) = match budget.on_store_error {
        StoreErrorMode::FailOpen => (Status::Allow, "fail-open"),
        StoreErrorMode::FailClosed => (Status::Block, "fail-closed"),
    };
    warn!(ledger = %ledger, policy, error = %err, "store error resolved by failure policy");
    Decision {
        status,
        ledger: ledger.clone(),
        budget: budget.clone(),
        reason: Some(BlockReason::StoreError),
        message: Some(format!("store error ({policy}): {err}")),
        spent_in_window: Amount::ZERO,
        requested: amount,
        remaining: Amount::ZERO,
        reservation: None,
        decided_at_ms: now_ms,
    }
}
