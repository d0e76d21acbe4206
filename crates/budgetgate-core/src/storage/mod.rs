// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Storage abstraction for the decision engine.
//!
//! The [`SpendStore`] trait is the single interface between the engine and
//! any persistence layer.  This crate ships [`InMemoryStore`]; a JSON file
//! backend lives in `budgetgate-std`.
//!
//! A store is the sole mutator of spend state and it never decides ALLOW or
//! BLOCK: it reports an [`Admission`] and the engine builds the decision.
//! Each method must be indivisible with respect to every other operation on
//! the same ledger.  Contention must be scoped to the ledger; no store may
//! serialise unrelated ledgers behind one lock on its hot path.
//!
//! # Implementing `SpendStore`
//!
//! Backends over shared storage keep one [`LedgerState`] per
//! [`Ledger::key`](crate::types::Ledger::key) and run each method inside
//! the backend's native atomic primitive (transaction, script, or
//! compare-and-swap loop), calling the matching `LedgerState` method there.

mod ledger;
mod memory;

use std::sync::Arc;
use std::time::Duration;

pub use ledger::{Admission, LedgerState, Pruned, Settled};
pub use memory::InMemoryStore;

use crate::config::SettlementPolicy;
use crate::error::{SettleError, StoreError};
use crate::types::{Amount, Ledger, Reservation, ReservationId};

/// Pluggable persistence and concurrency substrate for spend state.
///
/// Timestamps are Unix epoch milliseconds supplied by the engine's clock so
/// every store agrees on "now" with the decision that uses it.
pub trait SpendStore: Send + Sync {
    /// Atomically sum spend in `window`, and if `spent + amount <= max_spend`
    /// record a committed entry of `amount` at `now_ms`.
    fn atomic_check_and_commit(
        &self,
        ledger: &Ledger,
        window: Option<Duration>,
        amount: Amount,
        max_spend: Amount,
        now_ms: u64,
    ) -> Result<Admission, StoreError>;

    /// Atomically sum spend in `window`, and if `spent + estimate <= max_spend`
    /// create an active reservation of `estimate`.
    fn reserve(
        &self,
        ledger: &Ledger,
        window: Option<Duration>,
        estimate: Amount,
        max_spend: Amount,
        now_ms: u64,
    ) -> Result<Admission, StoreError>;

    /// Atomically replace an active reservation with a committed entry.
    fn commit(
        &self,
        id: &ReservationId,
        actual: Amount,
        now_ms: u64,
        policy: &SettlementPolicy,
    ) -> Result<Settled, SettleError>;

    /// Atomically drop an active reservation without recording spend.
    fn release(&self, id: &ReservationId, now_ms: u64) -> Result<Settled, SettleError>;

    /// Read-only sum of spend in `window`.
    fn spent(&self, ledger: &Ledger, window: Option<Duration>, now_ms: u64)
        -> Result<Amount, StoreError>;

    /// Look up a reservation in any state.
    fn reservation(&self, id: &ReservationId) -> Result<Option<Reservation>, StoreError>;

    /// Delete entries dated before `horizon_ms` and reservations resolved
    /// before it.  Returns the number of entries removed.
    fn prune(&self, ledger: &Ledger, horizon_ms: u64) -> Result<usize, StoreError>;

    /// Drop all spend state of one ledger.
    fn clear(&self, ledger: &Ledger) -> Result<(), StoreError>;

    /// Drop all spend state.
    fn clear_all(&self) -> Result<(), StoreError>;
}

impl<S: SpendStore + ?Sized> SpendStore for Arc<S> {
    fn atomic_check_and_commit(
        &self,
        ledger: &Ledger,
        window: Option<Duration>,
        amount: Amount,
        max_spend: Amount,
        now_ms: u64,
    ) -> Result<Admission, StoreError> {
        (**self).atomic_check_and_commit(ledger, window, amount, max_spend, now_ms)
    }

    fn reserve(
        &self,
        ledger: &Ledger,
        window: Option<Duration>,
        estimate: Amount,
        max_spend: Amount,
        now_ms: u64,
    ) -> Result<Admission, StoreError> {
        (**self).reserve(ledger, window, estimate, max_spend, now_ms)
    }

    fn commit(
        &self,
        id: &ReservationId,
        actual: Amount,
        now_ms: u64,
        policy: &SettlementPolicy,
    ) -> Result<Settled, SettleError> {
        (**self).commit(id, actual, now_ms, policy)
    }

    fn release(&self, id: &ReservationId, now_ms: u64) -> Result<Settled, SettleError> {
        (**self).release(id, now_ms)
    }

    fn spent(
        &self,
        ledger: &Ledger,
        window: Option<Duration>,
        now_ms: u64,
    ) -> Result<Amount, StoreError> {
        (**self).spent(ledger, window, now_ms)
    }

    fn reservation(&self, id: &ReservationId) -> Result<Option<Reservation>, StoreError> {
        (**self).reservation(id)
    }

    fn prune(&self, ledger: &Ledger, horizon_ms: u64) -> Result<usize, StoreError> {
        (**self).prune(ledger, horizon_ms)
    }

    fn clear(&self, ledger: &Ledger) -> Result<(), StoreError> {
        (**self).clear(ledger)
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        (**self).clear_all()
    }
}
