// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Volatile in-process [`SpendStore`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use super::{Admission, LedgerState, Pruned, Settled, SpendStore};
use crate::config::{SettlementPolicy, StoreOptions};
use crate::error::{LifecycleError, SettleError, StoreError};
use crate::types::{Amount, Ledger, Reservation, ReservationId};

/// `None` marks a retired slot: its ledger emptied and was removed from the
/// map, so holders must fetch a fresh slot.
type Slot = Arc<Mutex<Option<LedgerState>>>;

/// A thread-safe, heap-allocated [`SpendStore`].
///
/// Each ledger owns its own mutex, so callers on different ledgers never
/// contend.  The ledger map itself is a sharded [`DashMap`]; its shard locks
/// are never waited on while a caller is blocked on a ledger's mutex.  A
/// second map indexes reservation ids to their ledger so commit and release
/// can find the right slot.
///
/// A ledger whose state becomes empty (no entries, no reservations) is
/// removed, so blocked requests against fresh ledgers and expired state do
/// not accumulate.  Committed entries stay until `retention` or a prune
/// removes them.
///
/// All data is lost when the store is dropped.
///
/// # Examples
///
/// ```rust
/// use budgetgate_core::storage::{InMemoryStore, SpendStore};
/// use budgetgate_core::types::{Amount, Ledger};
///
/// let store = InMemoryStore::new();
/// let ledger = Ledger::new("openai", "embedding", "user:1");
///
/// let admission = store
///     .atomic_check_and_commit(&ledger, None, Amount::ONE, Amount::ONE, 0)
///     .unwrap();
/// assert!(admission.admitted);
/// assert_eq!(store.spent(&ledger, None, 0).unwrap(), Amount::ONE);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    options: StoreOptions,
    ledgers: DashMap<Ledger, Slot>,
    index: DashMap<ReservationId, Ledger>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store applying TTL reclamation and retention per `options`.
    pub fn with_options(options: StoreOptions) -> Self {
        Self { options, ..Self::default() }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Number of ledgers currently holding state.
    pub fn ledger_count(&self) -> usize {
        self.ledgers.len()
    }

    /// Number of reservation ids still resolvable through the index.
    pub fn indexed_reservations(&self) -> usize {
        self.index.len()
    }

    fn slot(&self, ledger: &Ledger) -> Slot {
        if let Some(slot) = self.ledgers.get(ledger) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.ledgers
                .entry(ledger.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Some(LedgerState::new()))))
                .value(),
        )
    }

    fn existing(&self, ledger: &Ledger) -> Option<Slot> {
        self.ledgers.get(ledger).map(|slot| Arc::clone(slot.value()))
    }

    /// Run `op` inside the ledger's critical section, creating the ledger if
    /// needed.
    fn with_state<T>(
        &self,
        ledger: &Ledger,
        now_ms: u64,
        mut op: impl FnMut(&mut LedgerState) -> T,
    ) -> Result<T, StoreError> {
        loop {
            let slot = self.slot(ledger);
            if let Some(result) = self.run(ledger, &slot, now_ms, &mut op)? {
                return Ok(result);
            }
        }
    }

    /// Like [`with_state`](Self::with_state) but `None` when the ledger holds
    /// no state.
    fn with_existing<T>(
        &self,
        ledger: &Ledger,
        now_ms: u64,
        mut op: impl FnMut(&mut LedgerState) -> T,
    ) -> Result<Option<T>, StoreError> {
        match self.existing(ledger) {
            Some(slot) => self.run(ledger, &slot, now_ms, &mut op),
            None => Ok(None),
        }
    }

    /// Apply TTL and retention, run `op`, and retire the slot if that left it
    /// empty.  `None` if the slot was already retired.
    fn run<T>(
        &self,
        ledger: &Ledger,
        slot: &Slot,
        now_ms: u64,
        op: &mut impl FnMut(&mut LedgerState) -> T,
    ) -> Result<Option<T>, StoreError> {
        let mut guard = lock(ledger, slot)?;
        let Some(state) = guard.as_mut() else {
            return Ok(None);
        };
        let pruned = state.maintain(&self.options, now_ms);
        self.forget(&pruned);
        let result = op(state);
        if state.is_empty() {
            self.retire(ledger, slot, &mut guard);
        }
        Ok(Some(result))
    }

    /// Mark `slot` retired and unlink it, unless another slot has already
    /// replaced it.
    fn retire(
        &self,
        ledger: &Ledger,
        slot: &Slot,
        guard: &mut MutexGuard<'_, Option<LedgerState>>,
    ) {
        if let Some(state) = guard.take() {
            for reservation in state.reservations() {
                self.index.remove(&reservation.id);
            }
        }
        self.ledgers.remove_if(ledger, |_, current| Arc::ptr_eq(current, slot));
    }

    fn forget(&self, pruned: &Pruned) {
        for id in &pruned.reservations {
            self.index.remove(id);
        }
    }

    fn settle(
        &self,
        id: &ReservationId,
        now_ms: u64,
        op: impl FnOnce(&mut LedgerState) -> Result<Settled, LifecycleError>,
    ) -> Result<Settled, SettleError> {
        let not_found = LifecycleError::ReservationNotFound { id: *id };
        let ledger = self
            .index
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found.clone())?;
        let mut op = Some(op);
        let settled = self
            .with_existing(&ledger, now_ms, |state| match op.take() {
                Some(op) => op(state),
                None => Err(not_found.clone()),
            })?
            .ok_or(not_found)??;
        Ok(settled)
    }
}

fn lock<'a>(
    ledger: &Ledger,
    slot: &'a Slot,
) -> Result<MutexGuard<'a, Option<LedgerState>>, StoreError> {
    slot.lock()
        .map_err(|_| StoreError::unavailable(format!("lock for ledger {ledger} poisoned")))
}

impl SpendStore for InMemoryStore {
    fn atomic_check_and_commit(
        &self,
        ledger: &Ledger,
        window: Option<Duration>,
        amount: Amount,
        max_spend: Amount,
        now_ms: u64,
    ) -> Result<Admission, StoreError> {
        self.with_state(ledger, now_ms, |state| {
            state.check_and_commit(window, amount, max_spend, now_ms)
        })
    }

    fn reserve(
        &self,
        ledger: &Ledger,
        window: Option<Duration>,
        estimate: Amount,
        max_spend: Amount,
        now_ms: u64,
    ) -> Result<Admission, StoreError> {
        self.with_state(ledger, now_ms, |state| {
            let admission = state.reserve(ledger, window, estimate, max_spend, now_ms);
            if let Some(id) = admission.reservation {
                self.index.insert(id, ledger.clone());
            }
            admission
        })
    }

    fn commit(
        &self,
        id: &ReservationId,
        actual: Amount,
        now_ms: u64,
        policy: &SettlementPolicy,
    ) -> Result<Settled, SettleError> {
        self.settle(id, now_ms, |state| state.commit(id, actual, now_ms, policy))
    }

    fn release(&self, id: &ReservationId, now_ms: u64) -> Result<Settled, SettleError> {
        self.settle(id, now_ms, |state| state.release(id, now_ms))
    }

    fn spent(
        &self,
        ledger: &Ledger,
        window: Option<Duration>,
        now_ms: u64,
    ) -> Result<Amount, StoreError> {
        let spent = self.with_existing(ledger, now_ms, |state| state.spent(window, now_ms))?;
        Ok(spent.unwrap_or(Amount::ZERO))
    }

    fn reservation(&self, id: &ReservationId) -> Result<Option<Reservation>, StoreError> {
        let Some(ledger) = self.index.get(id).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };
        let Some(slot) = self.existing(&ledger) else {
            return Ok(None);
        };
        let guard = lock(&ledger, &slot)?;
        Ok(guard.as_ref().and_then(|state| state.reservation(id).cloned()))
    }

    fn prune(&self, ledger: &Ledger, horizon_ms: u64) -> Result<usize, StoreError> {
        let Some(slot) = self.existing(ledger) else {
            return Ok(0);
        };
        let mut guard = lock(ledger, &slot)?;
        let Some(state) = guard.as_mut() else {
            return Ok(0);
        };
        let pruned = state.prune(horizon_ms);
        self.forget(&pruned);
        if state.is_empty() {
            self.retire(ledger, &slot, &mut guard);
        }
        debug!(ledger = %ledger, entries = pruned.entries, "pruned ledger");
        Ok(pruned.entries)
    }

    fn clear(&self, ledger: &Ledger) -> Result<(), StoreError> {
        let Some(slot) = self.existing(ledger) else {
            return Ok(());
        };
        let mut guard = lock(ledger, &slot)?;
        self.retire(ledger, &slot, &mut guard);
        Ok(())
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        let ledgers: Vec<Ledger> = self.ledgers.iter().map(|entry| entry.key().clone()).collect();
        for ledger in &ledgers {
            self.clear(ledger)?;
        }
        Ok(())
    }
}
