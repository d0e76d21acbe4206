// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Spend state of a single ledger.
//!
//! [`LedgerState`] holds the committed entries and the reservations of one
//! ledger and implements every state transition on them.  It performs no
//! locking of its own: a [`SpendStore`](super::SpendStore) owns one state per
//! ledger and must call these methods inside that ledger's critical section,
//! which is what makes check-then-act a single indivisible step.

use std::time::Duration;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{CommitTimestamp, OverrunPolicy, SettlementPolicy, StoreOptions};
use crate::error::LifecycleError;
use crate::types::{
    window_to_ms, Amount, Ledger, Reservation, ReservationId, ReservationState, SpendEntry,
};

/// Outcome of an atomic check: the store never decides, it only reports
/// whether `spent_before + amount <= max_spend` held and what it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    /// Spend in window (committed entries plus active reservations) before
    /// this request.
    pub spent_before: Amount,
    /// Set when an admitted request created a reservation.
    pub reservation: Option<ReservationId>,
}

/// A reservation that was just resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    /// Snapshot of the reservation after the transition.
    pub reservation: Reservation,
    /// Amount of the spend entry created, if any.
    pub recorded: Option<Amount>,
    /// `actual - estimate` when a commit exceeded its reservation.
    pub overrun: Option<Amount>,
}

/// Bookkeeping removed by [`LedgerState::prune`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pruned {
    pub entries: usize,
    /// Resolved reservations dropped from the state.  Stores that keep an
    /// id index must drop these ids too.
    pub reservations: Vec<ReservationId>,
}

/// Entries and reservations of one ledger.
///
/// Resolved reservations are dropped once
/// [`StoreOptions::resolved_retention`] has passed.  Committed entries are
/// only deleted by [`prune`](Self::prune) or [`StoreOptions::retention`]:
/// budgets are values, so any later check may sum over a wider window than
/// every check before it.
///
/// # Examples
///
/// ```rust
/// use budgetgate_core::storage::LedgerState;
/// use budgetgate_core::types::Amount;
///
/// let mut state = LedgerState::new();
/// let admission = state.check_and_commit(None, Amount::ONE, Amount::TWO, 0);
/// assert!(admission.admitted);
/// assert_eq!(state.spent(None, 0), Amount::ONE);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    entries: Vec<SpendEntry>,
    reservations: HashMap<ReservationId, Reservation>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed spend entries, oldest first.
    pub fn entries(&self) -> &[SpendEntry] {
        &self.entries
    }

    /// All reservations still tracked, in no particular order.
    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values()
    }

    pub fn reservation(&self, id: &ReservationId) -> Option<&Reservation> {
        self.reservations.get(id)
    }

    /// `true` when the ledger holds no entries and no reservations.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.reservations.is_empty()
    }

    /// Spend that counts against a budget with `window` at `now_ms`:
    /// committed entries inside the window plus every active reservation.
    ///
    /// Entries are excluded once `now_ms - timestamp_ms > window`.
    /// Reservations are not windowed; they count until resolved.
    pub fn spent(&self, window: Option<Duration>, now_ms: u64) -> Amount {
        let window_ms = window.map(window_to_ms);
        let committed = self
            .entries
            .iter()
            .filter(|entry| in_window(entry.timestamp_ms, window_ms, now_ms))
            .fold(Amount::ZERO, |total, entry| total.saturating_add(entry.amount));

        self.reservations
            .values()
            .filter(|reservation| reservation.is_active())
            .fold(committed, |total, reservation| total.saturating_add(reservation.amount))
    }

    /// Admit `amount` as a committed entry dated `now_ms` if it fits.
    pub fn check_and_commit(
        &mut self,
        window: Option<Duration>,
        amount: Amount,
        max_spend: Amount,
        now_ms: u64,
    ) -> Admission {
        let spent_before = self.spent(window, now_ms);
        let admitted = fits(spent_before, amount, max_spend);
        if admitted {
            self.entries.push(SpendEntry { amount, timestamp_ms: now_ms });
        }
        Admission { admitted, spent_before, reservation: None }
    }

    /// Admit `estimate` as a new active reservation if it fits.
    pub fn reserve(
        &mut self,
        ledger: &Ledger,
        window: Option<Duration>,
        estimate: Amount,
        max_spend: Amount,
        now_ms: u64,
    ) -> Admission {
        let spent_before = self.spent(window, now_ms);
        if !fits(spent_before, estimate, max_spend) {
            return Admission { admitted: false, spent_before, reservation: None };
        }

        let id = ReservationId::new();
        self.reservations.insert(
            id,
            Reservation {
                id,
                ledger: ledger.clone(),
                amount: estimate,
                created_at_ms: now_ms,
                state: ReservationState::Active,
                resolved_at_ms: None,
            },
        );
        Admission { admitted: true, spent_before, reservation: Some(id) }
    }

    /// Replace an active reservation with a committed entry of `actual`.
    pub fn commit(
        &mut self,
        id: &ReservationId,
        actual: Amount,
        now_ms: u64,
        policy: &SettlementPolicy,
    ) -> Result<Settled, LifecycleError> {
        let reservation = self.active_mut(id)?;

        let overrun = (actual > reservation.amount).then(|| actual - reservation.amount);
        let recorded = match (overrun, policy.overrun) {
            (Some(_), OverrunPolicy::Reject) => {
                return Err(LifecycleError::CommitExceedsEstimate {
                    id: *id,
                    estimate: reservation.amount,
                    actual,
                });
            }
            (Some(_), OverrunPolicy::Clamp) => reservation.amount,
            _ => actual,
        };
        let timestamp_ms = match policy.timestamp {
            CommitTimestamp::Reserved => reservation.created_at_ms,
            CommitTimestamp::Committed => now_ms,
        };

        reservation.state = ReservationState::Committed;
        reservation.resolved_at_ms = Some(now_ms);
        let snapshot = reservation.clone();

        self.entries.push(SpendEntry { amount: recorded, timestamp_ms });
        Ok(Settled { reservation: snapshot, recorded: Some(recorded), overrun })
    }

    /// Drop an active reservation without recording spend.
    pub fn release(&mut self, id: &ReservationId, now_ms: u64) -> Result<Settled, LifecycleError> {
        let reservation = self.active_mut(id)?;
        reservation.state = ReservationState::Released;
        reservation.resolved_at_ms = Some(now_ms);
        Ok(Settled { reservation: reservation.clone(), recorded: None, overrun: None })
    }

    /// Release every active reservation older than `ttl`.  Returns how many
    /// were reclaimed.
    pub fn expire_reservations(&mut self, ttl: Duration, now_ms: u64) -> usize {
        let ttl_ms = window_to_ms(ttl);
        let mut expired = 0;
        for reservation in self.reservations.values_mut() {
            if reservation.is_active() && now_ms.saturating_sub(reservation.created_at_ms) > ttl_ms {
                warn!(
                    reservation_id = %reservation.id,
                    ledger = %reservation.ledger,
                    amount = %reservation.amount,
                    "reclaiming orphaned reservation after TTL"
                );
                reservation.state = ReservationState::Released;
                reservation.resolved_at_ms = Some(now_ms);
                expired += 1;
            }
        }
        expired
    }

    /// Physically delete entries dated before `horizon_ms` and reservations
    /// resolved before it.  Active reservations are never pruned.
    pub fn prune(&mut self, horizon_ms: u64) -> Pruned {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.timestamp_ms >= horizon_ms);
        let reservations = self.drop_resolved(horizon_ms);
        Pruned { entries: before - self.entries.len(), reservations }
    }

    /// Apply the deployment's TTL, retention and resolved-reservation
    /// options.  Stores call this at the start of every critical section.
    pub fn maintain(&mut self, options: &StoreOptions, now_ms: u64) -> Pruned {
        if let Some(ttl) = options.reservation_ttl {
            self.expire_reservations(ttl, now_ms);
        }
        let mut pruned = match options.retention {
            Some(retention) => self.prune(now_ms.saturating_sub(window_to_ms(retention))),
            None => Pruned::default(),
        };
        let resolved_horizon = now_ms.saturating_sub(window_to_ms(options.resolved_retention));
        pruned.reservations.extend(self.drop_resolved(resolved_horizon));
        pruned
    }

    fn drop_resolved(&mut self, before_ms: u64) -> Vec<ReservationId> {
        let stale: Vec<ReservationId> = self
            .reservations
            .values()
            .filter(|reservation| matches!(reservation.resolved_at_ms, Some(at) if at < before_ms))
            .map(|reservation| reservation.id)
            .collect();
        for id in &stale {
            self.reservations.remove(id);
        }
        stale
    }

    fn active_mut(&mut self, id: &ReservationId) -> Result<&mut Reservation, LifecycleError> {
        let reservation = self
            .reservations
            .get_mut(id)
            .ok_or(LifecycleError::ReservationNotFound { id: *id })?;
        if !reservation.is_active() {
            return Err(LifecycleError::ReservationAlreadyResolved {
                id: *id,
                state: reservation.state,
            });
        }
        Ok(reservation)
    }
}

fn in_window(timestamp_ms: u64, window_ms: Option<u64>, now_ms: u64) -> bool {
    match window_ms {
        Some(window_ms) => now_ms.saturating_sub(timestamp_ms) <= window_ms,
        None => true,
    }
}

/// An overflowing total can never fit.
fn fits(spent: Amount, amount: Amount, max_spend: Amount) -> bool {
    spent
        .checked_add(amount)
        .is_some_and(|total| total <= max_spend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const MINUTE: Option<Duration> = Some(Duration::from_secs(60));

    fn ledger() -> Ledger {
        Ledger::new("a", "r", "p")
    }

    #[test]
    fn entry_counts_at_window_edge_and_not_after() {
        let mut state = LedgerState::new();
        assert!(state.check_and_commit(MINUTE, dec!(1), dec!(10), 0).admitted);

        assert_eq!(state.spent(MINUTE, 59_000), dec!(1));
        assert_eq!(state.spent(MINUTE, 60_000), dec!(1));
        assert_eq!(state.spent(MINUTE, 61_000), dec!(0));
        assert_eq!(state.spent(None, 61_000), dec!(1));
    }

    #[test]
    fn block_does_not_mutate() {
        let mut state = LedgerState::new();
        let admission = state.check_and_commit(None, dec!(2), dec!(1), 0);
        assert!(!admission.admitted);
        assert!(state.is_empty());
    }

    #[test]
    fn reservations_count_regardless_of_age() {
        let mut state = LedgerState::new();
        state.reserve(&ledger(), MINUTE, dec!(3), dec!(10), 0);
        assert_eq!(state.spent(MINUTE, 3_600_000), dec!(3));
    }

    #[test]
    fn commit_replaces_estimate_with_actual() {
        let mut state = LedgerState::new();
        let id = state.reserve(&ledger(), None, dec!(1.00), dec!(10), 0).reservation.unwrap();
        assert_eq!(state.spent(None, 0), dec!(1.00));

        let settled = state.commit(&id, dec!(0.40), 5, &SettlementPolicy::default()).unwrap();
        assert_eq!(settled.recorded, Some(dec!(0.40)));
        assert_eq!(settled.overrun, None);
        assert_eq!(state.spent(None, 5), dec!(0.40));
    }

    #[test]
    fn commit_timestamp_follows_policy() {
        let mut state = LedgerState::new();
        let first = state.reserve(&ledger(), None, dec!(1), dec!(10), 1_000).reservation.unwrap();
        let second = state.reserve(&ledger(), None, dec!(1), dec!(10), 1_000).reservation.unwrap();

        state.commit(&first, dec!(1), 9_000, &SettlementPolicy::default()).unwrap();
        let committed_at = SettlementPolicy {
            timestamp: CommitTimestamp::Committed,
            ..SettlementPolicy::default()
        };
        state.commit(&second, dec!(1), 9_000, &committed_at).unwrap();

        let stamps: Vec<u64> = state.entries().iter().map(|e| e.timestamp_ms).collect();
        assert_eq!(stamps, vec![1_000, 9_000]);
    }

    #[test]
    fn overrun_policies() {
        let policy = |overrun| SettlementPolicy { overrun, ..SettlementPolicy::default() };

        let mut state = LedgerState::new();
        let id = state.reserve(&ledger(), None, dec!(1), dec!(10), 0).reservation.unwrap();
        let settled = state.commit(&id, dec!(1.5), 0, &policy(OverrunPolicy::Record)).unwrap();
        assert_eq!(settled.recorded, Some(dec!(1.5)));
        assert_eq!(settled.overrun, Some(dec!(0.5)));

        let id = state.reserve(&ledger(), None, dec!(1), dec!(10), 0).reservation.unwrap();
        let settled = state.commit(&id, dec!(1.5), 0, &policy(OverrunPolicy::Clamp)).unwrap();
        assert_eq!(settled.recorded, Some(dec!(1)));
        assert_eq!(settled.overrun, Some(dec!(0.5)));

        let id = state.reserve(&ledger(), None, dec!(1), dec!(10), 0).reservation.unwrap();
        let err = state.commit(&id, dec!(1.5), 0, &policy(OverrunPolicy::Reject)).unwrap_err();
        assert!(matches!(err, LifecycleError::CommitExceedsEstimate { .. }));
        assert!(state.reservation(&id).unwrap().is_active());
    }

    #[test]
    fn double_resolve_is_rejected_without_mutation() {
        let mut state = LedgerState::new();
        let id = state.reserve(&ledger(), None, dec!(1), dec!(10), 0).reservation.unwrap();
        state.commit(&id, dec!(1), 0, &SettlementPolicy::default()).unwrap();

        let err = state.commit(&id, dec!(1), 0, &SettlementPolicy::default()).unwrap_err();
        assert_eq!(
            err,
            LifecycleError::ReservationAlreadyResolved { id, state: ReservationState::Committed }
        );
        assert!(state.release(&id, 0).is_err());
        assert_eq!(state.entries().len(), 1);
    }

    #[test]
    fn unknown_reservation_is_not_found() {
        let mut state = LedgerState::new();
        let id = ReservationId::new();
        assert_eq!(
            state.release(&id, 0).unwrap_err(),
            LifecycleError::ReservationNotFound { id }
        );
    }

    #[test]
    fn ttl_releases_orphaned_reservations() {
        let mut state = LedgerState::new();
        let id = state.reserve(&ledger(), None, dec!(5), dec!(5), 0).reservation.unwrap();
        let options = StoreOptions::default()
            .with_reservation_ttl(Duration::from_secs(30))
            .unwrap();

        state.maintain(&options, 30_000);
        assert!(state.reservation(&id).unwrap().is_active());

        state.maintain(&options, 30_001);
        assert_eq!(state.reservation(&id).unwrap().state, ReservationState::Released);
        assert_eq!(state.spent(None, 30_001), dec!(0));
    }

    #[test]
    fn prune_keeps_active_reservations() {
        let mut state = LedgerState::new();
        state.check_and_commit(None, dec!(1), dec!(10), 0);
        state.check_and_commit(None, dec!(1), dec!(10), 10_000);
        let active = state.reserve(&ledger(), None, dec!(1), dec!(10), 0).reservation.unwrap();
        let released = state.reserve(&ledger(), None, dec!(1), dec!(10), 0).reservation.unwrap();
        state.release(&released, 1).unwrap();

        let pruned = state.prune(5_000);
        assert_eq!(pruned.entries, 1);
        assert_eq!(pruned.reservations, vec![released]);
        assert!(state.reservation(&active).is_some());
    }

    #[test]
    fn resolved_reservations_are_dropped_after_grace() {
        let mut state = LedgerState::new();
        let options = StoreOptions::default()
            .with_resolved_retention(Duration::from_secs(10))
            .unwrap();
        let id = state.reserve(&ledger(), None, dec!(1), dec!(10), 0).reservation.unwrap();
        state.release(&id, 1_000).unwrap();

        assert!(state.maintain(&options, 11_000).reservations.is_empty());
        assert!(state.reservation(&id).is_some());

        assert_eq!(state.maintain(&options, 11_001).reservations, vec![id]);
        assert!(state.is_empty());
    }

    #[test]
    fn overflowing_total_never_fits() {
        let mut state = LedgerState::new();
        assert!(state.check_and_commit(None, Amount::MAX, Amount::MAX, 0).admitted);
        assert!(!state.check_and_commit(None, dec!(1), Amount::MAX, 0).admitted);
    }
}
