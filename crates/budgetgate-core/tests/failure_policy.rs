// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Store-error handling: FAIL_CLOSED / FAIL_OPEN decisions, unsettled
//! settlements, and listener delivery.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use budgetgate_core::{
    config::SettlementPolicy,
    error::SettleError,
    storage::{Admission, Settled},
    Amount, BlockReason, Budget, Decision, Engine, EngineConfig, GateError, GuardError,
    InMemoryStore, Ledger, Reservation, ReservationId, Settlement, SpendStore, Status, StoreError,
    StoreErrorMode,
};
use rust_decimal_macros::dec;

/// An in-memory store that can be switched off.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("connection refused"));
        }
        Ok(())
    }
}

impl SpendStore for FlakyStore {
    fn atomic_check_and_commit(
        &self,
        ledger: &Ledger,
        window: Option<Duration>,
        amount: Amount,
        max_spend: Amount,
        now_ms: u64,
    ) -> Result<Admission, StoreError> {
        self.check()?;
        self.inner.atomic_check_and_commit(ledger, window, amount, max_spend, now_ms)
    }

    fn reserve(
        &self,
        ledger: &Ledger,
        window: Option<Duration>,
        estimate: Amount,
        max_spend: Amount,
        now_ms: u64,
    ) -> Result<Admission, StoreError> {
        self.check()?;
        self.inner.reserve(ledger, window, estimate, max_spend, now_ms)
    }

    fn commit(
        &self,
        id: &ReservationId,
        actual: Amount,
        now_ms: u64,
        policy: &SettlementPolicy,
    ) -> Result<Settled, SettleError> {
        self.check()?;
        self.inner.commit(id, actual, now_ms, policy)
    }

    fn release(&self, id: &ReservationId, now_ms: u64) -> Result<Settled, SettleError> {
        self.check()?;
        self.inner.release(id, now_ms)
    }

    fn spent(&self, ledger: &Ledger, window: Option<Duration>, now_ms: u64) -> Result<Amount, StoreError> {
        self.check()?;
        self.inner.spent(ledger, window, now_ms)
    }

    fn reservation(&self, id: &ReservationId) -> Result<Option<Reservation>, StoreError> {
        self.check()?;
        self.inner.reservation(id)
    }

    fn prune(&self, ledger: &Ledger, horizon_ms: u64) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.prune(ledger, horizon_ms)
    }

    fn clear(&self, ledger: &Ledger) -> Result<(), StoreError> {
        self.check()?;
        self.inner.clear(ledger)
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        self.check()?;
        self.inner.clear_all()
    }
}

fn flaky_engine() -> (Engine<Arc<FlakyStore>>, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::default());
    (Engine::new(EngineConfig::default(), Arc::clone(&store)), store)
}

fn ledger() -> Ledger {
    Ledger::new("openai", "gpt-4", "user:1")
}

#[test]
fn fail_closed_blocks_without_reservation() {
    let (engine, store) = flaky_engine();
    store.set_down(true);
    let budget = Budget::new(dec!(10), None).unwrap();

    for decision in [
        engine.evaluate_fixed(&ledger(), &budget, dec!(1)).unwrap(),
        engine.evaluate_bounded_reserve(&ledger(), &budget, dec!(1)).unwrap(),
    ] {
        assert_eq!(decision.status, Status::Block);
        assert_eq!(decision.reason, Some(BlockReason::StoreError));
        assert!(decision.is_store_error());
        assert_eq!(decision.reservation, None);
        assert_eq!(decision.spent_in_window, dec!(0));
        assert_eq!(decision.remaining, dec!(0));
        assert!(decision.message.unwrap().contains("connection refused"));
    }
}

#[test]
fn fail_open_allows_tagged_with_store_error() {
    let (engine, store) = flaky_engine();
    store.set_down(true);
    let budget = Budget::new(dec!(10), None)
        .unwrap()
        .with_store_error_mode(StoreErrorMode::FailOpen);

    let decision = engine.evaluate_fixed(&ledger(), &budget, dec!(1)).unwrap();
    assert_eq!(decision.status, Status::Allow);
    assert_eq!(decision.reason, Some(BlockReason::StoreError));

    let decision = engine.evaluate_bounded_reserve(&ledger(), &budget, dec!(1)).unwrap();
    assert!(decision.allowed());
    assert_eq!(decision.reservation, None);

    store.set_down(false);
    assert_eq!(engine.spent(&ledger(), None).unwrap(), dec!(0));
}

#[test]
fn settlement_during_outage_is_unsettled_and_retryable() {
    let (engine, store) = flaky_engine();
    let budget = Budget::new(dec!(10), None).unwrap();
    let id = engine
        .evaluate_bounded_reserve(&ledger(), &budget, dec!(3))
        .unwrap()
        .reservation
        .unwrap();

    store.set_down(true);
    let settlement = engine.commit(&id, dec!(2)).unwrap();
    assert!(matches!(settlement, Settlement::Unsettled { reservation_id, .. } if reservation_id == id));
    assert!(!settlement.is_settled());

    store.set_down(false);
    assert!(engine.commit(&id, dec!(2)).unwrap().is_settled());
    assert_eq!(engine.spent(&ledger(), None).unwrap(), dec!(2));
}

#[test]
fn guard_bounded_reports_unsettled_commit() {
    let (engine, store) = flaky_engine();
    let budget = Budget::new(dec!(10), None).unwrap();

    let err = engine
        .guard_bounded(
            &ledger(),
            &budget,
            dec!(3),
            || {
                // The store drops out while the action runs.
                store.set_down(true);
                Ok::<_, String>("answer")
            },
            |_| dec!(1),
        )
        .unwrap_err();

    let GuardError::Unsettled { reservation_id, actual, message } = err else {
        panic!("expected an unsettled guard, got {err:?}");
    };
    assert_eq!(actual, dec!(1));
    assert!(message.contains("connection refused"));

    store.set_down(false);
    assert!(engine.reservation(&reservation_id).unwrap().unwrap().is_active());
    assert!(engine.commit(&reservation_id, actual).unwrap().is_settled());
    assert_eq!(engine.spent(&ledger(), None).unwrap(), dec!(1));
}

#[test]
fn panicking_listener_does_not_lose_the_decision() {
    let (engine, _store) = flaky_engine();
    let after = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&after);
    engine.on_decision(|_| panic!("listener bug"));
    engine.on_decision(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let budget = Budget::new(dec!(10), None).unwrap();
    let decision = engine.evaluate_bounded_reserve(&ledger(), &budget, dec!(4)).unwrap();
    let id = decision.reservation.unwrap();

    assert_eq!(engine.listener_errors(), 1);
    assert_eq!(after.load(Ordering::SeqCst), 1);
    assert_eq!(engine.spent(&ledger(), None).unwrap(), dec!(4));
    engine.release(&id).unwrap();
    assert_eq!(engine.spent(&ledger(), None).unwrap(), dec!(0));
}

#[test]
fn read_paths_surface_store_errors() {
    let (engine, store) = flaky_engine();
    store.set_down(true);
    let budget = Budget::new(dec!(10), None).unwrap();
    assert!(matches!(engine.remaining(&ledger(), &budget), Err(GateError::Store(_))));
    assert!(matches!(engine.clear_all(), Err(GateError::Store(_))));
}

#[test]
fn listeners_observe_every_decision_in_order() {
    let (engine, store) = flaky_engine();
    let seen: Arc<Mutex<Vec<(Status, Option<BlockReason>)>>> = Arc::default();
    let sink = Arc::clone(&seen);
    engine.on_decision(move |decision: &Decision| {
        sink.lock().unwrap().push((decision.status, decision.reason));
    });

    let budget = Budget::new(dec!(1), None).unwrap();
    engine.evaluate_fixed(&ledger(), &budget, dec!(1)).unwrap();
    engine.evaluate_fixed(&ledger(), &budget, dec!(1)).unwrap();
    store.set_down(true);
    engine.evaluate_fixed(&ledger(), &budget, dec!(1)).unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (Status::Allow, None),
            (Status::Block, Some(BlockReason::BudgetExceeded)),
            (Status::Block, Some(BlockReason::StoreError)),
        ]
    );
}

#[test]
fn invalid_input_is_rejected_before_the_store() {
    let (engine, store) = flaky_engine();
    store.set_down(true);
    let budget = Budget::new(dec!(10), None).unwrap();

    // Even with the store down, bad input is an error, not a decision.
    let err = engine.evaluate_fixed(&ledger(), &budget, dec!(-0.01)).unwrap_err();
    assert!(matches!(err, GateError::InvalidConfiguration { .. }));
    assert!(engine.commit(&ReservationId::new(), dec!(-1)).is_err());
}
