// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! File-based JSON spend store.
//!
//! [`FileStore`] persists every ledger's spend state to a single JSON file
//! on disk.  Every mutation flushes the file atomically (write-rename) so
//! that a crash mid-write does not corrupt existing data.
//!
//! ## Layout
//!
//! ```json
//! {
//!   "ledgers": [
//!     {
//!       "ledger": { "namespace": "...", "resource": "...", "principal": "..." },
//!       "state":  { "entries": [...], "reservations": { "<id>": Reservation } }
//!     }
//!   ]
//! }
//! ```
//!
//! Ledgers are identified by their structured fields, never by a joined
//! string key.  A ledger whose state becomes empty is dropped from the file.
//!
//! ## Durability
//!
//! A mutation is applied to a copy of the ledger's state, swapped in, and
//! flushed.  If the flush fails the previous state is restored and the
//! operation returns [`StoreError`], so the engine resolves it through the
//! budget's failure policy; no ALLOW is ever granted on unpersisted state.
//!
//! ## Caveats
//!
//! * One process-wide mutex serialises all ledgers, and every mutation
//!   rewrites the whole file.  It is not intended for high-frequency write
//!   workloads.
//! * Concurrent access from multiple processes is not supported.  Use a
//!   database-backed [`SpendStore`] for multi-process deployments.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use budgetgate_core::config::{SettlementPolicy, StoreOptions};
use budgetgate_core::error::{LifecycleError, SettleError, StoreError};
use budgetgate_core::storage::{Admission, LedgerState, Settled, SpendStore};
use budgetgate_core::types::{Amount, Ledger, Reservation, ReservationId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Snapshot of all spend state, serialised to / deserialised from disk.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default, with = "ledger_records")]
    ledgers: BTreeMap<Ledger, LedgerState>,
}

/// (De)serialises the ledger map as a list of `{ ledger, state }` records.
mod ledger_records {
    use std::collections::BTreeMap;

    use budgetgate_core::storage::LedgerState;
    use budgetgate_core::types::Ledger;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize)]
    struct RecordRef<'a> {
        ledger: &'a Ledger,
        state: &'a LedgerState,
    }

    #[derive(Deserialize)]
    struct Record {
        ledger: Ledger,
        state: LedgerState,
    }

    pub fn serialize<S: Serializer>(
        ledgers: &BTreeMap<Ledger, LedgerState>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(ledgers.iter().map(|(ledger, state)| RecordRef { ledger, state }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<Ledger, LedgerState>, D::Error> {
        let records = Vec::<Record>::deserialize(deserializer)?;
        Ok(records.into_iter().map(|record| (record.ledger, record.state)).collect())
    }
}

struct Inner {
    snapshot: Snapshot,
    /// Reservation id to ledger.  Rebuilt on open, never persisted.
    index: HashMap<ReservationId, Ledger>,
}

/// A file-backed [`SpendStore`] that persists state as JSON.
///
/// # Examples
///
/// ```rust,no_run
/// use budgetgate_std::storage::file::FileStore;
/// use budgetgate_core::{Amount, Ledger, SpendStore, StoreOptions};
///
/// let store = FileStore::open("/tmp/spend.json", StoreOptions::default())
///     .expect("could not open store");
///
/// let ledger = Ledger::global("openai", "embedding");
/// store.atomic_check_and_commit(&ledger, None, Amount::ONE, Amount::TEN, 0).unwrap();
/// assert_eq!(store.spent(&ledger, None, 0).unwrap(), Amount::ONE);
/// ```
pub struct FileStore {
    path: PathBuf,
    options: StoreOptions,
    inner: Mutex<Inner>,
}

impl FileStore {
    /// Open an existing JSON spend file, or start empty if the path does not
    /// exist.  Nothing is written until the first mutation.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] if the file exists but cannot be read, and
    /// [`StoreError::Corrupt`] if its JSON does not decode.
    pub fn open<P: AsRef<Path>>(path: P, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let snapshot: Snapshot = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw).map_err(|error| StoreError::Corrupt {
                message: format!("{}: {}", path.display(), error),
            })?
        } else {
            Snapshot::default()
        };

        debug!(path = %path.display(), ledgers = snapshot.ledgers.len(), "opened spend file");

        let mut inner = Inner { snapshot, index: HashMap::new() };
        inner.rebuild_index();
        Ok(Self { path, options, inner: Mutex::new(inner) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of ledgers with persisted state.
    pub fn ledger_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.snapshot.ledgers.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::unavailable(format!("lock for {} poisoned", self.path.display())))
    }

    fn settle(
        &self,
        id: &ReservationId,
        now_ms: u64,
        op: impl FnOnce(&mut LedgerState) -> Result<Settled, LifecycleError>,
    ) -> Result<Settled, SettleError> {
        let mut inner = self.lock()?;
        let ledger = inner
            .index
            .get(id)
            .cloned()
            .ok_or(LifecycleError::ReservationNotFound { id: *id })?;
        let settled = inner.apply_maintained(&self.path, &self.options, &ledger, now_ms, op)??;
        Ok(settled)
    }
}

impl Inner {
    /// [`apply`](Self::apply) after the deployment's TTL and retention.
    fn apply_maintained<T>(
        &mut self,
        path: &Path,
        options: &StoreOptions,
        ledger: &Ledger,
        now_ms: u64,
        op: impl FnOnce(&mut LedgerState) -> T,
    ) -> Result<T, StoreError> {
        self.apply(path, ledger, |state| {
            state.maintain(options, now_ms);
            op(state)
        })
    }

    /// Run `op` on a copy of the ledger's state, then swap it in and flush.
    /// A failed flush restores the previous state.
    fn apply<T>(
        &mut self,
        path: &Path,
        ledger: &Ledger,
        op: impl FnOnce(&mut LedgerState) -> T,
    ) -> Result<T, StoreError> {
        let previous = self.snapshot.ledgers.get(ledger).cloned();
        let mut next = previous.clone().unwrap_or_default();
        let output = op(&mut next);

        let unchanged = match &previous {
            Some(state) => *state == next,
            None => next.is_empty(),
        };
        if unchanged {
            return Ok(output);
        }

        if next.is_empty() {
            self.snapshot.ledgers.remove(ledger);
        } else {
            self.snapshot.ledgers.insert(ledger.clone(), next);
        }
        if let Err(error) = flush(path, &self.snapshot) {
            warn!(ledger = %ledger, error = %error, "flush failed; rolling back ledger state");
            match previous {
                Some(state) => {
                    self.snapshot.ledgers.insert(ledger.clone(), state);
                }
                None => {
                    self.snapshot.ledgers.remove(ledger);
                }
            }
            return Err(error);
        }

        self.reindex(ledger, previous.as_ref());
        Ok(output)
    }

    fn reindex(&mut self, ledger: &Ledger, previous: Option<&LedgerState>) {
        if let Some(state) = previous {
            for reservation in state.reservations() {
                self.index.remove(&reservation.id);
            }
        }
        if let Some(state) = self.snapshot.ledgers.get(ledger) {
            for reservation in state.reservations() {
                self.index.insert(reservation.id, ledger.clone());
            }
        }
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (ledger, state) in &self.snapshot.ledgers {
            for reservation in state.reservations() {
                self.index.insert(reservation.id, ledger.clone());
            }
        }
    }
}

/// Write the snapshot to `<path>.tmp`, then rename it over the target, so a
/// crash during the write never leaves a partial file.
fn flush(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(snapshot).map_err(|error| StoreError::Corrupt {
        message: format!("spend state serialisation error: {error}"),
    })?;

    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

impl SpendStore for FileStore {
    fn atomic_check_and_commit(
        &self,
        ledger: &Ledger,
        window: Option<Duration>,
        amount: Amount,
        max_spend: Amount,
        now_ms: u64,
    ) -> Result<Admission, StoreError> {
        self.lock()?.apply_maintained(&self.path, &self.options, ledger, now_ms, |state| {
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
        self.lock()?.apply_maintained(&self.path, &self.options, ledger, now_ms, |state| {
            state.reserve(ledger, window, estimate, max_spend, now_ms)
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
        self.lock()?
            .apply_maintained(&self.path, &self.options, ledger, now_ms, |state| state.spent(window, now_ms))
    }

    fn reservation(&self, id: &ReservationId) -> Result<Option<Reservation>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .index
            .get(id)
            .and_then(|ledger| inner.snapshot.ledgers.get(ledger))
            .and_then(|state| state.reservation(id))
            .cloned())
    }

    fn prune(&self, ledger: &Ledger, horizon_ms: u64) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        if !inner.snapshot.ledgers.contains_key(ledger) {
            return Ok(0);
        }
        let entries = inner.apply(&self.path, ledger, |state| state.prune(horizon_ms).entries)?;
        debug!(ledger = %ledger, entries, "pruned ledger");
        Ok(entries)
    }

    fn clear(&self, ledger: &Ledger) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let Some(previous) = inner.snapshot.ledgers.remove(ledger) else {
            return Ok(());
        };
        if let Err(error) = flush(&self.path, &inner.snapshot) {
            inner.snapshot.ledgers.insert(ledger.clone(), previous);
            return Err(error);
        }
        for reservation in previous.reservations() {
            inner.index.remove(&reservation.id);
        }
        Ok(())
    }

    fn clear_all(&self) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let previous = std::mem::take(&mut inner.snapshot);
        if let Err(error) = flush(&self.path, &inner.snapshot) {
            inner.snapshot = previous;
            return Err(error);
        }
        inner.rebuild_index();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn missing_file_opens_empty_and_reads_do_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spend.json");
        let store = FileStore::open(&path, StoreOptions::default()).unwrap();

        assert_eq!(store.spent(&Ledger::global("a", "r"), None, 0).unwrap(), dec!(0));
        assert_eq!(store.ledger_count().unwrap(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn blocked_request_does_not_rewrite_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spend.json");
        let store = FileStore::open(&path, StoreOptions::default()).unwrap();
        let ledger = Ledger::global("a", "r");

        store.atomic_check_and_commit(&ledger, None, dec!(1), dec!(1), 0).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        let admission = store.atomic_check_and_commit(&ledger, None, dec!(1), dec!(1), 1).unwrap();
        assert!(!admission.admitted);
        assert_eq!(fs::read_to_string(&path).unwrap(), written);
    }

    #[test]
    fn clear_all_drops_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("spend.json"), StoreOptions::default()).unwrap();
        let ledger = Ledger::global("a", "r");
        let id = store.reserve(&ledger, None, dec!(1), dec!(5), 0).unwrap().reservation.unwrap();

        store.clear_all().unwrap();
        assert_eq!(store.reservation(&id).unwrap(), None);
        assert!(matches!(
            store.release(&id, 1),
            Err(SettleError::Lifecycle(LifecycleError::ReservationNotFound { .. }))
        ));
    }

    #[test]
    fn ledgers_with_separators_in_fields_stay_apart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spend.json");
        let store = FileStore::open(&path, StoreOptions::default()).unwrap();
        let first = Ledger::new("openai", "gpt-4:user", "1");
        let second = Ledger::new("openai", "gpt-4", "user:1");

        assert!(store.atomic_check_and_commit(&first, None, dec!(5), dec!(5), 0).unwrap().admitted);
        assert!(store.atomic_check_and_commit(&second, None, dec!(1), dec!(5), 0).unwrap().admitted);
        assert_eq!(store.ledger_count().unwrap(), 2);

        let reopened = FileStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(reopened.spent(&first, None, 0).unwrap(), dec!(5));
        assert_eq!(reopened.spent(&second, None, 0).unwrap(), dec!(1));
    }

    #[test]
    fn emptied_ledger_is_dropped_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spend.json");
        let store = FileStore::open(&path, StoreOptions::default()).unwrap();
        let ledger = Ledger::global("a", "r");

        store.atomic_check_and_commit(&ledger, None, dec!(1), dec!(5), 0).unwrap();
        assert_eq!(store.prune(&ledger, 1).unwrap(), 1);
        assert_eq!(store.ledger_count().unwrap(), 0);
        assert_eq!(FileStore::open(&path, StoreOptions::default()).unwrap().ledger_count().unwrap(), 0);
    }
}
