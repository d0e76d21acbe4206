// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Engine-level and store-level configuration.
//!
//! [`EngineConfig`] tunes the decision engine at construction time and
//! [`StoreOptions`] tunes the bundled stores.  All fields have defaults so
//! `Default::default()` is always a valid starting point.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GateError;
use crate::types::Budget;

/// What a commit does when `actual` exceeds the reserved estimate.
///
/// The estimate was the enforced upper bound, so an overrun is a caller
/// policy violation the engine cannot prevent; it can only choose how to
/// account for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrunPolicy {
    /// Record the actual amount and flag the overrun on the settlement.
    /// The ledger may sit above `max_spend` until the window rolls.
    #[default]
    Record,
    /// Record the estimate instead of the actual amount and flag the overrun.
    Clamp,
    /// Fail the commit; the reservation stays active.
    Reject,
}

/// Which instant a committed spend entry is dated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitTimestamp {
    /// The reservation's creation time: the entry ages out exactly when the
    /// headroom it replaced would have.
    #[default]
    Reserved,
    /// The time of the commit call.
    Committed,
}

/// Rules applied when a reservation is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SettlementPolicy {
    #[serde(default)]
    pub overrun: OverrunPolicy,
    #[serde(default)]
    pub timestamp: CommitTimestamp,
}

/// Top-level configuration for [`Engine`](crate::engine::Engine).
///
/// # Examples
///
/// ```rust
/// use budgetgate_core::config::{EngineConfig, OverrunPolicy, SettlementPolicy};
///
/// let config = EngineConfig {
///     pass_on_unregistered: false,
///     settlement: SettlementPolicy {
///         overrun: OverrunPolicy::Reject,
///         ..SettlementPolicy::default()
///     },
/// };
/// assert!(!config.pass_on_unregistered);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// When `true`, a registry lookup for a ledger with no registered budget
    /// evaluates against [`Budget::unlimited`](crate::types::Budget::unlimited).
    /// When `false`, the lookup fails with
    /// [`GateError::UnregisteredLedger`](crate::error::GateError).
    /// Defaults to `true`.
    #[serde(default = "default_pass_on_unregistered")]
    pub pass_on_unregistered: bool,

    /// Commit accounting rules.
    #[serde(default)]
    pub settlement: SettlementPolicy,
}

fn default_pass_on_unregistered() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pass_on_unregistered: default_pass_on_unregistered(),
            settlement: SettlementPolicy::default(),
        }
    }
}

/// How long a committed or released reservation is kept for inspection and
/// for rejecting a second commit or release, unless configured otherwise.
pub const DEFAULT_RESOLVED_RETENTION: Duration = Duration::from_secs(3600);

/// Deployment options shared by the bundled stores.
///
/// Committed spend entries are never deleted unless `retention` is set or
/// [`Engine::prune`](crate::engine::Engine::prune) is called, so long-lived
/// deployments must do one or the other to keep state bounded.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use budgetgate_core::config::StoreOptions;
///
/// let options = StoreOptions::default()
///     .with_reservation_ttl(Duration::from_secs(300))
///     .unwrap()
///     .with_retention(Duration::from_secs(86_400))
///     .unwrap();
/// assert_eq!(options.retention, Some(Duration::from_secs(86_400)));
///
/// assert!(StoreOptions::default().with_retention(Duration::ZERO).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Active reservations older than this are released lazily by the next
    /// operation on their ledger.  `None` keeps them until resolved.
    #[serde(default)]
    pub reservation_ttl: Option<Duration>,

    /// Spend entries older than this are physically deleted during normal
    /// operations.  Must be at least the longest window any budget uses on
    /// the store, and must stay unset if any budget is unbounded.
    #[serde(default)]
    pub retention: Option<Duration>,

    /// Resolved reservations older than this are dropped.  Within it, a
    /// second commit or release fails with `ReservationAlreadyResolved`;
    /// after it, with `ReservationNotFound`.
    #[serde(default = "default_resolved_retention")]
    pub resolved_retention: Duration,
}

fn default_resolved_retention() -> Duration {
    DEFAULT_RESOLVED_RETENTION
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            reservation_ttl: None,
            retention: None,
            resolved_retention: default_resolved_retention(),
        }
    }
}

impl StoreOptions {
    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Result<Self, GateError> {
        positive("reservation_ttl", ttl)?;
        self.reservation_ttl = Some(ttl);
        Ok(self)
    }

    pub fn with_retention(mut self, retention: Duration) -> Result<Self, GateError> {
        positive("retention", retention)?;
        self.retention = Some(retention);
        Ok(self)
    }

    pub fn with_resolved_retention(mut self, resolved_retention: Duration) -> Result<Self, GateError> {
        positive("resolved_retention", resolved_retention)?;
        self.resolved_retention = resolved_retention;
        Ok(self)
    }

    /// Reject zero durations, which would reclaim or delete state
    /// immediately.
    pub fn validate(&self) -> Result<(), GateError> {
        if let Some(ttl) = self.reservation_ttl {
            positive("reservation_ttl", ttl)?;
        }
        if let Some(retention) = self.retention {
            positive("retention", retention)?;
        }
        positive("resolved_retention", self.resolved_retention)
    }

    /// Fail if `retention` would delete spend that `budget` still counts.
    pub fn check_covers(&self, budget: &Budget) -> Result<(), GateError> {
        match (self.retention, budget.window) {
            (Some(_), None) => Err(GateError::invalid(
                "retention",
                "must be unset when a budget has an unbounded window",
            )),
            (Some(retention), Some(window)) if retention < window => Err(GateError::invalid(
                "retention",
                "must be at least every budget window",
            )),
            _ => Ok(()),
        }
    }
}

fn positive(field: &str, duration: Duration) -> Result<(), GateError> {
    if duration.is_zero() {
        return Err(GateError::invalid(field, "must be > 0"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn zero_durations_are_rejected() {
        let options = StoreOptions::default();
        assert!(options.with_reservation_ttl(Duration::ZERO).is_err());
        assert!(options.with_retention(Duration::ZERO).is_err());
        assert!(options.with_resolved_retention(Duration::ZERO).is_err());

        let hand_built = StoreOptions { retention: Some(Duration::ZERO), ..options };
        assert!(hand_built.validate().is_err());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn retention_must_cover_budget_windows() {
        let options = StoreOptions::default()
            .with_retention(Duration::from_secs(3600))
            .unwrap();
        let hour = Budget::hourly(dec!(1)).unwrap();
        let day = Budget::new(dec!(1), Some(Duration::from_secs(86_400))).unwrap();
        let lifetime = Budget::new(dec!(1), None).unwrap();

        assert!(options.check_covers(&hour).is_ok());
        assert!(options.check_covers(&day).is_err());
        assert!(options.check_covers(&lifetime).is_err());
        assert!(StoreOptions::default().check_covers(&lifetime).is_ok());
    }
}
