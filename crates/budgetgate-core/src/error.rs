// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Error taxonomy.
//!
//! Budget outcomes and store failures are resolved into a
//! [`Decision`](crate::types::Decision) and never appear here as errors.
//! What remains are programming errors in the integration: invalid
//! configuration and reservation lifecycle violations.

use thiserror::Error;

use crate::types::{Amount, Decision, ReservationId, ReservationState};

/// A spend store could not complete an operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend is unreachable, timed out, or its lock was poisoned.
    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    /// Reading or writing persisted state failed.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted state could not be decoded.
    #[error("store data corrupt: {message}")]
    Corrupt { message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        StoreError::Unavailable { message: message.into() }
    }
}

/// A commit or release violated the reservation state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("reservation not found: {id}")]
    ReservationNotFound { id: ReservationId },

    #[error("reservation {id} already resolved ({state})")]
    ReservationAlreadyResolved { id: ReservationId, state: ReservationState },

    /// Only produced under [`OverrunPolicy::Reject`](crate::config::OverrunPolicy).
    #[error("commit of {actual} exceeds the {estimate} reserved by {id}")]
    CommitExceedsEstimate { id: ReservationId, estimate: Amount, actual: Amount },
}

/// Failure of a store-level commit or release.
#[derive(Debug, Error)]
pub enum SettleError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hard failures returned by the [`Engine`](crate::engine::Engine).
#[derive(Debug, Error)]
pub enum GateError {
    /// Rejected before any store interaction.
    #[error("invalid configuration: {field} {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// No budget registered and `pass_on_unregistered` is off.
    #[error("no budget registered for ledger {ledger}")]
    UnregisteredLedger { ledger: String },

    /// Store failure on a path with no failure policy (reads, maintenance).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A background task running engine work did not complete.
    #[error("engine task failed: {0}")]
    TaskFailed(String),
}

impl GateError {
    pub(crate) fn invalid(field: &str, reason: &str) -> Self {
        GateError::InvalidConfiguration {
            field: field.to_owned(),
            reason: reason.to_owned(),
        }
    }
}

/// Boundary error for a blocked spend under [`Mode::Hard`](crate::types::Mode).
#[derive(Debug, Clone, Error)]
#[error("{}", describe_block(.decision))]
pub struct BudgetExceeded {
    pub decision: Box<Decision>,
}

impl BudgetExceeded {
    pub fn new(decision: Decision) -> Self {
        Self { decision: Box::new(decision) }
    }
}

fn describe_block(decision: &Decision) -> String {
    match (&decision.message, decision.reason) {
        (Some(message), _) => message.clone(),
        (None, Some(reason)) => format!("spend blocked on {}: {}", decision.ledger, reason),
        (None, None) => format!("spend blocked on {}", decision.ledger),
    }
}
