// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Shared data types used by the engine and every storage backend.
//!
//! Value types ([`Ledger`], [`Budget`], [`Decision`]) are immutable once
//! built and implement [`serde::Serialize`] so decisions can be composed into
//! external audit records without extra conversion.  Decimal fields
//! serialise as strings, which keeps them exact across JSON boundaries.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GateError;

/// Exact decimal amount used for every spend, limit and estimate.
///
/// No floating point is involved anywhere on the decision path:
///
/// ```rust
/// use std::str::FromStr;
/// use budgetgate_core::types::Amount;
///
/// let tenth = Amount::from_str("0.1").unwrap();
/// let total = (0..10).fold(Amount::ZERO, |acc, _| acc + tenth);
/// assert_eq!(total, Amount::ONE);
/// ```
pub type Amount = Decimal;

/// Principal used by [`Ledger::global`].
pub const GLOBAL_PRINCIPAL: &str = "global";

/// Default rolling window applied by [`Budget::hourly`]: one hour.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Identity of one independently tracked spend stream.
///
/// Equality is structural over all three fields.  A ledger is only ever a
/// lookup key; it has no state of its own.
///
/// # Examples
///
/// ```rust
/// use budgetgate_core::types::Ledger;
///
/// let per_user = Ledger::new("openai", "gpt-4", "user:123");
/// let shared   = Ledger::global("infra", "compute");
///
/// assert_eq!(per_user.to_string(), "openai:gpt-4@user:123");
/// assert_eq!(shared.principal, "global");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ledger {
    /// Top-level grouping, usually the vendor or subsystem.
    pub namespace: String,
    /// The billed resource within the namespace.
    pub resource: String,
    /// Who the spend is attributed to (user, team, tenant, ...).
    pub principal: String,
}

impl Ledger {
    /// Build a ledger from its three identity fields.
    pub fn new(
        namespace: impl Into<String>,
        resource: impl Into<String>,
        principal: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            resource: resource.into(),
            principal: principal.into(),
        }
    }

    /// A ledger shared by every caller of `namespace:resource`.
    pub fn global(namespace: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::new(namespace, resource, GLOBAL_PRINCIPAL)
    }

    /// Serialised identity used as the key by key-value backends.
    ///
    /// `%` and `:` inside a field are percent-escaped, so distinct ledgers
    /// always map to distinct keys.
    ///
    /// ```rust
    /// use budgetgate_core::types::Ledger;
    /// assert_eq!(Ledger::new("a", "r", "p").key(), "bg:a:r:p");
    /// assert_eq!(Ledger::new("a", "r", "user:1").key(), "bg:a:r:user%3A1");
    /// ```
    pub fn key(&self) -> String {
        format!(
            "bg:{}:{}:{}",
            escape_key_part(&self.namespace),
            escape_key_part(&self.resource),
            escape_key_part(&self.principal),
        )
    }
}

fn escape_key_part(part: &str) -> Cow<'_, str> {
    if part.contains([':', '%']) {
        Cow::Owned(part.replace('%', "%25").replace(':', "%3A"))
    } else {
        Cow::Borrowed(part)
    }
}

impl fmt::Display for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.namespace, self.resource, self.principal)
    }
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// How a BLOCK decision is surfaced at the call boundary.
///
/// The engine itself always returns a [`Decision`]; mode only matters to
/// [`enforce`](crate::enforce::enforce) and the guard helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// A blocked spend becomes an error at the boundary.
    #[default]
    Hard,
    /// A blocked spend is returned as a plain value for the caller to handle.
    Soft,
}

/// What to do when the spend store cannot complete an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreErrorMode {
    /// Block the spend.
    #[default]
    FailClosed,
    /// Allow the spend, tagged with [`BlockReason::StoreError`].
    FailOpen,
}

/// Spend policy for one evaluation.
///
/// A budget is a value, not an identity: two calls against the same ledger
/// with different budgets evaluate independently over the same spend state.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use budgetgate_core::types::{Amount, Budget, Mode};
///
/// let budget = Budget::new(Amount::new(5000, 2), Some(Duration::from_secs(60)))
///     .unwrap()
///     .with_mode(Mode::Soft);
/// assert_eq!(budget.max_spend.to_string(), "50.00");
///
/// assert!(Budget::new(Amount::NEGATIVE_ONE, None).is_err());
/// assert!(Budget::new(Amount::ONE, Some(Duration::ZERO)).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum spend allowed inside the window.
    pub max_spend: Amount,
    /// Trailing window; `None` means an unbounded lifetime budget.
    pub window: Option<Duration>,
    /// Boundary behaviour for BLOCK decisions.
    #[serde(default)]
    pub mode: Mode,
    /// Failure policy applied when the store errors.
    #[serde(default)]
    pub on_store_error: StoreErrorMode,
}

impl Budget {
    /// Validated constructor with the default mode ([`Mode::Hard`]) and
    /// failure policy ([`StoreErrorMode::FailClosed`]).
    pub fn new(max_spend: Amount, window: Option<Duration>) -> Result<Self, GateError> {
        let budget = Self {
            max_spend,
            window,
            mode: Mode::default(),
            on_store_error: StoreErrorMode::default(),
        };
        budget.validate()?;
        Ok(budget)
    }

    /// A budget with the default one-hour window.
    pub fn hourly(max_spend: Amount) -> Result<Self, GateError> {
        Self::new(max_spend, Some(DEFAULT_WINDOW))
    }

    /// A lifetime budget that admits any representable spend.
    ///
    /// Used for ledgers with no registered budget when
    /// [`EngineConfig::pass_on_unregistered`](crate::config::EngineConfig) is set.
    pub fn unlimited() -> Self {
        Self {
            max_spend: Amount::MAX,
            window: None,
            mode: Mode::default(),
            on_store_error: StoreErrorMode::default(),
        }
    }

    /// Replace the boundary mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Replace the store failure policy.
    pub fn with_store_error_mode(mut self, on_store_error: StoreErrorMode) -> Self {
        self.on_store_error = on_store_error;
        self
    }

    /// Reject negative limits and zero-length windows.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.max_spend < Amount::ZERO {
            return Err(GateError::invalid("max_spend", "must be >= 0"));
        }
        if matches!(self.window, Some(window) if window.is_zero()) {
            return Err(GateError::invalid("window", "must be > 0 or unbounded"));
        }
        Ok(())
    }

    /// Window length in milliseconds, rounded up so sub-millisecond windows
    /// still cover the current millisecond.
    pub fn window_ms(&self) -> Option<u64> {
        self.window.map(window_to_ms)
    }
}

/// Convert a window to whole milliseconds, never rounding a non-zero window
/// down to zero.
pub(crate) fn window_to_ms(window: Duration) -> u64 {
    let millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 && !window.is_zero() {
        1
    } else {
        millis
    }
}

// ---------------------------------------------------------------------------
// Spend state
// ---------------------------------------------------------------------------

/// A committed, completed spend.  Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendEntry {
    /// Amount spent.
    pub amount: Amount,
    /// Unix epoch milliseconds the entry is dated at for window membership.
    pub timestamp_ms: u64,
}

/// Opaque identifier of a [`Reservation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ReservationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Lifecycle state of a reservation.
///
/// `Active -> Committed` and `Active -> Released` are the only transitions;
/// both targets are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Holding headroom; counts fully toward spend.
    Active,
    /// Replaced by a committed [`SpendEntry`].
    Committed,
    /// Dropped with no spend recorded.
    Released,
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservationState::Active    => write!(f, "active"),
            ReservationState::Committed => write!(f, "committed"),
            ReservationState::Released  => write!(f, "released"),
        }
    }
}

/// A provisional hold on budget headroom for a cost not yet known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Identifier handed to the caller for commit/release.
    pub id: ReservationId,
    /// Ledger whose headroom is held.
    pub ledger: Ledger,
    /// The reserved estimate (the enforced upper bound).
    pub amount: Amount,
    /// Unix epoch milliseconds at which the reservation was granted.
    pub created_at_ms: u64,
    /// Current lifecycle state.
    pub state: ReservationState,
    /// When the reservation left `Active`, if it has.
    pub resolved_at_ms: Option<u64>,
}

impl Reservation {
    /// Whether the reservation still counts toward spend.
    pub fn is_active(&self) -> bool {
        self.state == ReservationState::Active
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Allow,
    Block,
}

/// Why a decision carries a reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    /// `spent + requested` would exceed `max_spend`.
    BudgetExceeded,
    /// The store could not evaluate; the failure policy decided the status.
    StoreError,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::BudgetExceeded => write!(f, "BUDGET_EXCEEDED"),
            BlockReason::StoreError     => write!(f, "STORE_ERROR"),
        }
    }
}

/// Immutable result of evaluating a spend against its budget.
///
/// Every field is always populated.  `spent_in_window` is reported after the
/// decision took effect: it includes `requested` on ALLOW and excludes it on
/// BLOCK.  `remaining` is `max(0, max_spend - spent_in_window)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub status: Status,
    pub ledger: Ledger,
    pub budget: Budget,
    /// `None` for a normal ALLOW; set on every BLOCK and on store-error ALLOWs.
    pub reason: Option<BlockReason>,
    /// Human-readable detail for logs.
    pub message: Option<String>,
    pub spent_in_window: Amount,
    pub requested: Amount,
    pub remaining: Amount,
    /// Present only on a bounded-cost ALLOW that created a reservation.
    pub reservation: Option<ReservationId>,
    /// Unix epoch milliseconds at which the decision was taken.
    pub decided_at_ms: u64,
}

impl Decision {
    /// `true` when the spend may proceed.
    pub fn allowed(&self) -> bool {
        self.status == Status::Allow
    }

    /// `true` when the spend must not proceed.
    pub fn blocked(&self) -> bool {
        self.status == Status::Block
    }

    /// `true` when the outcome came from the failure policy rather than from
    /// the budget itself.
    pub fn is_store_error(&self) -> bool {
        self.reason == Some(BlockReason::StoreError)
    }
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

/// Result of resolving a reservation through
/// [`Engine::commit`](crate::engine::Engine::commit) or
/// [`Engine::release`](crate::engine::Engine::release).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Settlement {
    /// The reservation was replaced by a spend entry of `recorded`.
    Committed {
        reservation_id: ReservationId,
        ledger: Ledger,
        reserved: Amount,
        recorded: Amount,
        /// `actual - estimate` when the caller reported more than it reserved.
        overrun: Option<Amount>,
    },
    /// The reservation was dropped with no spend recorded.
    Released {
        reservation_id: ReservationId,
        ledger: Ledger,
        reserved: Amount,
    },
    /// The store failed; the reservation was left as it was.
    Unsettled {
        reservation_id: ReservationId,
        message: String,
    },
}

impl Settlement {
    /// The reservation this settlement refers to.
    pub fn reservation_id(&self) -> ReservationId {
        match self {
            Settlement::Committed { reservation_id, .. }
            | Settlement::Released { reservation_id, .. }
            | Settlement::Unsettled { reservation_id, .. } => *reservation_id,
        }
    }

    /// `false` only for [`Settlement::Unsettled`].
    pub fn is_settled(&self) -> bool {
        !matches!(self, Settlement::Unsettled { .. })
    }
}
