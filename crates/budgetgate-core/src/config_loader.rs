// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Configuration loader for [`Engine`](crate::engine::Engine) deployments.
//!
//! Supports two load strategies:
//!
//! 1. **TOML file**: [`load_config`] reads and deserialises a TOML file into
//!    a [`BudgetGateConfig`], including a table of per-ledger budgets.
//! 2. **Environment variables**: [`load_config_from_env`] reads
//!    `BUDGETGATE_`-prefixed variables.  Budgets are not read from the
//!    environment.
//!
//! # File format
//!
//! ```toml
//! pass_on_unregistered = false
//! overrun_policy       = "record"     # "record" | "clamp" | "reject"
//! commit_timestamp     = "reserved"   # "reserved" | "committed"
//! reservation_ttl_secs    = 300
//! retention_secs          = 86400     # >= every window; omit with unbounded budgets
//! resolved_retention_secs = 3600
//!
//! [[budgets]]
//! namespace      = "openai"
//! resource       = "gpt-4"
//! principal      = "user:1"           # defaults to "global"
//! max_spend      = "50.00"            # decimal string, never a float
//! window_secs    = 3600               # defaults to 3600
//! mode           = "hard"             # "hard" | "soft"
//! on_store_error = "fail_closed"      # "fail_closed" | "fail_open"
//!
//! [[budgets]]
//! namespace   = "stripe"
//! resource    = "refund"
//! max_spend   = "1000"
//! window_secs = 86400
//! ```
//!
//! Durations must be positive, and `retention_secs` may not be shorter than
//! any budget window: retention would otherwise delete spend a budget still
//! counts.
//!
//! # Environment variables
//!
//! | Variable                             | Type    | Default    |
//! |--------------------------------------|---------|------------|
//! | `BUDGETGATE_PASS_ON_UNREGISTERED`    | boolean | true       |
//! | `BUDGETGATE_OVERRUN_POLICY`          | string  | "record"   |
//! | `BUDGETGATE_COMMIT_TIMESTAMP`        | string  | "reserved" |
//! | `BUDGETGATE_RESERVATION_TTL_SECS`    | integer | unset      |
//! | `BUDGETGATE_RETENTION_SECS`          | integer | unset      |
//! | `BUDGETGATE_RESOLVED_RETENTION_SECS` | integer | 3600       |

#![cfg(feature = "config-loader")]

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{CommitTimestamp, EngineConfig, OverrunPolicy, SettlementPolicy, StoreOptions};
use crate::engine::Engine;
use crate::error::GateError;
use crate::storage::SpendStore;
use crate::types::{Amount, Budget, Ledger, Mode, StoreErrorMode, DEFAULT_WINDOW, GLOBAL_PRINCIPAL};

// ---------------------------------------------------------------------------
// BudgetGateConfig
// ---------------------------------------------------------------------------

/// Flat, serialisation-friendly deployment configuration.
///
/// Convert with [`engine_config`](Self::engine_config),
/// [`store_options`](Self::store_options) and [`budgets`](Self::budgets)
/// after loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetGateConfig {
    #[serde(default = "default_pass_on_unregistered")]
    pub pass_on_unregistered: bool,

    #[serde(default)]
    pub overrun_policy: OverrunPolicy,

    #[serde(default)]
    pub commit_timestamp: CommitTimestamp,

    /// Seconds before an unresolved reservation is reclaimed.
    #[serde(default)]
    pub reservation_ttl_secs: Option<u64>,

    /// Seconds of spend history kept before physical deletion.
    #[serde(default)]
    pub retention_secs: Option<u64>,

    /// Seconds a committed or released reservation stays inspectable.
    #[serde(default)]
    pub resolved_retention_secs: Option<u64>,

    #[serde(default)]
    pub budgets: Vec<BudgetEntry>,
}

fn default_pass_on_unregistered() -> bool { true }

fn out_of_range(field: &str, secs: u64, err: &GateError) -> ConfigError {
    ConfigError::InvalidRange {
        field:  field.to_owned(),
        value:  secs.to_string(),
        reason: err.to_string(),
    }
}

impl Default for BudgetGateConfig {
    fn default() -> Self {
        Self {
            pass_on_unregistered:    default_pass_on_unregistered(),
            overrun_policy:          OverrunPolicy::default(),
            commit_timestamp:        CommitTimestamp::default(),
            reservation_ttl_secs:    None,
            retention_secs:          None,
            resolved_retention_secs: None,
            budgets:                 Vec::new(),
        }
    }
}

impl BudgetGateConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            pass_on_unregistered: self.pass_on_unregistered,
            settlement: SettlementPolicy {
                overrun:   self.overrun_policy,
                timestamp: self.commit_timestamp,
            },
        }
    }

    /// Build the store options, rejecting zero durations.
    pub fn store_options(&self) -> Result<StoreOptions, ConfigError> {
        let mut options = StoreOptions::default();
        if let Some(secs) = self.reservation_ttl_secs {
            options = options
                .with_reservation_ttl(Duration::from_secs(secs))
                .map_err(|err| out_of_range("reservation_ttl_secs", secs, &err))?;
        }
        if let Some(secs) = self.retention_secs {
            options = options
                .with_retention(Duration::from_secs(secs))
                .map_err(|err| out_of_range("retention_secs", secs, &err))?;
        }
        if let Some(secs) = self.resolved_retention_secs {
            options = options
                .with_resolved_retention(Duration::from_secs(secs))
                .map_err(|err| out_of_range("resolved_retention_secs", secs, &err))?;
        }
        Ok(options)
    }

    /// Check the store options and every budget, and that retention never
    /// deletes spend a configured budget still counts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let options = self.store_options()?;
        for (ledger, budget) in self.budgets()? {
            options.check_covers(&budget).map_err(|err| ConfigError::InvalidRange {
                field:  "retention_secs".into(),
                value:  self.retention_secs.map(|secs| secs.to_string()).unwrap_or_default(),
                reason: format!("{err} (budget {ledger})"),
            })?;
        }
        Ok(())
    }

    /// Validate and convert every budget entry.
    pub fn budgets(&self) -> Result<Vec<(Ledger, Budget)>, ConfigError> {
        self.budgets.iter().map(BudgetEntry::to_budget).collect()
    }

    /// Register every configured budget on `engine`.
    pub fn register_budgets<S: SpendStore>(&self, engine: &Engine<S>) -> Result<usize, ConfigError> {
        let budgets = self.budgets()?;
        let count = budgets.len();
        for (ledger, budget) in budgets {
            let key = ledger.to_string();
            engine.register(ledger, budget).map_err(|err| ConfigError::InvalidRange {
                field:  "budgets".into(),
                value:  key,
                reason: err.to_string(),
            })?;
        }
        Ok(count)
    }
}

/// One `[[budgets]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetEntry {
    pub namespace: String,
    pub resource: String,
    #[serde(default = "default_principal")]
    pub principal: String,
    /// Decimal string, parsed exactly.
    pub max_spend: String,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Ignore `window_secs` and count all history.
    #[serde(default)]
    pub unbounded: bool,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub on_store_error: StoreErrorMode,
}

fn default_principal() -> String { GLOBAL_PRINCIPAL.to_owned() }
fn default_window_secs() -> u64 { DEFAULT_WINDOW.as_secs() }

impl BudgetEntry {
    pub fn to_budget(&self) -> Result<(Ledger, Budget), ConfigError> {
        let ledger = Ledger::new(&self.namespace, &self.resource, &self.principal);
        let field = || format!("budgets[{ledger}]");

        let max_spend = Amount::from_str(self.max_spend.trim()).map_err(|err| ConfigError::ParseField {
            field:  format!("{}.max_spend", field()),
            value:  self.max_spend.clone(),
            reason: err.to_string(),
        })?;
        if max_spend < Amount::ZERO {
            return Err(ConfigError::InvalidRange {
                field:  format!("{}.max_spend", field()),
                value:  self.max_spend.clone(),
                reason: "must be >= 0".into(),
            });
        }

        let window = if self.unbounded {
            None
        } else if self.window_secs == 0 {
            return Err(ConfigError::InvalidRange {
                field:  format!("{}.window_secs", field()),
                value:  "0".into(),
                reason: "must be > 0; set `unbounded = true` for a lifetime budget".into(),
            });
        } else {
            Some(Duration::from_secs(self.window_secs))
        };

        let budget = Budget {
            max_spend,
            window,
            mode: self.mode,
            on_store_error: self.on_store_error,
        };
        Ok((ledger, budget))
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file \"{path}\": {source}")]
    FileRead { path: String, source: std::io::Error },

    #[error("failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("field \"{field}\": cannot parse \"{value}\": {reason}")]
    ParseField { field: String, value: String, reason: String },

    #[error("field \"{field}\": value \"{value}\" out of range: {reason}")]
    InvalidRange { field: String, value: String, reason: String },
}

// ---------------------------------------------------------------------------
// TOML loader
// ---------------------------------------------------------------------------

/// Load a [`BudgetGateConfig`] from a TOML file.
///
/// Budgets and store options are validated eagerly so a bad file fails at
/// startup.
///
/// # Example
///
/// ```rust,no_run
/// use budgetgate_core::config_loader::load_config;
///
/// let config = load_config("/etc/budgetgate/budgets.toml").unwrap();
/// println!("{} budgets", config.budgets.len());
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<BudgetGateConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&content)
}

/// Parse a [`BudgetGateConfig`] from TOML text.
pub fn parse_config(content: &str) -> Result<BudgetGateConfig, ConfigError> {
    let config: BudgetGateConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Environment variable loader
// ---------------------------------------------------------------------------

/// Load a [`BudgetGateConfig`] from `BUDGETGATE_`-prefixed environment
/// variables.  Unset variables fall back to their defaults.
pub fn load_config_from_env() -> Result<BudgetGateConfig, ConfigError> {
    let pass_on_unregistered =
        read_env_bool("BUDGETGATE_PASS_ON_UNREGISTERED", default_pass_on_unregistered())?;

    let overrun_policy = match read_env("BUDGETGATE_OVERRUN_POLICY") {
        Some(val) => parse_overrun_policy(&val)?,
        None => OverrunPolicy::default(),
    };

    let commit_timestamp = match read_env("BUDGETGATE_COMMIT_TIMESTAMP") {
        Some(val) => parse_commit_timestamp(&val)?,
        None => CommitTimestamp::default(),
    };

    let reservation_ttl_secs = read_env_secs("BUDGETGATE_RESERVATION_TTL_SECS")?;
    let retention_secs = read_env_secs("BUDGETGATE_RETENTION_SECS")?;
    let resolved_retention_secs = read_env_secs("BUDGETGATE_RESOLVED_RETENTION_SECS")?;

    Ok(BudgetGateConfig {
        pass_on_unregistered,
        overrun_policy,
        commit_timestamp,
        reservation_ttl_secs,
        retention_secs,
        resolved_retention_secs,
        budgets: Vec::new(),
    })
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn read_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_overrun_policy(val: &str) -> Result<OverrunPolicy, ConfigError> {
    match val.trim().to_ascii_lowercase().as_str() {
        "record" => Ok(OverrunPolicy::Record),
        "clamp"  => Ok(OverrunPolicy::Clamp),
        "reject" => Ok(OverrunPolicy::Reject),
        other => Err(ConfigError::ParseField {
            field:  "BUDGETGATE_OVERRUN_POLICY".into(),
            value:  other.into(),
            reason: "expected one of: record, clamp, reject".into(),
        }),
    }
}

fn parse_commit_timestamp(val: &str) -> Result<CommitTimestamp, ConfigError> {
    match val.trim().to_ascii_lowercase().as_str() {
        "reserved"  => Ok(CommitTimestamp::Reserved),
        "committed" => Ok(CommitTimestamp::Committed),
        other => Err(ConfigError::ParseField {
            field:  "BUDGETGATE_COMMIT_TIMESTAMP".into(),
            value:  other.into(),
            reason: "expected one of: reserved, committed".into(),
        }),
    }
}

/// Positive whole seconds; unset means `None`.
fn read_env_secs(key: &str) -> Result<Option<u64>, ConfigError> {
    let Some(val) = read_env(key) else {
        return Ok(None);
    };
    let secs = val.trim().parse::<u64>().map_err(|source| ConfigError::ParseField {
        field:  key.to_owned(),
        value:  val.clone(),
        reason: source.to_string(),
    })?;
    if secs == 0 {
        return Err(ConfigError::InvalidRange {
            field:  key.to_owned(),
            value:  val,
            reason: "must be > 0; unset the variable to disable".into(),
        });
    }
    Ok(Some(secs))
}

fn read_env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match read_env(key) {
        Some(val) => match val.trim().to_ascii_lowercase().as_str() {
            "true"  | "1" | "yes" | "on"  => Ok(true),
            "false" | "0" | "no"  | "off" => Ok(false),
            other => Err(ConfigError::ParseField {
                field:  key.to_owned(),
                value:  other.to_owned(),
                reason: "expected one of: true/false, 1/0, yes/no, on/off".into(),
            }),
        },
        None => Ok(default),
    }
}
