// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! # budgetgate-std
//!
//! Persistent storage backends for `budgetgate-core`.
//!
//! This crate provides [`FileStore`], a JSON file-backed implementation of
//! the [`SpendStore`](budgetgate_core::SpendStore) trait suitable for CLI
//! tools, local agents, and single-process services that need spend state
//! to survive a restart without running a database.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use budgetgate_std::FileStore;
//! use budgetgate_core::{Engine, EngineConfig, StoreOptions};
//!
//! let store = FileStore::open("/var/lib/budgetgate/spend.json", StoreOptions::default())
//!     .expect("failed to open spend file");
//!
//! let engine = Engine::new(EngineConfig::default(), store);
//! ```

pub mod storage;

pub use storage::file::FileStore;
