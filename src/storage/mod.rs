// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Ledger Storage
//!
//! All reconciler state lives in a single redb file under the data
//! directory:
//!
//! ```text
//! $DATA_DIR/
//!   ledger.redb     # accounts, deposits, scanner cursor, revisit set
//! ```
//!
//! The scanner, the dispatcher and the collection job share one
//! [`LedgerDatabase`] behind an `Arc`.

pub mod ledger_db;

pub use ledger_db::{LedgerDatabase, LedgerError, LedgerResult};
