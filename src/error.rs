// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use crate::blockchain::KeyError;
use crate::config::ConfigError;
use crate::storage::LedgerError;

/// Errors that stop the service before its background tasks start.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("withdrawal key: {0}")]
    Key(#[from] KeyError),
}
