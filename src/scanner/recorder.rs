// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Turns confirmed token transfers into ledger deposits.

use std::sync::Arc;

use alloy::primitives::{Address, B256, U256};
use tracing::{debug, info};

use crate::blockchain::format_amount;
use crate::dispatcher::Dispatcher;
use crate::models::Deposit;
use crate::storage::{LedgerDatabase, LedgerError};

/// A decoded, confirmed transfer into a tracked address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositCandidate {
    pub recipient: Address,
    pub raw_amount: U256,
    pub tx_hash: B256,
    pub block_hash: B256,
    pub block_height: u64,
}

/// Records deposits exactly once and hands new ones to the dispatcher.
pub struct DepositRecorder {
    ledger: Arc<LedgerDatabase>,
    decimals: u8,
    dispatcher: Dispatcher,
}

impl DepositRecorder {
    pub fn new(ledger: Arc<LedgerDatabase>, decimals: u8, dispatcher: Dispatcher) -> Self {
        Self {
            ledger,
            decimals,
            dispatcher,
        }
    }

    /// Record `candidate` as a `Detected` deposit.
    ///
    /// Only a newly created deposit is dispatched.
    ///
    /// # Arguments
    ///
    /// * `candidate` - A decoded transfer whose transaction has a receipt
    ///
    /// # Returns
    ///
    /// The new deposit, or `None` for zero amounts, untracked recipients and
    /// transactions already in the ledger.
    pub fn record(&self, candidate: &DepositCandidate) -> Result<Option<Deposit>, LedgerError> {
        if candidate.raw_amount.is_zero() {
            debug!(tx_hash = %candidate.tx_hash, "Ignoring zero-amount transfer");
            return Ok(None);
        }
        if !self.ledger.is_tracked(&candidate.recipient)? {
            return Ok(None);
        }

        let deposit = Deposit::detected(
            candidate.tx_hash,
            candidate.block_hash,
            candidate.block_height,
            candidate.recipient,
            format_amount(candidate.raw_amount, self.decimals),
            candidate.raw_amount,
        );

        if !self.ledger.insert_deposit_if_absent(&deposit)? {
            debug!(tx_hash = %candidate.tx_hash, "Deposit already recorded");
            return Ok(None);
        }

        info!(
            tx_hash = %deposit.tx_hash,
            address = %deposit.address,
            amount = %deposit.amount,
            height = deposit.block_height,
            "Deposit detected"
        );
        self.dispatcher.submit(&deposit);
        Ok(Some(deposit))
    }
}
