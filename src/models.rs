// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Ledger Data Models
//!
//! Records shared by the scan pipeline, the dispatcher and the collection
//! job. Everything persisted derives `Serialize`/`Deserialize` and is stored
//! as JSON in the redb ledger.
//!
//! ## Model Categories
//!
//! - **Configuration**: [`Contract`], [`WithdrawalWallet`] (immutable, loaded once)
//! - **Accounts**: [`TrackedAccount`] (customer deposit addresses)
//! - **Deposits**: [`Deposit`] and its [`DepositStatus`] state machine

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Configuration
// =============================================================================

/// The token contract whose transfer calls are watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub address: Address,
    /// 4-byte selector of `transfer(address,uint256)`
    pub transfer_selector: [u8; 4],
    /// Token decimal unit
    pub decimals: u8,
    /// Gas limit budgeted for one token transfer
    pub gas_limit: u64,
}

impl Contract {
    /// keccak256("transfer(address,uint256)")[..4]
    pub const ERC20_TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

    /// Miner fee (native currency, wei) for one token transfer at `gas_price`.
    pub fn miner_fee(&self, gas_price: u128) -> U256 {
        U256::from(gas_price) * U256::from(self.gas_limit)
    }
}

/// Central wallet that receives swept funds and pays fee top-ups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalWallet {
    pub address: Address,
    /// Credential reference: PEM key file of the withdrawal wallet
    pub key_file: std::path::PathBuf,
    /// Token balance below which sweeping is not worth the fee
    pub min_collect_amount: Decimal,
}

// =============================================================================
// Accounts
// =============================================================================

/// A customer deposit address and its cached balances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedAccount {
    pub address: Address,
    /// Owning customer reference
    pub customer: String,
    /// Cached native-currency balance (wei)
    pub native_balance: U256,
    /// Cached token balance (base units)
    pub token_balance: U256,
    pub updated_at: DateTime<Utc>,
}

impl TrackedAccount {
    pub fn new(address: Address, customer: impl Into<String>) -> Self {
        Self {
            address,
            customer: customer.into(),
            native_balance: U256::ZERO,
            token_balance: U256::ZERO,
            updated_at: Utc::now(),
        }
    }
}

// =============================================================================
// Deposits
// =============================================================================

/// Processing status of a deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    /// Recorded by the scanner, not yet handled by the dispatcher
    Detected,
    /// Fee top-up sent to the source address, waiting for it to confirm
    FeeEnsured,
    /// Token balance moved to the withdrawal wallet
    Swept,
    /// Sweep failed; requires an operator-triggered pass
    Failed,
}

impl DepositStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Swept | Self::Failed)
    }

    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: DepositStatus) -> bool {
        use DepositStatus::*;
        matches!(
            (self, next),
            (Detected, FeeEnsured)
                | (Detected, Swept)
                | (Detected, Failed)
                | (FeeEnsured, Swept)
                | (FeeEnsured, Failed)
        )
    }
}

impl std::fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Detected => "detected",
            Self::FeeEnsured => "fee_ensured",
            Self::Swept => "swept",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A token transfer into a tracked account, plus its sweep audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: Uuid,
    pub tx_hash: B256,
    pub block_hash: B256,
    pub block_height: u64,
    /// Recipient deposit address
    pub address: Address,
    /// Amount in token decimal units, exact for any `raw_amount`
    pub amount: String,
    /// Amount in token base units
    pub raw_amount: U256,
    pub status: DepositStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_tx_hash: Option<B256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_tx_hash: Option<B256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deposit {
    /// Create a freshly detected deposit.
    pub fn detected(
        tx_hash: B256,
        block_hash: B256,
        block_height: u64,
        address: Address,
        amount: String,
        raw_amount: U256,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tx_hash,
            block_hash,
            block_height,
            address,
            amount,
            raw_amount,
            status: DepositStatus::Detected,
            fee_tx_hash: None,
            sweep_tx_hash: None,
            failure_reason: None,
            detected_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, returning `false` (and leaving `self` untouched) when
    /// the state machine forbids it.
    pub fn transition(&mut self, next: DepositStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }

    pub fn mark_fee_ensured(&mut self, fee_tx_hash: Option<B256>) -> bool {
        let moved = self.transition(DepositStatus::FeeEnsured);
        if moved {
            self.fee_tx_hash = fee_tx_hash;
        }
        moved
    }

    pub fn mark_swept(&mut self, sweep_tx_hash: Option<B256>) -> bool {
        let moved = self.transition(DepositStatus::Swept);
        if moved {
            self.sweep_tx_hash = sweep_tx_hash;
        }
        moved
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> bool {
        let moved = self.transition(DepositStatus::Failed);
        if moved {
            self.failure_reason = Some(reason.into());
        }
        moved
    }
}
