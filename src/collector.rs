// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Collection Job
//!
//! Background task that keeps tracked accounts ready to be swept.
//!
//! ## Strategy
//!
//! Every `interval` (default 3 days) the job pages through tracked accounts,
//! 100 at a time, and for each one:
//! 1. Reads the live native and token balances.
//! 2. If the token balance is worth collecting but the native balance cannot
//!    pay the miner fee, sends the shortfall from the withdrawal wallet
//!    without waiting for confirmation, and caches the native balance as the
//!    fee on success.
//! 3. Persists the observed balances.
//!
//! A failing account is logged and skipped; the pass always continues.
//!
//! ## Operator transfers
//!
//! - [`CollectionJob::consolidate`] pulls token balances into a target
//!   address until a requested amount is reached.
//! - [`CollectionJob::withdraw`] pays tokens out of the withdrawal wallet.
//! - [`CollectionJob::transfer_from_address`] moves tokens out of a single
//!   address once it can pay the miner fee.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blockchain::{
    to_base_units, ChainClient, ChainClientError, TransferError, TransferExecutor, TransferReceipt,
    UnitError,
};
use crate::models::{Contract, TrackedAccount, WithdrawalWallet};
use crate::storage::{LedgerDatabase, LedgerError};

/// Accounts read per ledger page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("chain error: {0}")]
    Chain(#[from] ChainClientError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("amount error: {0}")]
    Amount(#[from] UnitError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("{address} holds {balance} native units, below the miner fee of {fee}")]
    InsufficientFee {
        address: Address,
        balance: U256,
        fee: U256,
    },

    #[error("withdrawal wallet holds {balance} token units, {requested} requested")]
    InsufficientBalance { balance: U256, requested: U256 },

    #[error("transfer amount must be greater than zero")]
    ZeroAmount,
}

/// Counters for one recharge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionReport {
    pub accounts: usize,
    pub topped_up: usize,
    pub failures: usize,
}

pub struct CollectionJob {
    chain: Arc<dyn ChainClient>,
    executor: Arc<dyn TransferExecutor>,
    ledger: Arc<LedgerDatabase>,
    contract: Contract,
    withdrawal: WithdrawalWallet,
    interval: Duration,
    page_size: usize,
}

impl CollectionJob {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        executor: Arc<dyn TransferExecutor>,
        ledger: Arc<LedgerDatabase>,
        contract: Contract,
        withdrawal: WithdrawalWallet,
        interval: Duration,
    ) -> Self {
        Self {
            chain,
            executor,
            ledger,
            contract,
            withdrawal,
            interval,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Run the job until the cancellation token is triggered. The first pass
    /// runs one `interval` after start.
    ///
    /// ```rust,ignore
    /// tokio::spawn(job.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            page_size = self.page_size,
            "Collection job starting"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Collection job shutting down");
                    return;
                }
            }

            match self.recharge_miner_fees().await {
                Ok(report) => info!(
                    accounts = report.accounts,
                    topped_up = report.topped_up,
                    failures = report.failures,
                    "Collection pass finished"
                ),
                Err(e) => warn!(error = %e, "Collection pass aborted, will retry next interval"),
            }
        }
    }

    fn min_collect_units(&self) -> Result<U256, UnitError> {
        to_base_units(self.withdrawal.min_collect_amount, self.contract.decimals)
    }

    async fn miner_fee(&self) -> Result<U256, ChainClientError> {
        Ok(self.contract.miner_fee(self.chain.gas_price().await?))
    }

    /// A positive override wins over the live estimate.
    async fn fee_or(&self, fee_override: Option<U256>) -> Result<U256, ChainClientError> {
        match fee_override.filter(|fee| !fee.is_zero()) {
            Some(fee) => Ok(fee),
            None => self.miner_fee().await,
        }
    }

    /// One pass over every tracked account.
    pub async fn recharge_miner_fees(&self) -> Result<CollectionReport, CollectError> {
        let fee = self.miner_fee().await?;
        let min_collect = self.min_collect_units()?;
        let mut report = CollectionReport::default();

        let mut after: Option<Address> = None;
        loop {
            let page = self.ledger.list_accounts(after.as_ref(), self.page_size)?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.address);

            for account in &page {
                report.accounts += 1;
                match self.recharge_account(account, fee, min_collect).await {
                    Ok(true) => report.topped_up += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.failures += 1;
                        warn!(address = %account.address, error = %e, "Failed to refresh account");
                    }
                }
            }

            if page.len() < self.page_size {
                break;
            }
        }

        Ok(report)
    }

    /// Returns whether a fee top-up was sent.
    async fn recharge_account(
        &self,
        account: &TrackedAccount,
        fee: U256,
        min_collect: U256,
    ) -> Result<bool, CollectError> {
        let address = account.address;
        let mut native = self.chain.native_balance(address).await?;
        let token = self.chain.token_balance(self.contract.address, address).await?;

        let mut topped_up = false;
        if native < fee && token >= min_collect {
            let shortfall = fee - native;
            match self
                .executor
                .transfer_native(self.withdrawal.address, address, shortfall, false)
                .await
            {
                Ok(receipt) => {
                    info!(
                        address = %address,
                        shortfall = %shortfall,
                        tx_hash = ?receipt.tx_hash,
                        "Miner fee top-up sent"
                    );
                    native = fee;
                    topped_up = true;
                }
                Err(e) => warn!(address = %address, error = %e, "Miner fee top-up failed"),
            }
        }

        self.ledger.update_balances(&address, token, native)?;
        Ok(topped_up)
    }

    /// Move token balances from collectible accounts to `target` until at
    /// least `amount` base units have been transferred.
    ///
    /// `fee_override` replaces the live miner fee estimate. Returns the total
    /// transferred, which may be below `amount` when funds run out.
    pub async fn consolidate(
        &self,
        target: Address,
        amount: U256,
        fee_override: Option<U256>,
    ) -> Result<U256, CollectError> {
        let fee = self.fee_or(fee_override).await?;
        let min_collect = self.min_collect_units()?;
        let candidates = self.ledger.find_collectible(min_collect, fee)?;

        info!(
            target = %target,
            amount = %amount,
            candidates = candidates.len(),
            "Consolidation starting"
        );

        let mut collected = U256::ZERO;
        for account in candidates {
            if collected >= amount {
                break;
            }
            match self.collect_from(&account, target, fee, min_collect).await {
                Ok(moved) => collected = collected.saturating_add(moved),
                Err(e) => {
                    warn!(address = %account.address, error = %e, "Consolidation transfer failed");
                }
            }
        }

        info!(collected = %collected, requested = %amount, "Consolidation finished");
        Ok(collected)
    }

    async fn collect_from(
        &self,
        account: &TrackedAccount,
        target: Address,
        fee: U256,
        min_collect: U256,
    ) -> Result<U256, CollectError> {
        let address = account.address;
        let native = self.chain.native_balance(address).await?;
        if native < fee {
            debug!(address = %address, "Not enough native balance for the fee");
            return Ok(U256::ZERO);
        }
        let token = self.chain.token_balance(self.contract.address, address).await?;
        if token < min_collect || token.is_zero() {
            return Ok(U256::ZERO);
        }

        self.executor.transfer_token(address, target, token, true).await?;

        let native = self.chain.native_balance(address).await.unwrap_or(native);
        self.ledger.update_balances(&address, U256::ZERO, native)?;
        Ok(token)
    }

    /// Pay tokens out of the withdrawal wallet.
    ///
    /// # Arguments
    ///
    /// * `to` - Payout recipient
    /// * `amount` - Amount in token base units
    /// * `wait_for_confirmation` - Wait for the receipt before returning
    /// * `withdraw_id` - Caller's reference, logged with the transfer
    ///
    /// # Returns
    ///
    /// The transfer receipt. Fails with `InsufficientBalance` when the
    /// withdrawal wallet holds less than `amount`.
    pub async fn withdraw(
        &self,
        to: Address,
        amount: U256,
        wait_for_confirmation: bool,
        withdraw_id: Option<&str>,
    ) -> Result<TransferReceipt, CollectError> {
        if amount.is_zero() {
            return Err(CollectError::ZeroAmount);
        }
        let from = self.withdrawal.address;
        let balance = self.chain.token_balance(self.contract.address, from).await?;
        if balance < amount {
            return Err(CollectError::InsufficientBalance {
                balance,
                requested: amount,
            });
        }

        let receipt = self
            .executor
            .transfer_token(from, to, amount, wait_for_confirmation)
            .await?;
        info!(
            to = %to,
            amount = %amount,
            withdraw_id = withdraw_id.unwrap_or(""),
            tx_hash = ?receipt.tx_hash,
            "Withdrawal sent"
        );
        Ok(receipt)
    }

    /// Move `amount` tokens from a single address to `to`, waiting for the
    /// receipt.
    ///
    /// # Arguments
    ///
    /// * `from` - Source address; its key must be in the keystore
    /// * `to` - Recipient
    /// * `amount` - Amount in token base units
    /// * `fee_override` - Miner fee to require instead of the live estimate
    ///
    /// # Returns
    ///
    /// The transfer receipt. Fails with `InsufficientFee` before sending
    /// anything when `from` cannot pay the miner fee.
    pub async fn transfer_from_address(
        &self,
        from: Address,
        to: Address,
        amount: U256,
        fee_override: Option<U256>,
    ) -> Result<TransferReceipt, CollectError> {
        if amount.is_zero() {
            return Err(CollectError::ZeroAmount);
        }
        let fee = self.fee_or(fee_override).await?;
        let balance = self.chain.native_balance(from).await?;
        if balance < fee {
            info!(address = %from, balance = %balance, fee = %fee, "Not enough native balance for the fee");
            return Err(CollectError::InsufficientFee {
                address: from,
                balance,
                fee,
            });
        }

        let receipt = self.executor.transfer_token(from, to, amount, true).await?;
        info!(from = %from, to = %to, amount = %amount, tx_hash = ?receipt.tx_hash, "Token transfer sent");

        if self.ledger.is_tracked(&from)? {
            let token = self.chain.token_balance(self.contract.address, from).await?;
            let native = self.chain.native_balance(from).await?;
            self.ledger.update_balances(&from, token, native)?;
        }
        Ok(receipt)
    }
}
