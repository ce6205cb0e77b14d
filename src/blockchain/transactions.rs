// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Transfer execution: building, signing and broadcasting native and token
//! transfers.
//!
//! Transfers are priced with the legacy `gas_price` so that the cost of a
//! token transfer is exactly `gas_price * gas_limit`, the same miner fee the
//! dispatcher pre-funds deposit addresses with.

use std::time::Duration;

use alloy::{
    network::{Ethereum, EthereumWallet},
    primitives::{Address, B256, U256},
    providers::{
        fillers::{
            BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller,
            WalletFiller,
        },
        Identity, Provider, ProviderBuilder, RootProvider,
    },
    rpc::types::TransactionRequest,
    sol_types::SolCall,
};
use async_trait::async_trait;

use super::erc20::IERC20;
use super::signing::{KeyError, KeyStore};
use crate::models::Contract;

/// Gas limit of a plain native-currency transfer.
const NATIVE_TRANSFER_GAS: u64 = 21_000;

/// Outcome of a submitted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferReceipt {
    /// On-chain transaction hash, when the executor reports one
    pub tx_hash: Option<B256>,
}

/// Moves funds on behalf of custodial addresses.
#[async_trait]
pub trait TransferExecutor: Send + Sync {
    /// Send `amount` wei of native currency from `from` to `to`.
    async fn transfer_native(
        &self,
        from: Address,
        to: Address,
        amount: U256,
        wait_for_confirmation: bool,
    ) -> Result<TransferReceipt, TransferError>;

    /// Send `amount` token base units from `from` to `to`.
    async fn transfer_token(
        &self,
        from: Address,
        to: Address,
        amount: U256,
        wait_for_confirmation: bool,
    ) -> Result<TransferReceipt, TransferError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("signing key unavailable: {0}")]
    Key(#[from] KeyError),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("transaction {0} reverted")]
    Reverted(B256),

    #[error("transaction {0} not confirmed in time")]
    Unconfirmed(B256),
}

/// Provider with gas/nonce/chain-id fillers and a signing wallet.
type SigningProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider<Ethereum>,
>;

/// Receipt polling used when a caller asks to wait for confirmation.
#[derive(Debug, Clone, Copy)]
struct ReceiptPolling {
    interval: Duration,
    timeout: Duration,
}

impl Default for ReceiptPolling {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(120),
        }
    }
}

/// [`TransferExecutor`] signing locally with keys from a [`KeyStore`].
pub struct WalletTransferExecutor {
    rpc_url: url::Url,
    keys: KeyStore,
    contract: Contract,
    polling: ReceiptPolling,
}

impl WalletTransferExecutor {
    pub fn new(rpc_url: url::Url, keys: KeyStore, contract: Contract) -> Self {
        Self {
            rpc_url,
            keys,
            contract,
            polling: ReceiptPolling::default(),
        }
    }

    fn provider_for(&self, from: Address) -> Result<SigningProvider, TransferError> {
        let wallet = self.keys.wallet_for(from)?;
        Ok(ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(self.rpc_url.clone()))
    }

    async fn submit(
        &self,
        from: Address,
        tx: TransactionRequest,
        wait_for_confirmation: bool,
    ) -> Result<TransferReceipt, TransferError> {
        let provider = self.provider_for(from)?;

        let gas_price = provider
            .get_gas_price()
            .await
            .map_err(|e| TransferError::Rpc(format!("Failed to get gas price: {}", e)))?;

        let pending = provider
            .send_transaction(tx.from(from).gas_price(gas_price))
            .await
            .map_err(|e| TransferError::Rejected(format!("Failed to send: {}", e)))?;
        let tx_hash = *pending.tx_hash();

        tracing::debug!(tx_hash = %tx_hash, from = %from, "Transfer broadcast");

        if wait_for_confirmation {
            self.wait_for_receipt(&provider, tx_hash).await?;
        }

        Ok(TransferReceipt {
            tx_hash: Some(tx_hash),
        })
    }

    /// Poll for the receipt until it shows up or the timeout elapses.
    async fn wait_for_receipt(
        &self,
        provider: &SigningProvider,
        tx_hash: B256,
    ) -> Result<(), TransferError> {
        let deadline = tokio::time::Instant::now() + self.polling.timeout;
        loop {
            let receipt = provider
                .get_transaction_receipt(tx_hash)
                .await
                .map_err(|e| TransferError::Rpc(format!("Failed to get receipt: {}", e)))?;

            if let Some(receipt) = receipt {
                return if receipt.status() {
                    Ok(())
                } else {
                    Err(TransferError::Reverted(tx_hash))
                };
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(TransferError::Unconfirmed(tx_hash));
            }
            tokio::time::sleep(self.polling.interval).await;
        }
    }
}

#[async_trait]
impl TransferExecutor for WalletTransferExecutor {
    async fn transfer_native(
        &self,
        from: Address,
        to: Address,
        amount: U256,
        wait_for_confirmation: bool,
    ) -> Result<TransferReceipt, TransferError> {
        let tx = TransactionRequest::default()
            .to(to)
            .value(amount)
            .gas_limit(NATIVE_TRANSFER_GAS);

        self.submit(from, tx, wait_for_confirmation).await
    }

    async fn transfer_token(
        &self,
        from: Address,
        to: Address,
        amount: U256,
        wait_for_confirmation: bool,
    ) -> Result<TransferReceipt, TransferError> {
        let tx = TransactionRequest::default()
            .to(self.contract.address)
            .input(token_transfer_input(to, amount).into())
            .gas_limit(self.contract.gas_limit);

        self.submit(from, tx, wait_for_confirmation).await
    }
}

/// ABI-encoded `transfer(to, amount)` call data.
pub fn token_transfer_input(to: Address, amount: U256) -> Vec<u8> {
    IERC20::transferCall { to, amount }.abi_encode()
}
