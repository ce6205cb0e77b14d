// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! EVM chain client for block, receipt and balance queries.

use alloy::{
    consensus::Transaction as ConsensusTx,
    eips::BlockNumberOrTag,
    network::{Ethereum, TransactionResponse},
    primitives::{Address, B256, U256},
    providers::{
        fillers::{BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller},
        Identity, Provider, ProviderBuilder, RootProvider,
    },
};
use async_trait::async_trait;

use super::erc20::Erc20Contract;
use super::types::{ChainBlock, ChainTransaction};

/// Read-side view of the chain consumed by the scanner, dispatcher and
/// collection job.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current chain tip.
    async fn block_number(&self) -> Result<u64, ChainClientError>;

    /// Block at `height` with its full transaction list.
    async fn block(&self, height: u64) -> Result<ChainBlock, ChainClientError>;

    /// Whether a receipt is available for `tx_hash`.
    async fn has_receipt(&self, tx_hash: B256) -> Result<bool, ChainClientError>;

    /// Current gas price in wei.
    async fn gas_price(&self) -> Result<u128, ChainClientError>;

    /// Native-currency balance in wei.
    async fn native_balance(&self, address: Address) -> Result<U256, ChainClientError>;

    /// Token balance in base units.
    async fn token_balance(&self, token: Address, holder: Address) -> Result<U256, ChainClientError>;
}

/// HTTP provider type (with all fillers).
type HttpProvider = FillProvider<
    JoinFill<
        Identity,
        JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
    >,
    RootProvider<Ethereum>,
>;

/// [`ChainClient`] backed by an alloy HTTP provider.
pub struct EvmChainClient {
    provider: HttpProvider,
}

impl EvmChainClient {
    pub fn new(rpc_url: url::Url) -> Self {
        Self {
            provider: ProviderBuilder::new().connect_http(rpc_url),
        }
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    async fn block_number(&self) -> Result<u64, ChainClientError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| ChainClientError::Rpc(e.to_string()))
    }

    async fn block(&self, height: u64) -> Result<ChainBlock, ChainClientError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(height))
            .full()
            .await
            .map_err(|e| ChainClientError::Rpc(e.to_string()))?
            .ok_or(ChainClientError::BlockNotFound(height))?;

        let block_hash = block.header.hash;
        let transactions = block
            .transactions
            .into_transactions()
            .map(|tx| ChainTransaction {
                hash: TransactionResponse::tx_hash(&tx),
                block_hash: tx.block_hash.unwrap_or(block_hash),
                block_number: tx.block_number.unwrap_or(height),
                to: ConsensusTx::to(&tx),
                input: ConsensusTx::input(&tx).clone(),
            })
            .collect();

        Ok(ChainBlock {
            number: height,
            hash: block_hash,
            transactions,
        })
    }

    async fn has_receipt(&self, tx_hash: B256) -> Result<bool, ChainClientError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| ChainClientError::Rpc(e.to_string()))?;
        Ok(receipt.is_some())
    }

    async fn gas_price(&self) -> Result<u128, ChainClientError> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| ChainClientError::Rpc(e.to_string()))
    }

    async fn native_balance(&self, address: Address) -> Result<U256, ChainClientError> {
        self.provider
            .get_balance(address)
            .await
            .map_err(|e| ChainClientError::Rpc(e.to_string()))
    }

    async fn token_balance(&self, token: Address, holder: Address) -> Result<U256, ChainClientError> {
        Erc20Contract::new(&self.provider, token).balance_of(holder).await
    }
}

/// Errors that can occur during chain queries.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ChainClientError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Block {0} not found")]
    BlockNotFound(u64),

    #[error("Contract error: {0}")]
    Contract(String),
}
