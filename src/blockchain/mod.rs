// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Blockchain integration module for EVM chains.
//!
//! This module provides functionality for:
//! - Reading blocks, receipts and balances (`ChainClient`)
//! - Decoding token transfer calls (`TransferDecoder`)
//! - Signing and broadcasting native and token transfers (`TransferExecutor`)

pub mod client;
pub mod decoder;
pub mod erc20;
pub mod signing;
pub mod transactions;
pub mod types;

pub use client::{ChainClient, ChainClientError, EvmChainClient};
pub use decoder::{DecodeError, TransferCall, TransferDecoder};
pub use signing::{KeyError, KeyStore};
pub use transactions::{TransferError, TransferExecutor, TransferReceipt, WalletTransferExecutor};
pub use types::*;
