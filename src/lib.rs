// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Relational Token Reconciler - Custodial Deposit Sweeper
//!
//! Watches an EVM chain for token transfers into customer deposit addresses,
//! records them in an embedded ledger and sweeps them to a central withdrawal
//! wallet, topping up miner fees where needed.
//!
//! ## Modules
//!
//! - `blockchain` - Chain client, transfer decoding and signing
//! - `scanner` - Block scanner, deposit recorder and live scan loop
//! - `dispatcher` - Fee ensurer and sweep executor worker pool
//! - `collector` - Periodic miner-fee recharge and consolidation
//! - `storage` - Embedded ledger (redb)

pub mod blockchain;
pub mod collector;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod scanner;
pub mod storage;

#[cfg(test)]
mod testing;
