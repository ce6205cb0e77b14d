// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Blockchain types and unit conversion.

use std::str::FromStr;

use alloy::primitives::{Address, Bytes, B256, U256};
use rust_decimal::Decimal;

/// A mined transaction as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    /// Destination (None for contract creation)
    pub to: Option<Address>,
    /// Raw call input
    pub input: Bytes,
}

/// A block's transactions, in block order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBlock {
    pub number: u64,
    pub hash: B256,
    pub transactions: Vec<ChainTransaction>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("invalid amount: {0}")]
    Invalid(String),

    #[error("too many decimal places in {0} (max {1})")]
    Precision(String, u8),
}

/// Format base units as a plain decimal string ("1.5", "0.000001").
///
/// Exact for every `U256`, whatever the number of significant digits.
///
/// # Arguments
///
/// * `amount` - Amount in base units
/// * `decimals` - Token decimals, at most 77
///
/// # Returns
///
/// The decimal representation with trailing zeros trimmed.
pub fn format_amount(amount: U256, decimals: u8) -> String {
    if amount.is_zero() {
        return "0".to_string();
    }

    let divisor = U256::from(10u64).pow(U256::from(decimals));
    let whole = amount / divisor;
    let remainder = amount % divisor;

    if remainder.is_zero() {
        whole.to_string()
    } else {
        let decimal_str = format!("{:0>width$}", remainder, width = decimals as usize);
        let trimmed = decimal_str.trim_end_matches('0');
        format!("{}.{}", whole, trimmed)
    }
}

/// Convert a decimal amount back to base units.
pub fn to_base_units(amount: Decimal, decimals: u8) -> Result<U256, UnitError> {
    if amount.is_sign_negative() {
        return Err(UnitError::Invalid(amount.to_string()));
    }
    let normalized = amount.normalize().to_string();
    let (whole, fraction) = match normalized.split_once('.') {
        Some((w, f)) => (w, f),
        None => (normalized.as_str(), ""),
    };
    if fraction.len() > decimals as usize {
        return Err(UnitError::Precision(normalized.clone(), decimals));
    }

    let padded = format!("{whole}{fraction:0<width$}", width = decimals as usize);
    U256::from_str(&padded).map_err(|e| UnitError::Invalid(e.to_string()))
}
