// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Token transfer call decoding.
//!
//! A `transfer(address,uint256)` call carries a 4-byte selector followed by
//! two 32-byte words:
//!
//! ```text
//! [selector:4][address word:32][amount word:32]
//!              ^ 12 padding bytes + 20 address bytes
//! ```
//!
//! The deployed contract's callers do not always leave the address word's
//! padding zeroed, so the decoder rebuilds a canonical `(address, uint256)`
//! encoding with the padding cleared before ABI-decoding it.

use alloy::primitives::{Address, U256};
use alloy::sol_types::SolValue;

use crate::models::Contract;

const SELECTOR_LEN: usize = 4;
const WORD_LEN: usize = 32;
/// Address bytes sit in the low 20 bytes of their word.
const ADDRESS_PADDING: usize = 12;
/// selector + two parameters
pub const MIN_TRANSFER_INPUT_LEN: usize = SELECTOR_LEN + 2 * WORD_LEN;

/// A decoded `transfer(recipient, amount)` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCall {
    pub recipient: Address,
    /// Amount in token base units
    pub amount: U256,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed hex input: {0}")]
    Hex(String),

    #[error("ABI decode failed: {0}")]
    Abi(String),
}

/// Decodes transfer calls addressed to one tracked contract.
#[derive(Debug, Clone)]
pub struct TransferDecoder {
    contract: Address,
    selector: [u8; 4],
}

impl TransferDecoder {
    pub fn new(contract: &Contract) -> Self {
        Self {
            contract: contract.address,
            selector: contract.transfer_selector,
        }
    }

    /// Decode a raw call input sent to `to`.
    ///
    /// # Arguments
    ///
    /// * `input` - Raw transaction input
    /// * `to` - Transaction destination, `None` for contract creation
    ///
    /// # Returns
    ///
    /// `Ok(None)` for anything that is not a transfer call to the tracked
    /// contract. Zero amounts are returned as-is.
    pub fn decode(&self, input: &[u8], to: Option<Address>) -> Result<Option<TransferCall>, DecodeError> {
        // Address equality is byte equality, so hex case never matters here.
        if to != Some(self.contract) {
            return Ok(None);
        }
        if input.len() < MIN_TRANSFER_INPUT_LEN {
            return Ok(None);
        }
        if input[..SELECTOR_LEN] != self.selector {
            return Ok(None);
        }

        let canonical = canonical_params(&input[SELECTOR_LEN..MIN_TRANSFER_INPUT_LEN]);
        let (recipient, amount) = <(Address, U256)>::abi_decode_params(&canonical)
            .map_err(|e| DecodeError::Abi(e.to_string()))?;

        Ok(Some(TransferCall { recipient, amount }))
    }

    /// Decode a hex call input (`0x` prefix optional).
    pub fn decode_hex(&self, input: &str, to: Option<Address>) -> Result<Option<TransferCall>, DecodeError> {
        let bytes = alloy::hex::decode(input.trim()).map_err(|e| DecodeError::Hex(e.to_string()))?;
        self.decode(&bytes, to)
    }
}

/// Copy the two parameter words, clearing the address word's padding.
fn canonical_params(params: &[u8]) -> [u8; 2 * WORD_LEN] {
    let mut canonical = [0u8; 2 * WORD_LEN];
    canonical[ADDRESS_PADDING..].copy_from_slice(&params[ADDRESS_PADDING..2 * WORD_LEN]);
    canonical
}
