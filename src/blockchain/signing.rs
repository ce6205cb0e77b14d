// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Key loading for transfer signing.
//!
//! Deposit-address keys live as PKCS#8 (or SEC1) PEM files named after their
//! lowercase address inside the keystore directory:
//!
//! ```text
//! /data/keys/
//!   0x5425890298aed601595a70ab815c96711a31bc65.pem
//! ```
//!
//! The withdrawal wallet's key is referenced by its own file path.

use std::path::{Path, PathBuf};

use alloy::{network::EthereumWallet, primitives::Address, signers::local::PrivateKeySigner};
use k256::SecretKey;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Key file {path} unreadable: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Key file {path} belongs to {actual}, expected {expected}")]
    AddressMismatch {
        path: PathBuf,
        expected: Address,
        actual: Address,
    },
}

/// Parse a PEM private key into a signer.
pub fn signer_from_pem(pem_bytes: &[u8]) -> Result<PrivateKeySigner, KeyError> {
    let pem_str = std::str::from_utf8(pem_bytes)
        .map_err(|e| KeyError::InvalidPrivateKey(format!("Invalid UTF-8: {}", e)))?;

    let pem = pem::parse(pem_str)
        .map_err(|e| KeyError::InvalidPrivateKey(format!("Invalid PEM: {}", e)))?;

    let secret_key = SecretKey::from_sec1_der(pem.contents())
        .or_else(|_| {
            use k256::pkcs8::DecodePrivateKey;
            SecretKey::from_pkcs8_der(pem.contents())
        })
        .map_err(|e| KeyError::InvalidPrivateKey(format!("Invalid key format: {}", e)))?;

    PrivateKeySigner::from_slice(&secret_key.to_bytes())
        .map_err(|e| KeyError::InvalidPrivateKey(e.to_string()))
}

/// Resolves signing wallets for deposit addresses and the withdrawal wallet.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
    withdrawal: Address,
    withdrawal_key: PathBuf,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>, withdrawal: Address, withdrawal_key: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            withdrawal,
            withdrawal_key: withdrawal_key.into(),
        }
    }

    /// Path of the key file that signs for `address`.
    pub fn key_path(&self, address: Address) -> PathBuf {
        if address == self.withdrawal {
            self.withdrawal_key.clone()
        } else {
            self.dir.join(format!("{address:#x}.pem"))
        }
    }

    /// Load the wallet for `address`, checking the key actually controls it.
    pub fn wallet_for(&self, address: Address) -> Result<EthereumWallet, KeyError> {
        let path = self.key_path(address);
        let signer = load_signer(&path)?;
        if signer.address() != address {
            return Err(KeyError::AddressMismatch {
                path,
                expected: address,
                actual: signer.address(),
            });
        }
        Ok(EthereumWallet::from(signer))
    }
}

fn load_signer(path: &Path) -> Result<PrivateKeySigner, KeyError> {
    let bytes = std::fs::read(path).map_err(|e| KeyError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    signer_from_pem(&bytes)
}
