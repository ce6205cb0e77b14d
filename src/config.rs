// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names and default values used
//! throughout the reconciler. Configuration is loaded from the environment
//! once at startup and handed to each component at construction.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RPC_URL` | EVM JSON-RPC endpoint | Required |
//! | `DATA_DIR` | Directory holding `ledger.redb` | `/data` |
//! | `CONTRACT_ADDRESS` | Tracked token contract | Required |
//! | `CONTRACT_DECIMALS` | Token decimal unit, at most 77 | `18` |
//! | `CONTRACT_GAS_LIMIT` | Gas limit of a token transfer | `60000` |
//! | `CONTRACT_TRANSFER_SELECTOR` | `transfer(address,uint256)` selector | `a9059cbb` |
//! | `WITHDRAW_ADDRESS` | Withdrawal wallet address | Required |
//! | `WITHDRAW_KEY_FILE` | PEM key of the withdrawal wallet | Required |
//! | `KEYSTORE_DIR` | Directory of `<address>.pem` deposit keys | `/data/keys` |
//! | `MIN_COLLECT_AMOUNT` | Minimum collectible token amount | `0` |
//! | `SCAN_START_HEIGHT` | First height scanned when no cursor is stored | confirmed tip |
//! | `SCAN_STEP` | Max heights per live pass | `100` |
//! | `SCAN_CONFIRMATIONS` | Heights to stay behind the tip | `0` |
//! | `SCAN_INTERVAL_SECS` | Live loop poll interval | `10` |
//! | `SCAN_MODE` | `sync` or `event` | `sync` |
//! | `SCAN_CONCURRENCY` | Per-block parallelism in event mode | `8` |
//! | `DISPATCH_WORKERS` | Sweep worker pool size | `4` |
//! | `FEE_CONFIRM_TIMEOUT_SECS` | Max wait for a fee top-up | `900` |
//! | `COLLECT_INTERVAL_SECS` | Collection job period | `259200` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use rust_decimal::Decimal;

use crate::models::{Contract, WithdrawalWallet};
use crate::scanner::ScanMode;

pub const RPC_URL_ENV: &str = "RPC_URL";

/// Environment variable name for the ledger data directory.
///
/// # Default
/// `/data`
pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const CONTRACT_ADDRESS_ENV: &str = "CONTRACT_ADDRESS";
pub const CONTRACT_DECIMALS_ENV: &str = "CONTRACT_DECIMALS";
pub const CONTRACT_GAS_LIMIT_ENV: &str = "CONTRACT_GAS_LIMIT";
pub const CONTRACT_TRANSFER_SELECTOR_ENV: &str = "CONTRACT_TRANSFER_SELECTOR";
pub const WITHDRAW_ADDRESS_ENV: &str = "WITHDRAW_ADDRESS";
pub const WITHDRAW_KEY_FILE_ENV: &str = "WITHDRAW_KEY_FILE";
pub const KEYSTORE_DIR_ENV: &str = "KEYSTORE_DIR";
pub const MIN_COLLECT_AMOUNT_ENV: &str = "MIN_COLLECT_AMOUNT";
pub const SCAN_START_HEIGHT_ENV: &str = "SCAN_START_HEIGHT";
pub const SCAN_STEP_ENV: &str = "SCAN_STEP";
pub const SCAN_CONFIRMATIONS_ENV: &str = "SCAN_CONFIRMATIONS";
pub const SCAN_INTERVAL_SECS_ENV: &str = "SCAN_INTERVAL_SECS";
pub const SCAN_MODE_ENV: &str = "SCAN_MODE";
pub const SCAN_CONCURRENCY_ENV: &str = "SCAN_CONCURRENCY";
pub const DISPATCH_WORKERS_ENV: &str = "DISPATCH_WORKERS";
pub const FEE_CONFIRM_TIMEOUT_SECS_ENV: &str = "FEE_CONFIRM_TIMEOUT_SECS";
pub const COLLECT_INTERVAL_SECS_ENV: &str = "COLLECT_INTERVAL_SECS";

/// Logging format selector (`json` or `pretty`).
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

const DEFAULT_DATA_DIR: &str = "/data";
const DEFAULT_KEYSTORE_DIR: &str = "/data/keys";
const DEFAULT_DECIMALS: u8 = 18;
/// Largest `n` with `10^n` representable in a `U256`.
const MAX_DECIMALS: u8 = 77;
const DEFAULT_GAS_LIMIT: u64 = 60_000;
const DEFAULT_SCAN_STEP: u64 = 100;
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 10;
const DEFAULT_SCAN_CONCURRENCY: usize = 8;
const DEFAULT_DISPATCH_WORKERS: usize = 4;
const DEFAULT_FEE_CONFIRM_TIMEOUT_SECS: u64 = 15 * 60;
const DEFAULT_COLLECT_INTERVAL_SECS: u64 = 3 * 24 * 60 * 60;

/// Fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub rpc_url: url::Url,
    pub data_dir: PathBuf,
    pub keystore_dir: PathBuf,
    pub contract: Contract,
    pub withdrawal: WithdrawalWallet,
    pub scan: ScanSettings,
    pub dispatch_workers: usize,
    pub fee_confirm_timeout: Duration,
    pub collect_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub start_height: Option<u64>,
    pub step: u64,
    pub confirmations: u64,
    pub interval: Duration,
    pub mode: ScanMode,
    pub concurrency: usize,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let rpc_url = parse_var(RPC_URL_ENV, &require(RPC_URL_ENV)?)?;

        let contract = Contract {
            address: parse_var(CONTRACT_ADDRESS_ENV, &require(CONTRACT_ADDRESS_ENV)?)?,
            transfer_selector: match get(CONTRACT_TRANSFER_SELECTOR_ENV) {
                Some(raw) => parse_selector(&raw)?,
                None => Contract::ERC20_TRANSFER_SELECTOR,
            },
            decimals: optional(CONTRACT_DECIMALS_ENV, get(CONTRACT_DECIMALS_ENV))?
                .unwrap_or(DEFAULT_DECIMALS),
            gas_limit: optional(CONTRACT_GAS_LIMIT_ENV, get(CONTRACT_GAS_LIMIT_ENV))?
                .unwrap_or(DEFAULT_GAS_LIMIT),
        };
        if contract.decimals > MAX_DECIMALS {
            return Err(ConfigError::Invalid {
                var: CONTRACT_DECIMALS_ENV,
                reason: format!("must be at most {MAX_DECIMALS}"),
            });
        }

        let withdrawal = WithdrawalWallet {
            address: parse_var::<Address>(WITHDRAW_ADDRESS_ENV, &require(WITHDRAW_ADDRESS_ENV)?)?,
            key_file: PathBuf::from(require(WITHDRAW_KEY_FILE_ENV)?),
            min_collect_amount: optional::<Decimal>(
                MIN_COLLECT_AMOUNT_ENV,
                get(MIN_COLLECT_AMOUNT_ENV),
            )?
            .unwrap_or(Decimal::ZERO),
        };
        if withdrawal.min_collect_amount.is_sign_negative() {
            return Err(ConfigError::Invalid {
                var: MIN_COLLECT_AMOUNT_ENV,
                reason: "must not be negative".to_string(),
            });
        }

        let mode = match get(SCAN_MODE_ENV) {
            Some(raw) => raw.parse::<ScanMode>().map_err(|reason| ConfigError::Invalid {
                var: SCAN_MODE_ENV,
                reason,
            })?,
            None => ScanMode::Sync,
        };

        let scan = ScanSettings {
            start_height: optional(SCAN_START_HEIGHT_ENV, get(SCAN_START_HEIGHT_ENV))?,
            step: positive(SCAN_STEP_ENV, get(SCAN_STEP_ENV), DEFAULT_SCAN_STEP)?,
            confirmations: optional(SCAN_CONFIRMATIONS_ENV, get(SCAN_CONFIRMATIONS_ENV))?
                .unwrap_or(0),
            interval: Duration::from_secs(positive(
                SCAN_INTERVAL_SECS_ENV,
                get(SCAN_INTERVAL_SECS_ENV),
                DEFAULT_SCAN_INTERVAL_SECS,
            )?),
            mode,
            concurrency: positive(
                SCAN_CONCURRENCY_ENV,
                get(SCAN_CONCURRENCY_ENV),
                DEFAULT_SCAN_CONCURRENCY,
            )?,
        };

        Ok(Self {
            rpc_url,
            data_dir: PathBuf::from(get(DATA_DIR_ENV).unwrap_or_else(|| DEFAULT_DATA_DIR.into())),
            keystore_dir: PathBuf::from(
                get(KEYSTORE_DIR_ENV).unwrap_or_else(|| DEFAULT_KEYSTORE_DIR.into()),
            ),
            contract,
            withdrawal,
            scan,
            dispatch_workers: positive(
                DISPATCH_WORKERS_ENV,
                get(DISPATCH_WORKERS_ENV),
                DEFAULT_DISPATCH_WORKERS,
            )?,
            fee_confirm_timeout: Duration::from_secs(positive(
                FEE_CONFIRM_TIMEOUT_SECS_ENV,
                get(FEE_CONFIRM_TIMEOUT_SECS_ENV),
                DEFAULT_FEE_CONFIRM_TIMEOUT_SECS,
            )?),
            collect_interval: Duration::from_secs(positive(
                COLLECT_INTERVAL_SECS_ENV,
                get(COLLECT_INTERVAL_SECS_ENV),
                DEFAULT_COLLECT_INTERVAL_SECS,
            )?),
        })
    }

    /// Path of the redb ledger file.
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.redb")
    }
}

fn parse_var<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        var,
        reason: e.to_string(),
    })
}

fn optional<T>(var: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|v| parse_var(var, &v)).transpose()
}

fn positive<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let value = optional(var, raw)?.unwrap_or(default);
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            var,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn parse_selector(raw: &str) -> Result<[u8; 4], ConfigError> {
    let bytes = alloy::hex::decode(raw.trim()).map_err(|e| ConfigError::Invalid {
        var: CONTRACT_TRANSFER_SELECTOR_ENV,
        reason: e.to_string(),
    })?;
    bytes.try_into().map_err(|_| ConfigError::Invalid {
        var: CONTRACT_TRANSFER_SELECTOR_ENV,
        reason: "selector must be exactly 4 bytes".to_string(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}
