// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded ledger database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `accounts`: lowercase address → serialized TrackedAccount
//! - `deposits`: tx_hash → serialized Deposit
//! - `open_deposits`: tx_hash of every non-terminal deposit
//! - `scanner_state`: key → u64 (sync cursor)
//! - `revisit_heights`: block height → passes attempted so far
//!
//! Every write runs in its own redb write transaction. redb allows a single
//! writer at a time, which is what makes [`LedgerDatabase::insert_deposit_if_absent`]
//! a compare-and-create.

use std::path::Path;

use alloy::primitives::{Address, B256, U256};
use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};

use crate::models::{Deposit, DepositStatus, TrackedAccount};

// =============================================================================
// Table Definitions
// =============================================================================

const ACCOUNTS: TableDefinition<&str, &[u8]> = TableDefinition::new("accounts");

const DEPOSITS: TableDefinition<&str, &[u8]> = TableDefinition::new("deposits");

/// Secondary index of deposits still owned by the dispatcher.
const OPEN_DEPOSITS: TableDefinition<&str, u8> = TableDefinition::new("open_deposits");

const SCANNER_STATE: TableDefinition<&str, u64> = TableDefinition::new("scanner_state");

const REVISIT_HEIGHTS: TableDefinition<u64, u32> = TableDefinition::new("revisit_heights");

const SYNC_CURSOR_KEY: &str = "sync_cursor";

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("deposit {tx_hash} is {status} and can no longer change")]
    Terminal { tx_hash: B256, status: DepositStatus },
}

pub type LedgerResult<T> = Result<T, LedgerError>;

fn account_key(address: &Address) -> String {
    format!("{address:#x}")
}

fn deposit_key(tx_hash: &B256) -> String {
    format!("{tx_hash:#x}")
}

// =============================================================================
// LedgerDatabase
// =============================================================================

/// Embedded ACID ledger of tracked accounts, deposits and scanner state.
pub struct LedgerDatabase {
    db: Database,
}

impl LedgerDatabase {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> LedgerResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ACCOUNTS)?;
            let _ = write_txn.open_table(DEPOSITS)?;
            let _ = write_txn.open_table(OPEN_DEPOSITS)?;
            let _ = write_txn.open_table(SCANNER_STATE)?;
            let _ = write_txn.open_table(REVISIT_HEIGHTS)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    // =========================================================================
    // Tracked accounts
    // =========================================================================

    /// Register (or replace) a tracked account.
    pub fn register_account(&self, account: &TrackedAccount) -> LedgerResult<()> {
        let json = serde_json::to_vec(account)?;
        let key = account_key(&account.address);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ACCOUNTS)?;
            table.insert(key.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Membership test for the tracked-account set.
    pub fn is_tracked(&self, address: &Address) -> LedgerResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS)?;
        Ok(table.get(account_key(address).as_str())?.is_some())
    }

    pub fn find_account(&self, address: &Address) -> LedgerResult<Option<TrackedAccount>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS)?;
        match table.get(account_key(address).as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// One page of accounts in address order, starting after `after`.
    pub fn list_accounts(
        &self,
        after: Option<&Address>,
        limit: usize,
    ) -> LedgerResult<Vec<TrackedAccount>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS)?;

        let start = after.map(account_key);
        let range = match start.as_deref() {
            Some(key) => table.range(key..)?,
            None => table.range::<&str>(..)?,
        };

        let mut accounts = Vec::with_capacity(limit);
        for entry in range {
            let (key, value) = entry?;
            // The cursor entry itself is the previous page's last item.
            if start.as_deref() == Some(key.value()) {
                continue;
            }
            accounts.push(serde_json::from_slice(value.value())?);
            if accounts.len() >= limit {
                break;
            }
        }
        Ok(accounts)
    }

    /// Persist freshly observed balances for an account.
    pub fn update_balances(
        &self,
        address: &Address,
        token_balance: U256,
        native_balance: U256,
    ) -> LedgerResult<()> {
        let key = account_key(address);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ACCOUNTS)?;

            let existing_bytes = {
                let existing = table
                    .get(key.as_str())?
                    .ok_or_else(|| LedgerError::NotFound(format!("Account {key}")))?;
                existing.value().to_vec()
            };

            let mut account: TrackedAccount = serde_json::from_slice(&existing_bytes)?;
            account.token_balance = token_balance;
            account.native_balance = native_balance;
            account.updated_at = Utc::now();

            let json = serde_json::to_vec(&account)?;
            table.insert(key.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Accounts whose cached balances are at or above both thresholds.
    pub fn find_collectible(
        &self,
        min_token: U256,
        min_native: U256,
    ) -> LedgerResult<Vec<TrackedAccount>> {
        Ok(self
            .all_accounts()?
            .into_iter()
            .filter(|a| a.token_balance >= min_token && a.native_balance >= min_native)
            .collect())
    }

    /// Sum of cached token balances across all accounts.
    pub fn total_token_balance(&self) -> LedgerResult<U256> {
        Ok(self
            .all_accounts()?
            .iter()
            .fold(U256::ZERO, |sum, a| sum.saturating_add(a.token_balance)))
    }

    fn all_accounts(&self) -> LedgerResult<Vec<TrackedAccount>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS)?;
        let mut accounts = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            accounts.push(serde_json::from_slice(value.value())?);
        }
        Ok(accounts)
    }

    // =========================================================================
    // Deposits
    // =========================================================================

    /// Create the deposit unless one already exists for its transaction.
    ///
    /// Returns `true` if this call created the record.
    pub fn insert_deposit_if_absent(&self, deposit: &Deposit) -> LedgerResult<bool> {
        let key = deposit_key(&deposit.tx_hash);
        let json = serde_json::to_vec(deposit)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DEPOSITS)?;
            if table.get(key.as_str())?.is_some() {
                return Ok(false);
            }
            table.insert(key.as_str(), json.as_slice())?;

            if !deposit.status.is_terminal() {
                let mut open = write_txn.open_table(OPEN_DEPOSITS)?;
                open.insert(key.as_str(), 0u8)?;
            }
        }
        write_txn.commit()?;
        Ok(true)
    }

    pub fn get_deposit(&self, tx_hash: &B256) -> LedgerResult<Option<Deposit>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DEPOSITS)?;
        match table.get(deposit_key(tx_hash).as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Overwrite a deposit's state. A deposit already stored as `Swept` or
    /// `Failed` is never rewritten.
    pub fn update_deposit(&self, deposit: &Deposit) -> LedgerResult<()> {
        let key = deposit_key(&deposit.tx_hash);
        let json = serde_json::to_vec(deposit)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DEPOSITS)?;

            let stored_status = {
                let existing = table
                    .get(key.as_str())?
                    .ok_or_else(|| LedgerError::NotFound(format!("Deposit {key}")))?;
                let stored: Deposit = serde_json::from_slice(existing.value())?;
                stored.status
            };
            if stored_status.is_terminal() {
                return Err(LedgerError::Terminal {
                    tx_hash: deposit.tx_hash,
                    status: stored_status,
                });
            }

            table.insert(key.as_str(), json.as_slice())?;

            let mut open = write_txn.open_table(OPEN_DEPOSITS)?;
            if deposit.status.is_terminal() {
                open.remove(key.as_str())?;
            } else {
                open.insert(key.as_str(), 0u8)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Deposits that are neither swept nor failed.
    pub fn open_deposits(&self) -> LedgerResult<Vec<Deposit>> {
        let read_txn = self.db.begin_read()?;
        let open = read_txn.open_table(OPEN_DEPOSITS)?;
        let table = read_txn.open_table(DEPOSITS)?;

        let mut deposits = Vec::new();
        for entry in open.iter()? {
            let (key, _) = entry?;
            if let Some(value) = table.get(key.value())? {
                deposits.push(serde_json::from_slice(value.value())?);
            }
        }
        deposits.sort_by_key(|d: &Deposit| (d.block_height, d.detected_at));
        Ok(deposits)
    }

    pub fn count_deposits(&self) -> LedgerResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DEPOSITS)?;
        Ok(table.len()?)
    }

    // =========================================================================
    // Scanner state
    // =========================================================================

    /// Last fully scanned height, if the scanner has ever run.
    pub fn sync_cursor(&self) -> LedgerResult<Option<u64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SCANNER_STATE)?;
        Ok(table.get(SYNC_CURSOR_KEY)?.map(|v| v.value()))
    }

    /// Set the cursor only if none is stored yet.
    pub fn init_sync_cursor(&self, height: u64) -> LedgerResult<u64> {
        let write_txn = self.db.begin_write()?;
        let cursor = {
            let mut table = write_txn.open_table(SCANNER_STATE)?;
            let existing = table.get(SYNC_CURSOR_KEY)?.map(|v| v.value());
            match existing {
                Some(current) => current,
                None => {
                    table.insert(SYNC_CURSOR_KEY, height)?;
                    height
                }
            }
        };
        write_txn.commit()?;
        Ok(cursor)
    }

    /// Move the cursor forward to `height`. Never moves it backwards;
    /// returns the cursor after the call.
    pub fn advance_sync_cursor(&self, height: u64) -> LedgerResult<u64> {
        let write_txn = self.db.begin_write()?;
        let cursor = {
            let mut table = write_txn.open_table(SCANNER_STATE)?;
            let current = table.get(SYNC_CURSOR_KEY)?.map(|v| v.value());
            match current {
                Some(current) if current >= height => current,
                _ => {
                    table.insert(SYNC_CURSOR_KEY, height)?;
                    height
                }
            }
        };
        write_txn.commit()?;
        Ok(cursor)
    }

    /// Heights that had unconfirmed transactions, with attempts so far.
    pub fn revisit_heights(&self) -> LedgerResult<Vec<(u64, u32)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(REVISIT_HEIGHTS)?;
        let mut heights = Vec::new();
        for entry in table.iter()? {
            let (height, attempts) = entry?;
            heights.push((height.value(), attempts.value()));
        }
        Ok(heights)
    }

    /// Remember `height` for a later pass, bumping its attempt counter.
    pub fn mark_revisit(&self, height: u64) -> LedgerResult<u32> {
        let write_txn = self.db.begin_write()?;
        let attempts = {
            let mut table = write_txn.open_table(REVISIT_HEIGHTS)?;
            let attempts = table.get(height)?.map(|v| v.value()).unwrap_or(0) + 1;
            table.insert(height, attempts)?;
            attempts
        };
        write_txn.commit()?;
        Ok(attempts)
    }

    pub fn clear_revisit(&self, height: u64) -> LedgerResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(REVISIT_HEIGHTS)?;
            table.remove(height)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (LedgerDatabase, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = LedgerDatabase::open(&dir.path().join("test.redb")).unwrap();
        (db, dir)
    }

    fn sample_deposit(tx: u8) -> Deposit {
        Deposit::detected(
            B256::repeat_byte(tx),
            B256::repeat_byte(0xbb),
            1000,
            Address::repeat_byte(0xab),
            "1".to_string(),
            U256::from(1_000_000_000_000_000_000u64),
        )
    }

    #[test]
    fn test_deposit_is_created_once() {
        let (db, _dir) = temp_db();
        let deposit = sample_deposit(0x01);
        assert!(db.insert_deposit_if_absent(&deposit).unwrap());

        // Same tx re-observed with a fresh identity.
        let again = sample_deposit(0x01);
        assert!(!db.insert_deposit_if_absent(&again).unwrap());

        let stored = db.get_deposit(&deposit.tx_hash).unwrap().unwrap();
        assert_eq!(stored.id, deposit.id);
        assert_eq!(db.count_deposits().unwrap(), 1);
    }

    #[test]
    fn test_terminal_deposit_is_not_rewritten() {
        let (db, _dir) = temp_db();
        let mut deposit = sample_deposit(0x02);
        db.insert_deposit_if_absent(&deposit).unwrap();
        assert_eq!(db.open_deposits().unwrap().len(), 1);

        deposit.mark_swept(Some(B256::repeat_byte(0x99)));
        db.update_deposit(&deposit).unwrap();
        assert!(db.open_deposits().unwrap().is_empty());

        let mut late = deposit.clone();
        late.failure_reason = Some("late writer".into());
        let err = db.update_deposit(&late).unwrap_err();
        assert!(matches!(err, LedgerError::Terminal { status: DepositStatus::Swept, .. }));
    }

    #[test]
    fn test_open_deposits_track_non_terminal_states() {
        let (db, _dir) = temp_db();
        let mut fee = sample_deposit(0x03);
        db.insert_deposit_if_absent(&fee).unwrap();
        fee.mark_fee_ensured(Some(B256::repeat_byte(0x44)));
        db.update_deposit(&fee).unwrap();

        let open = db.open_deposits().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].status, DepositStatus::FeeEnsured);
    }

    #[test]
    fn test_cursor_only_moves_forward() {
        let (db, _dir) = temp_db();
        assert_eq!(db.sync_cursor().unwrap(), None);
        assert_eq!(db.init_sync_cursor(500).unwrap(), 500);
        assert_eq!(db.init_sync_cursor(10).unwrap(), 500);

        assert_eq!(db.advance_sync_cursor(510).unwrap(), 510);
        assert_eq!(db.advance_sync_cursor(505).unwrap(), 510);
        assert_eq!(db.sync_cursor().unwrap(), Some(510));
    }

    #[test]
    fn test_revisit_attempts_accumulate() {
        let (db, _dir) = temp_db();
        assert_eq!(db.mark_revisit(42).unwrap(), 1);
        assert_eq!(db.mark_revisit(42).unwrap(), 2);
        assert_eq!(db.revisit_heights().unwrap(), vec![(42, 2)]);
        db.clear_revisit(42).unwrap();
        assert!(db.revisit_heights().unwrap().is_empty());
    }

    #[test]
    fn test_accounts_paginate_in_address_order() {
        let (db, _dir) = temp_db();
        for i in 1..=5u8 {
            db.register_account(&TrackedAccount::new(Address::repeat_byte(i), format!("c{i}")))
                .unwrap();
        }

        let page1 = db.list_accounts(None, 2).unwrap();
        assert_eq!(page1.len(), 2);
        let page2 = db.list_accounts(Some(&page1[1].address), 2).unwrap();
        assert_eq!(page2.len(), 2);
        let page3 = db.list_accounts(Some(&page2[1].address), 2).unwrap();
        assert_eq!(page3.len(), 1);
        assert_eq!(page3[0].address, Address::repeat_byte(5));
    }

    #[test]
    fn test_membership_ignores_address_case() {
        let (db, _dir) = temp_db();
        let addr: Address = "0xABCD1234567890ABCDEF1234567890ABCDEF1234".parse().unwrap();
        db.register_account(&TrackedAccount::new(addr, "customer-42")).unwrap();

        let lower: Address = "0xabcd1234567890abcdef1234567890abcdef1234".parse().unwrap();
        assert!(db.is_tracked(&lower).unwrap());
        assert!(!db.is_tracked(&Address::repeat_byte(0x77)).unwrap());
    }

    #[test]
    fn test_balances_feed_collectible_and_total() {
        let (db, _dir) = temp_db();
        let rich = Address::repeat_byte(0x01);
        let poor = Address::repeat_byte(0x02);
        db.register_account(&TrackedAccount::new(rich, "rich")).unwrap();
        db.register_account(&TrackedAccount::new(poor, "poor")).unwrap();

        db.update_balances(&rich, U256::from(500u64), U256::from(10u64)).unwrap();
        db.update_balances(&poor, U256::from(5u64), U256::from(10u64)).unwrap();

        let collectible = db.find_collectible(U256::from(100u64), U256::from(10u64)).unwrap();
        assert_eq!(collectible.len(), 1);
        assert_eq!(collectible[0].address, rich);
        assert_eq!(db.total_token_balance().unwrap(), U256::from(505u64));
    }

    #[test]
    fn test_updating_unknown_account_is_not_found() {
        let (db, _dir) = temp_db();
        let err = db
            .update_balances(&Address::repeat_byte(0x09), U256::ZERO, U256::ZERO)
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }
}
