// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-memory chain and transfer doubles for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;

use crate::blockchain::{
    ChainBlock, ChainClient, ChainClientError, ChainTransaction, TransferError, TransferExecutor,
    TransferReceipt,
};

fn hash_of(n: u64) -> B256 {
    B256::left_padding_from(&n.to_be_bytes())
}

// =============================================================================
// MockChain
// =============================================================================

#[derive(Default)]
struct ChainState {
    tip: u64,
    blocks: HashMap<u64, ChainBlock>,
    receipts: HashSet<B256>,
    native: HashMap<Address, U256>,
    tokens: HashMap<Address, U256>,
    gas_price: u128,
    failing_heights: HashSet<u64>,
    fail_gas_price: bool,
    fail_tip: bool,
}

pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    /// Empty chain at height 0 with a 1 gwei gas price.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChainState {
                gas_price: 1_000_000_000,
                ..ChainState::default()
            }),
        })
    }

    pub fn set_tip(&self, height: u64) {
        self.state.lock().unwrap().tip = height;
    }

    /// Add a block; raises the tip if needed. Receipts are added for every
    /// transaction unless `mined` is false.
    pub fn add_block(&self, height: u64, transactions: Vec<ChainTransaction>, mined: bool) {
        let mut state = self.state.lock().unwrap();
        if mined {
            for tx in &transactions {
                state.receipts.insert(tx.hash);
            }
        }
        state.tip = state.tip.max(height);
        state.blocks.insert(
            height,
            ChainBlock {
                number: height,
                hash: hash_of(height),
                transactions,
            },
        );
    }

    pub fn add_receipt(&self, tx_hash: B256) {
        self.state.lock().unwrap().receipts.insert(tx_hash);
    }

    pub fn set_native_balance(&self, address: Address, balance: U256) {
        self.state.lock().unwrap().native.insert(address, balance);
    }

    pub fn set_token_balance(&self, address: Address, balance: U256) {
        self.state.lock().unwrap().tokens.insert(address, balance);
    }

    pub fn fail_height(&self, height: u64, fail: bool) {
        let mut state = self.state.lock().unwrap();
        if fail {
            state.failing_heights.insert(height);
        } else {
            state.failing_heights.remove(&height);
        }
    }

    pub fn fail_gas_price(&self, fail: bool) {
        self.state.lock().unwrap().fail_gas_price = fail;
    }

    pub fn fail_tip(&self, fail: bool) {
        self.state.lock().unwrap().fail_tip = fail;
    }

    fn credit_native(&self, address: Address, amount: U256) {
        let mut state = self.state.lock().unwrap();
        let balance = state.native.entry(address).or_default();
        *balance = balance.saturating_add(amount);
    }

    fn move_tokens(&self, from: Address, to: Address, amount: U256) {
        let mut state = self.state.lock().unwrap();
        let source = state.tokens.entry(from).or_default();
        *source = source.saturating_sub(amount);
        let target = state.tokens.entry(to).or_default();
        *target = target.saturating_add(amount);
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn block_number(&self) -> Result<u64, ChainClientError> {
        let state = self.state.lock().unwrap();
        if state.fail_tip {
            return Err(ChainClientError::Rpc("connection refused".into()));
        }
        Ok(state.tip)
    }

    async fn block(&self, height: u64) -> Result<ChainBlock, ChainClientError> {
        let state = self.state.lock().unwrap();
        if state.failing_heights.contains(&height) {
            return Err(ChainClientError::Rpc("connection reset".into()));
        }
        match state.blocks.get(&height) {
            Some(block) => Ok(block.clone()),
            None if height <= state.tip => Ok(ChainBlock {
                number: height,
                hash: hash_of(height),
                transactions: Vec::new(),
            }),
            None => Err(ChainClientError::BlockNotFound(height)),
        }
    }

    async fn has_receipt(&self, tx_hash: B256) -> Result<bool, ChainClientError> {
        Ok(self.state.lock().unwrap().receipts.contains(&tx_hash))
    }

    async fn gas_price(&self) -> Result<u128, ChainClientError> {
        let state = self.state.lock().unwrap();
        if state.fail_gas_price {
            return Err(ChainClientError::Rpc("gas price unavailable".into()));
        }
        Ok(state.gas_price)
    }

    async fn native_balance(&self, address: Address) -> Result<U256, ChainClientError> {
        Ok(self.state.lock().unwrap().native.get(&address).copied().unwrap_or_default())
    }

    async fn token_balance(&self, _token: Address, holder: Address) -> Result<U256, ChainClientError> {
        Ok(self.state.lock().unwrap().tokens.get(&holder).copied().unwrap_or_default())
    }
}

// =============================================================================
// MockExecutor
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    Native {
        from: Address,
        to: Address,
        amount: U256,
        wait: bool,
    },
    Token {
        from: Address,
        to: Address,
        amount: U256,
        wait: bool,
    },
}

/// Records transfers; optionally applies them to a [`MockChain`].
pub struct MockExecutor {
    transfers: Mutex<Vec<Transfer>>,
    fail_native: AtomicBool,
    fail_token: AtomicBool,
    unconfirmed_token: AtomicBool,
    chain: Mutex<Option<(Arc<MockChain>, bool)>>,
    nonce: AtomicU64,
}

impl MockExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            transfers: Mutex::new(Vec::new()),
            fail_native: AtomicBool::new(false),
            fail_token: AtomicBool::new(false),
            unconfirmed_token: AtomicBool::new(false),
            chain: Mutex::new(None),
            nonce: AtomicU64::new(0),
        })
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.transfers.lock().unwrap().clone()
    }

    pub fn fail_native_transfers(&self, fail: bool) {
        self.fail_native.store(fail, Ordering::SeqCst);
    }

    pub fn fail_token_transfers(&self, fail: bool) {
        self.fail_token.store(fail, Ordering::SeqCst);
    }

    /// Token transfers are broadcast but never get a receipt in time.
    pub fn leave_token_transfers_unconfirmed(&self, unconfirmed: bool) {
        self.unconfirmed_token.store(unconfirmed, Ordering::SeqCst);
    }

    /// Apply transfers to `chain`. With `mine_native`, native transfers are
    /// credited and get a receipt immediately; otherwise they stay pending.
    pub fn confirm_native_on(&self, chain: &Arc<MockChain>, mine_native: bool) {
        *self.chain.lock().unwrap() = Some((chain.clone(), mine_native));
    }

    fn next_hash(&self) -> B256 {
        hash_of(0xfee0_0000 + self.nonce.fetch_add(1, Ordering::SeqCst))
    }

    fn linked_chain(&self) -> Option<(Arc<MockChain>, bool)> {
        self.chain.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransferExecutor for MockExecutor {
    async fn transfer_native(
        &self,
        from: Address,
        to: Address,
        amount: U256,
        wait_for_confirmation: bool,
    ) -> Result<TransferReceipt, TransferError> {
        self.transfers.lock().unwrap().push(Transfer::Native {
            from,
            to,
            amount,
            wait: wait_for_confirmation,
        });
        if self.fail_native.load(Ordering::SeqCst) {
            return Err(TransferError::Rejected("insufficient funds".into()));
        }

        let tx_hash = self.next_hash();
        if let Some((chain, true)) = self.linked_chain() {
            chain.credit_native(to, amount);
            chain.add_receipt(tx_hash);
        }
        Ok(TransferReceipt {
            tx_hash: Some(tx_hash),
        })
    }

    async fn transfer_token(
        &self,
        from: Address,
        to: Address,
        amount: U256,
        wait_for_confirmation: bool,
    ) -> Result<TransferReceipt, TransferError> {
        self.transfers.lock().unwrap().push(Transfer::Token {
            from,
            to,
            amount,
            wait: wait_for_confirmation,
        });
        if self.fail_token.load(Ordering::SeqCst) {
            return Err(TransferError::Rejected("execution reverted".into()));
        }

        let tx_hash = self.next_hash();
        if self.unconfirmed_token.load(Ordering::SeqCst) {
            return Err(TransferError::Unconfirmed(tx_hash));
        }
        if let Some((chain, _)) = self.linked_chain() {
            chain.move_tokens(from, to, amount);
            chain.add_receipt(tx_hash);
        }
        Ok(TransferReceipt {
            tx_hash: Some(tx_hash),
        })
    }
}

// =============================================================================
// Fixtures
// =============================================================================

pub mod fixture {
    use std::sync::Arc;

    use alloy::primitives::{address, Address, Bytes, B256, U256};
    use rust_decimal::Decimal;

    use super::{MockChain, MockExecutor};
    use crate::blockchain::transactions::token_transfer_input;
    use crate::blockchain::ChainTransaction;
    use crate::models::{Contract, TrackedAccount, WithdrawalWallet};
    use crate::storage::LedgerDatabase;

    pub const TOKEN: Address = address!("00000000000000000000000000000000000000c7");
    pub const OTHER_TOKEN: Address = address!("00000000000000000000000000000000000000d8");
    pub const CUSTOMER: Address = address!("00000000000000000000000000000000000000ab");
    pub const STRANGER: Address = address!("00000000000000000000000000000000000000ee");
    pub const WITHDRAWAL: Address = address!("0000000000000000000000000000000000000077");

    pub fn contract() -> Contract {
        Contract {
            address: TOKEN,
            transfer_selector: Contract::ERC20_TRANSFER_SELECTOR,
            decimals: 18,
            gas_limit: 60_000,
        }
    }

    pub fn withdrawal_wallet(min_collect_amount: Decimal) -> WithdrawalWallet {
        WithdrawalWallet {
            address: WITHDRAWAL,
            key_file: "/keys/withdraw.pem".into(),
            min_collect_amount,
        }
    }

    /// 1.0 token at 18 decimals.
    pub fn one_token() -> U256 {
        U256::from(10u64).pow(U256::from(18))
    }

    /// A `transfer(recipient, amount)` call sent to `contract` at `height`.
    pub fn token_tx(
        hash_byte: u8,
        height: u64,
        contract: Address,
        recipient: Address,
        amount: U256,
    ) -> ChainTransaction {
        ChainTransaction {
            hash: B256::repeat_byte(hash_byte),
            block_hash: B256::left_padding_from(&height.to_be_bytes()),
            block_number: height,
            to: Some(contract),
            input: Bytes::from(token_transfer_input(recipient, amount)),
        }
    }

    /// Mock chain, mock executor and a temporary ledger tracking
    /// [`CUSTOMER`].
    pub struct Fixture {
        pub chain: Arc<MockChain>,
        pub executor: Arc<MockExecutor>,
        pub ledger: Arc<LedgerDatabase>,
        pub contract: Contract,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let ledger = LedgerDatabase::open(&dir.path().join("ledger.redb")).unwrap();
            ledger
                .register_account(&TrackedAccount::new(CUSTOMER, "customer-1"))
                .unwrap();
            Self {
                chain: MockChain::new(),
                executor: MockExecutor::new(),
                ledger: Arc::new(ledger),
                contract: contract(),
                _dir: dir,
            }
        }
    }
}
