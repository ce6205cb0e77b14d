// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Block Scanner
//!
//! Walks block heights in order, picks out token transfers into tracked
//! accounts and records them as deposits.
//!
//! ## Strategy
//!
//! For every height in `[start, end]`:
//! 1. Fetch the block's transactions.
//! 2. Decode each transaction addressed to the token contract, keep transfers
//!    into tracked accounts, and require a receipt. A relevant transaction
//!    without a receipt puts the height on the revisit list.
//! 3. Record the remaining transfers in block order and notify the
//!    [`DepositSink`].
//! 4. Advance the sync cursor to the height.
//!
//! Sync and event mode share all of the above. Event mode inspects a block's
//! transactions concurrently and emits deposits on a channel; sync mode works
//! one transaction at a time and returns them in the [`ScanReport`].
//!
//! ## Checkpointing
//!
//! The sync cursor is persisted in the ledger after every height, so a
//! failed range resumes from the last completed height. Rescanning lower
//! heights is always allowed and never moves the cursor back.

pub mod recorder;

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blockchain::{ChainClient, ChainClientError, ChainTransaction, TransferDecoder};
use crate::models::{Contract, Deposit};
use crate::storage::{LedgerDatabase, LedgerError};

pub use recorder::{DepositCandidate, DepositRecorder};

// =============================================================================
// Mode + sinks
// =============================================================================

/// How deposits are delivered and how much per-block parallelism is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Inline callback, one transaction at a time
    Sync,
    /// Channel emission, concurrent inspection within a block
    Event,
}

impl ScanMode {
    /// Transaction inspections in flight per block.
    pub fn concurrency(self, configured: usize) -> usize {
        match self {
            ScanMode::Sync => 1,
            ScanMode::Event => configured.max(1),
        }
    }
}

impl FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(ScanMode::Sync),
            "event" => Ok(ScanMode::Event),
            other => Err(format!("unknown scan mode '{other}', expected 'sync' or 'event'")),
        }
    }
}

/// Receives every deposit the scanner records.
#[async_trait]
pub trait DepositSink: Send + Sync {
    async fn on_deposit(&self, deposit: &Deposit);
}

/// Calls a closure for every deposit.
pub struct InlineSink<F> {
    callback: F,
}

impl<F> InlineSink<F>
where
    F: Fn(&Deposit) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> DepositSink for InlineSink<F>
where
    F: Fn(&Deposit) + Send + Sync,
{
    async fn on_deposit(&self, deposit: &Deposit) {
        (self.callback)(deposit);
    }
}

/// Emits deposits to a deposit-confirmed observer.
pub struct EventSink {
    events: mpsc::UnboundedSender<Deposit>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Deposit>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }
}

#[async_trait]
impl DepositSink for EventSink {
    async fn on_deposit(&self, deposit: &Deposit) {
        if self.events.send(deposit.clone()).is_err() {
            debug!(tx_hash = %deposit.tx_hash, "Deposit observer gone");
        }
    }
}

// =============================================================================
// Errors + report
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("chain unavailable at height {height}: {source}")]
    Transport {
        height: u64,
        #[source]
        source: ChainClientError,
    },

    #[error("range starts at {start} but heights after {cursor} have not been scanned")]
    CursorGap { cursor: u64, start: u64 },

    #[error("invalid range {start}..={end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Outcome of scanning a height range.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Deposits created by this scan, in block order
    pub deposits: Vec<Deposit>,
    /// Transactions inspected
    pub transactions: usize,
    /// Heights left with relevant but unconfirmed transactions
    pub unconfirmed_heights: Vec<u64>,
    /// Sync cursor after the scan
    pub cursor: u64,
}

// =============================================================================
// ChainWatcher
// =============================================================================

/// A chain-specific scanner.
#[async_trait]
pub trait ChainWatcher: Send + Sync {
    /// Current chain tip; `0` when the node cannot be reached.
    async fn network_height(&self) -> u64;

    /// Scan `[start, end]`, notifying `sink` of each recorded deposit.
    ///
    /// # Arguments
    ///
    /// * `start` - First height, at most one past the sync cursor
    /// * `end` - Last height, inclusive
    /// * `sink` - Receives deposits in block order
    ///
    /// # Returns
    ///
    /// A [`ScanReport`]. On error the cursor stays at the last completed
    /// height.
    async fn scan(&self, start: u64, end: u64, sink: &dyn DepositSink) -> Result<ScanReport, ScanError>;
}

enum Inspection {
    Irrelevant,
    Unconfirmed,
    Candidate(DepositCandidate),
}

/// [`ChainWatcher`] for a single token contract on an EVM chain.
pub struct BlockScanner {
    chain: Arc<dyn ChainClient>,
    ledger: Arc<LedgerDatabase>,
    recorder: DepositRecorder,
    decoder: TransferDecoder,
    concurrency: usize,
}

impl BlockScanner {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        ledger: Arc<LedgerDatabase>,
        recorder: DepositRecorder,
        contract: &Contract,
    ) -> Self {
        Self {
            chain,
            ledger,
            recorder,
            decoder: TransferDecoder::new(contract),
            concurrency: 1,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    async fn inspect(&self, height: u64, tx: &ChainTransaction) -> Result<Inspection, ScanError> {
        let call = match self.decoder.decode(&tx.input, tx.to) {
            Ok(Some(call)) => call,
            Ok(None) => return Ok(Inspection::Irrelevant),
            Err(e) => {
                debug!(tx_hash = %tx.hash, error = %e, "Undecodable transfer input");
                return Ok(Inspection::Irrelevant);
            }
        };

        if !self.ledger.is_tracked(&call.recipient)? {
            return Ok(Inspection::Irrelevant);
        }

        let mined = self
            .chain
            .has_receipt(tx.hash)
            .await
            .map_err(|source| ScanError::Transport { height, source })?;
        if !mined {
            debug!(tx_hash = %tx.hash, height, "Transfer has no receipt yet");
            return Ok(Inspection::Unconfirmed);
        }

        Ok(Inspection::Candidate(DepositCandidate {
            recipient: call.recipient,
            raw_amount: call.amount,
            tx_hash: tx.hash,
            block_hash: tx.block_hash,
            block_height: height,
        }))
    }

    /// Process one height. Returns `(inspected, unconfirmed)`.
    async fn scan_height(
        &self,
        height: u64,
        sink: &dyn DepositSink,
        deposits: &mut Vec<Deposit>,
    ) -> Result<(usize, usize), ScanError> {
        let block = self
            .chain
            .block(height)
            .await
            .map_err(|source| ScanError::Transport { height, source })?;

        let transactions = block.transactions.len();
        let inspections: Vec<Result<Inspection, ScanError>> = stream::iter(block.transactions)
            .map(|tx| async move { self.inspect(height, &tx).await })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut unconfirmed = 0;
        for inspection in inspections {
            let candidate = match inspection? {
                Inspection::Candidate(candidate) => candidate,
                Inspection::Unconfirmed => {
                    unconfirmed += 1;
                    continue;
                }
                Inspection::Irrelevant => continue,
            };

            if let Some(deposit) = self.recorder.record(&candidate)? {
                sink.on_deposit(&deposit).await;
                deposits.push(deposit);
            }
        }

        Ok((transactions, unconfirmed))
    }

    /// Run a synchronous-mode scan and return the deposits it created.
    pub async fn sync_range(&self, start: u64, end: u64) -> Result<Vec<Deposit>, ScanError> {
        let sink = InlineSink::new(|_: &Deposit| {});
        Ok(self.scan(start, end, &sink).await?.deposits)
    }

    /// Highest fully scanned height, `0` before the first scan.
    pub fn sync_height(&self) -> Result<u64, ScanError> {
        Ok(self.ledger.sync_cursor()?.unwrap_or(0))
    }
}

#[async_trait]
impl ChainWatcher for BlockScanner {
    async fn network_height(&self) -> u64 {
        match self.chain.block_number().await {
            Ok(height) => height,
            Err(e) => {
                warn!(error = %e, "Failed to read chain tip");
                0
            }
        }
    }

    async fn scan(&self, start: u64, end: u64, sink: &dyn DepositSink) -> Result<ScanReport, ScanError> {
        if start > end {
            return Err(ScanError::InvalidRange { start, end });
        }
        let cursor = self.ledger.sync_cursor()?;
        if let Some(cursor) = cursor {
            if start > cursor.saturating_add(1) {
                return Err(ScanError::CursorGap { cursor, start });
            }
        }

        let pending: HashSet<u64> = self
            .ledger
            .revisit_heights()?
            .into_iter()
            .map(|(height, _)| height)
            .collect();

        let mut report = ScanReport {
            cursor: cursor.unwrap_or(0),
            ..ScanReport::default()
        };

        for height in start..=end {
            let (inspected, unconfirmed) = self.scan_height(height, sink, &mut report.deposits).await?;
            report.transactions += inspected;

            if unconfirmed > 0 {
                let attempts = self.ledger.mark_revisit(height)?;
                debug!(height, unconfirmed, attempts, "Height queued for revisit");
                report.unconfirmed_heights.push(height);
            } else if pending.contains(&height) {
                self.ledger.clear_revisit(height)?;
            }

            report.cursor = self.ledger.advance_sync_cursor(height)?;
        }

        if !report.deposits.is_empty() {
            info!(
                from_block = start,
                to_block = end,
                deposits = report.deposits.len(),
                "Recorded deposits"
            );
        }
        Ok(report)
    }
}

// =============================================================================
// ScanLoop
// =============================================================================

/// Background task following the chain tip.
pub struct ScanLoop {
    watcher: Arc<dyn ChainWatcher>,
    ledger: Arc<LedgerDatabase>,
    sink: Arc<dyn DepositSink>,
    step: u64,
    confirmations: u64,
    poll_interval: Duration,
}

impl ScanLoop {
    pub fn new(
        watcher: Arc<dyn ChainWatcher>,
        ledger: Arc<LedgerDatabase>,
        sink: Arc<dyn DepositSink>,
        step: u64,
        confirmations: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            watcher,
            ledger,
            sink,
            step: step.max(1),
            confirmations,
            poll_interval,
        }
    }

    /// Run until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(scan_loop.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            step = self.step,
            confirmations = self.confirmations,
            "Block scanner starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Block scanner shutting down");
                return;
            }

            if let Err(e) = self.pass(&shutdown).await {
                warn!(error = %e, "Scan pass failed, will retry");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Block scanner shutting down");
                    return;
                }
            }
        }
    }

    /// Revisit pending heights, then scan towards the confirmed tip in
    /// `step`-sized ranges.
    pub async fn pass(&self, shutdown: &CancellationToken) -> Result<(), ScanError> {
        self.revisit().await?;

        let tip = self.watcher.network_height().await;
        if tip == 0 {
            debug!("Chain tip unknown, skipping pass");
            return Ok(());
        }
        let target = tip.saturating_sub(self.confirmations);

        let Some(mut cursor) = self.ledger.sync_cursor()? else {
            let cursor = self.ledger.init_sync_cursor(target)?;
            info!(height = cursor, "Sync cursor initialized at confirmed tip");
            return Ok(());
        };

        while cursor < target && !shutdown.is_cancelled() {
            let start = cursor + 1;
            let end = cursor.saturating_add(self.step).min(target);
            let report = self.watcher.scan(start, end, self.sink.as_ref()).await?;
            debug!(
                from_block = start,
                to_block = end,
                transactions = report.transactions,
                deposits = report.deposits.len(),
                "Scanned range"
            );
            cursor = report.cursor;
        }
        Ok(())
    }

    /// Heights stay on the revisit list until every relevant transaction has
    /// a receipt.
    async fn revisit(&self) -> Result<(), ScanError> {
        for (height, attempts) in self.ledger.revisit_heights()? {
            if attempts > 0 && attempts % 100 == 0 {
                warn!(height, attempts, "Transfers at height still have no receipt");
            }
            self.watcher.scan(height, height, self.sink.as_ref()).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
