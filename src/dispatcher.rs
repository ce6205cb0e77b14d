// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Sweep Dispatcher
//!
//! Moves newly recorded deposits to the withdrawal wallet, off the scanning
//! path.
//!
//! ## Strategy
//!
//! For each `Detected` deposit a worker:
//! 1. Computes the miner fee (`gas_price * gas_limit`).
//! 2. If the deposit address cannot pay it, sends the fee from the withdrawal
//!    wallet, persists the deposit as `FeeEnsured` and hands the job to a
//!    timer. The worker permit is released while the timer runs.
//! 3. Once the fee transfer shows a receipt (or the balance covers the fee),
//!    sends the deposit's token amount to the withdrawal wallet and persists
//!    `Swept` or `Failed`.
//!
//! ## Shutdown
//!
//! Pending timers are dropped on cancellation. Deposits keep their persisted
//! state, and [`Dispatcher::resume`] re-submits every non-terminal deposit on
//! the next start.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blockchain::{ChainClient, ChainClientError, TransferError, TransferExecutor};
use crate::models::{Contract, Deposit, DepositStatus};
use crate::storage::{LedgerDatabase, LedgerError};

/// Consecutive chain read failures tolerated per deposit before giving up.
const MAX_TRANSIENT_RETRIES: u32 = 10;

/// A unit of dispatcher work: the deposit is re-read from the ledger on
/// every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepJob {
    pub tx_hash: B256,
    /// Fee-confirmation re-checks so far
    pub attempt: u32,
    /// Chain read failures since the last successful step
    pub transient_failures: u32,
}

impl SweepJob {
    pub fn new(tx_hash: B256) -> Self {
        Self {
            tx_hash,
            attempt: 0,
            transient_failures: 0,
        }
    }

    fn next_attempt(self) -> Self {
        Self {
            attempt: self.attempt + 1,
            transient_failures: 0,
            ..self
        }
    }

    fn after_transient_failure(self) -> Self {
        Self {
            transient_failures: self.transient_failures + 1,
            ..self
        }
    }

    /// The job to enqueue once `step`'s delay has elapsed.
    fn follow_up(self, step: Step) -> Option<Self> {
        match step {
            Step::Done(_) => None,
            Step::RecheckAfter(_) => Some(self.next_attempt()),
            Step::RetryAfter(_) => Some(self.after_transient_failure()),
        }
    }
}

/// What the dispatcher should do with a job after one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The deposit reached a terminal state
    Done(DepositStatus),
    /// The fee top-up is not confirmed yet; re-check after the delay
    RecheckAfter(Duration),
    /// A chain read failed; retry the same step after the delay
    RetryAfter(Duration),
}

impl Step {
    fn delay(self) -> Option<Duration> {
        match self {
            Step::Done(_) => None,
            Step::RecheckAfter(delay) | Step::RetryAfter(delay) => Some(delay),
        }
    }
}

/// Backoff for fee-confirmation re-checks.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationBackoff {
    pub initial: Duration,
    pub max: Duration,
    /// Give up on a fee top-up this long after it was sent
    pub timeout: Duration,
}

impl ConfirmationBackoff {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
            timeout,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("deposit {0} not found in ledger")]
    UnknownDeposit(B256),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

// =============================================================================
// Dispatcher handle + queue
// =============================================================================

/// Cloneable handle used to submit deposits for sweeping.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    queue: mpsc::UnboundedSender<SweepJob>,
}

impl Dispatcher {
    /// Create a handle and the queue that drains it.
    pub fn new() -> (Self, DispatchQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { queue: tx.clone() },
            DispatchQueue {
                rx,
                requeue: tx,
            },
        )
    }

    /// Enqueue a deposit. Never blocks.
    pub fn submit(&self, deposit: &Deposit) {
        if self.queue.send(SweepJob::new(deposit.tx_hash)).is_err() {
            warn!(
                tx_hash = %deposit.tx_hash,
                "Dispatch queue closed, deposit will be resumed on restart"
            );
        }
    }

    /// Re-submit every deposit that has not reached a terminal state.
    pub fn resume(&self, ledger: &LedgerDatabase) -> Result<usize, LedgerError> {
        let open = ledger.open_deposits()?;
        for deposit in &open {
            self.submit(deposit);
        }
        if !open.is_empty() {
            info!(count = open.len(), "Resumed unfinished deposits");
        }
        Ok(open.len())
    }
}

/// Receiving side of the dispatcher; runs the worker pool.
pub struct DispatchQueue {
    rx: mpsc::UnboundedReceiver<SweepJob>,
    requeue: mpsc::UnboundedSender<SweepJob>,
}

impl DispatchQueue {
    /// Drain the queue with at most `workers` steps in flight until the
    /// cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(queue.run(worker, 4, shutdown.clone()));
    /// ```
    pub async fn run(mut self, worker: Arc<SweepWorker>, workers: usize, shutdown: CancellationToken) {
        info!(workers, "Sweep dispatcher starting");

        let permits = Arc::new(Semaphore::new(workers.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            let job = tokio::select! {
                _ = shutdown.cancelled() => break,
                job = self.rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let worker = worker.clone();
            let requeue = self.requeue.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let step = worker.process(job).await;
                drop(permit);

                match step {
                    Ok(step) => {
                        let (Some(delay), Some(next)) = (step.delay(), job.follow_up(step)) else {
                            return;
                        };
                        debug!(tx_hash = %job.tx_hash, delay_ms = delay.as_millis() as u64, "Re-check scheduled");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {
                                let _ = requeue.send(next);
                            }
                            _ = shutdown.cancelled() => {}
                        }
                    }
                    Err(e) => {
                        error!(tx_hash = %job.tx_hash, error = %e, "Sweep step failed");
                    }
                }
            });

            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    error!(error = %e, "Sweep task panicked");
                }
            }
        }

        info!(in_flight = tasks.len(), "Sweep dispatcher shutting down");
        while tasks.join_next().await.is_some() {}
    }

    #[cfg(test)]
    pub(crate) fn try_next(&mut self) -> Option<SweepJob> {
        self.rx.try_recv().ok()
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Fee ensurer + sweep executor for one deposit at a time.
pub struct SweepWorker {
    chain: Arc<dyn ChainClient>,
    executor: Arc<dyn TransferExecutor>,
    ledger: Arc<LedgerDatabase>,
    contract: Contract,
    withdrawal: Address,
    backoff: ConfirmationBackoff,
}

impl SweepWorker {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        executor: Arc<dyn TransferExecutor>,
        ledger: Arc<LedgerDatabase>,
        contract: Contract,
        withdrawal: Address,
        backoff: ConfirmationBackoff,
    ) -> Self {
        Self {
            chain,
            executor,
            ledger,
            contract,
            withdrawal,
            backoff,
        }
    }

    /// Advance a deposit by one step.
    ///
    /// # Arguments
    ///
    /// * `job` - The deposit to advance and its retry counters
    ///
    /// # Returns
    ///
    /// `Done` once the deposit is terminal, otherwise the delay before the
    /// job should run again. A failed chain read is retried until
    /// `MAX_TRANSIENT_RETRIES` consecutive failures, then the deposit fails.
    pub async fn process(&self, job: SweepJob) -> Result<Step, DispatchError> {
        let mut deposit = self
            .ledger
            .get_deposit(&job.tx_hash)?
            .ok_or(DispatchError::UnknownDeposit(job.tx_hash))?;

        let step = match deposit.status {
            DepositStatus::Swept | DepositStatus::Failed => return Ok(Step::Done(deposit.status)),
            DepositStatus::Detected => self.ensure_fee(&mut deposit, job).await,
            DepositStatus::FeeEnsured => self.await_fee(&mut deposit, job).await,
        };

        match step {
            Ok(outcome) => outcome,
            Err(e) if job.transient_failures < MAX_TRANSIENT_RETRIES => {
                warn!(
                    tx_hash = %deposit.tx_hash,
                    failures = job.transient_failures + 1,
                    error = %e,
                    "Chain query failed, will retry"
                );
                Ok(Step::RetryAfter(self.backoff.delay(job.transient_failures)))
            }
            Err(e) => self.fail(&mut deposit, format!("chain unavailable: {e}")),
        }
    }

    /// Step 1-2: make sure the deposit address can pay for the sweep.
    async fn ensure_fee(
        &self,
        deposit: &mut Deposit,
        job: SweepJob,
    ) -> Result<Result<Step, DispatchError>, ChainClientError> {
        let fee = self.miner_fee().await?;
        let balance = self.chain.native_balance(deposit.address).await?;

        if balance >= fee {
            return Ok(self.sweep(deposit).await);
        }

        info!(
            address = %deposit.address,
            balance = %balance,
            fee = %fee,
            "Insufficient miner fee, topping up from withdrawal wallet"
        );

        let top_up = self
            .executor
            .transfer_native(self.withdrawal, deposit.address, fee, false)
            .await;

        Ok(match top_up {
            Ok(receipt) => {
                deposit.mark_fee_ensured(receipt.tx_hash);
                self.ledger
                    .update_deposit(deposit)
                    .map(|()| Step::RecheckAfter(self.backoff.delay(job.attempt)))
                    .map_err(DispatchError::from)
            }
            Err(e) => self.fail(deposit, format!("fee top-up failed: {e}")),
        })
    }

    /// Step 2 (resumed): sweep once the fee top-up is confirmed.
    async fn await_fee(
        &self,
        deposit: &mut Deposit,
        job: SweepJob,
    ) -> Result<Result<Step, DispatchError>, ChainClientError> {
        let confirmed = match deposit.fee_tx_hash {
            Some(fee_tx) => self.chain.has_receipt(fee_tx).await?,
            None => {
                let fee = self.miner_fee().await?;
                self.chain.native_balance(deposit.address).await? >= fee
            }
        };

        if confirmed {
            return Ok(self.sweep(deposit).await);
        }

        let waited = (Utc::now() - deposit.updated_at).to_std().unwrap_or_default();
        if waited >= self.backoff.timeout {
            return Ok(self.fail(
                deposit,
                format!("fee top-up not confirmed after {}s", waited.as_secs()),
            ));
        }

        Ok(Ok(Step::RecheckAfter(self.backoff.delay(job.attempt))))
    }

    /// Step 3: move the deposited tokens to the withdrawal wallet.
    async fn sweep(&self, deposit: &mut Deposit) -> Result<Step, DispatchError> {
        info!(
            from = %deposit.address,
            to = %self.withdrawal,
            amount = %deposit.amount,
            "Sweeping deposit to withdrawal wallet"
        );

        match self
            .executor
            .transfer_token(deposit.address, self.withdrawal, deposit.raw_amount, true)
            .await
        {
            Ok(receipt) => {
                deposit.mark_swept(receipt.tx_hash);
                self.ledger.update_deposit(deposit)?;
                self.refresh_balances(deposit.address).await;
                info!(tx_hash = %deposit.tx_hash, sweep_tx = ?receipt.tx_hash, "Deposit swept");
                Ok(Step::Done(DepositStatus::Swept))
            }
            Err(e) => {
                // Keep the audit trail pointing at a sweep that may still land.
                if let TransferError::Unconfirmed(hash) | TransferError::Reverted(hash) = &e {
                    deposit.sweep_tx_hash = Some(*hash);
                }
                self.fail(deposit, format!("sweep failed: {e}"))
            }
        }
    }

    fn fail(&self, deposit: &mut Deposit, reason: String) -> Result<Step, DispatchError> {
        warn!(tx_hash = %deposit.tx_hash, address = %deposit.address, reason = %reason, "Deposit failed");
        deposit.mark_failed(reason);
        self.ledger.update_deposit(deposit)?;
        Ok(Step::Done(DepositStatus::Failed))
    }

    async fn miner_fee(&self) -> Result<U256, ChainClientError> {
        Ok(self.contract.miner_fee(self.chain.gas_price().await?))
    }

    /// Best-effort refresh of the cached balances after a sweep.
    async fn refresh_balances(&self, address: Address) {
        let balances = async {
            let token = self.chain.token_balance(self.contract.address, address).await?;
            let native = self.chain.native_balance(address).await?;
            Ok::<_, ChainClientError>((token, native))
        };
        match balances.await {
            Ok((token, native)) => {
                if let Err(e) = self.ledger.update_balances(&address, token, native) {
                    warn!(address = %address, error = %e, "Failed to persist refreshed balances");
                }
            }
            Err(e) => warn!(address = %address, error = %e, "Failed to refresh balances"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, Transfer};

    fn worker(fx: &fixture::Fixture) -> SweepWorker {
        SweepWorker::new(
            fx.chain.clone(),
            fx.executor.clone(),
            fx.ledger.clone(),
            fx.contract.clone(),
            fixture::WITHDRAWAL,
            ConfirmationBackoff {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(40),
                timeout: Duration::from_secs(60),
            },
        )
    }

    fn detected(fx: &fixture::Fixture, tx: u8) -> Deposit {
        let deposit = Deposit::detected(
            B256::repeat_byte(tx),
            B256::repeat_byte(0xbb),
            1000,
            fixture::CUSTOMER,
            "1".to_string(),
            fixture::one_token(),
        );
        fx.ledger.insert_deposit_if_absent(&deposit).unwrap();
        deposit
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let backoff = ConfirmationBackoff::with_timeout(Duration::from_secs(900));
        assert_eq!(backoff.delay(0), Duration::from_secs(5));
        assert_eq!(backoff.delay(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(3), Duration::from_secs(40));
        assert_eq!(backoff.delay(4), Duration::from_secs(60));
        assert_eq!(backoff.delay(40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_funded_address_is_swept_in_one_step() {
        let fx = fixture::Fixture::new();
        fx.chain.set_native_balance(fixture::CUSTOMER, U256::from(10u64).pow(U256::from(18)));
        let deposit = detected(&fx, 0x01);

        let step = worker(&fx).process(SweepJob::new(deposit.tx_hash)).await.unwrap();
        assert_eq!(step, Step::Done(DepositStatus::Swept));

        let transfers = fx.executor.transfers();
        assert_eq!(
            transfers,
            vec![Transfer::Token {
                from: fixture::CUSTOMER,
                to: fixture::WITHDRAWAL,
                amount: fixture::one_token(),
                wait: true,
            }]
        );
        let stored = fx.ledger.get_deposit(&deposit.tx_hash).unwrap().unwrap();
        assert_eq!(stored.status, DepositStatus::Swept);
        assert!(stored.sweep_tx_hash.is_some());
    }

    #[tokio::test]
    async fn test_starved_address_gets_fee_then_sweeps_after_confirmation() {
        let fx = fixture::Fixture::new();
        fx.executor.confirm_native_on(&fx.chain, false);
        let deposit = detected(&fx, 0x02);
        let w = worker(&fx);

        let step = w.process(SweepJob::new(deposit.tx_hash)).await.unwrap();
        assert!(matches!(step, Step::RecheckAfter(_)));
        let stored = fx.ledger.get_deposit(&deposit.tx_hash).unwrap().unwrap();
        assert_eq!(stored.status, DepositStatus::FeeEnsured);
        let fee_tx = stored.fee_tx_hash.unwrap();

        // Fee not mined yet: keep waiting, no sweep.
        let step = w.process(SweepJob::new(deposit.tx_hash).next_attempt()).await.unwrap();
        assert!(matches!(step, Step::RecheckAfter(_)));
        assert_eq!(fx.executor.transfers().len(), 1);

        fx.chain.add_receipt(fee_tx);
        let step = w.process(SweepJob::new(deposit.tx_hash).next_attempt()).await.unwrap();
        assert_eq!(step, Step::Done(DepositStatus::Swept));

        let transfers = fx.executor.transfers();
        assert_eq!(transfers.len(), 2);
        assert!(matches!(
            transfers[0],
            Transfer::Native { from, to, wait: false, .. }
                if from == fixture::WITHDRAWAL && to == fixture::CUSTOMER
        ));
    }

    #[tokio::test]
    async fn test_fee_top_up_timeout_fails_deposit() {
        let fx = fixture::Fixture::new();
        fx.executor.confirm_native_on(&fx.chain, false);
        let deposit = detected(&fx, 0x03);
        let mut w = worker(&fx);
        w.backoff.timeout = Duration::ZERO;

        w.process(SweepJob::new(deposit.tx_hash)).await.unwrap();
        let step = w.process(SweepJob::new(deposit.tx_hash)).await.unwrap();
        assert_eq!(step, Step::Done(DepositStatus::Failed));
    }

    #[tokio::test]
    async fn test_token_transfer_error_marks_failed() {
        let fx = fixture::Fixture::new();
        fx.chain.set_native_balance(fixture::CUSTOMER, U256::from(10u64).pow(U256::from(18)));
        fx.executor.fail_token_transfers(true);
        let deposit = detected(&fx, 0x04);

        let step = worker(&fx).process(SweepJob::new(deposit.tx_hash)).await.unwrap();
        assert_eq!(step, Step::Done(DepositStatus::Failed));
        let stored = fx.ledger.get_deposit(&deposit.tx_hash).unwrap().unwrap();
        assert!(stored.failure_reason.unwrap().contains("sweep failed"));
    }

    #[tokio::test]
    async fn test_terminal_deposit_is_left_alone() {
        let fx = fixture::Fixture::new();
        let mut deposit = detected(&fx, 0x05);
        deposit.mark_failed("operator");
        fx.ledger.update_deposit(&deposit).unwrap();

        let step = worker(&fx).process(SweepJob::new(deposit.tx_hash)).await.unwrap();
        assert_eq!(step, Step::Done(DepositStatus::Failed));
        assert!(fx.executor.transfers().is_empty());
    }

    #[tokio::test]
    async fn test_chain_outage_is_retried_before_failing() {
        let fx = fixture::Fixture::new();
        fx.chain.fail_gas_price(true);
        let deposit = detected(&fx, 0x06);
        let w = worker(&fx);

        let step = w.process(SweepJob::new(deposit.tx_hash)).await.unwrap();
        assert!(matches!(step, Step::RetryAfter(_)));

        let exhausted = SweepJob {
            tx_hash: deposit.tx_hash,
            attempt: 0,
            transient_failures: MAX_TRANSIENT_RETRIES,
        };
        assert_eq!(w.process(exhausted).await.unwrap(), Step::Done(DepositStatus::Failed));
    }

    #[tokio::test]
    async fn test_outage_after_many_rechecks_is_still_retried() {
        let fx = fixture::Fixture::new();
        let mut deposit = detected(&fx, 0x0a);
        deposit.mark_fee_ensured(None);
        fx.ledger.update_deposit(&deposit).unwrap();
        fx.chain.fail_gas_price(true);
        let w = worker(&fx);

        // Ten fee re-checks have already happened.
        let mut job = SweepJob::new(deposit.tx_hash);
        for _ in 0..MAX_TRANSIENT_RETRIES {
            job = job.next_attempt();
        }

        let step = w.process(job).await.unwrap();
        assert!(matches!(step, Step::RetryAfter(_)));
        let stored = fx.ledger.get_deposit(&deposit.tx_hash).unwrap().unwrap();
        assert_eq!(stored.status, DepositStatus::FeeEnsured);

        // The failure counter grows on retries and resets on the next re-check.
        let retried = job.follow_up(step).unwrap();
        assert_eq!(retried.attempt, MAX_TRANSIENT_RETRIES);
        assert_eq!(retried.transient_failures, 1);
        let rechecked = retried.follow_up(Step::RecheckAfter(Duration::ZERO)).unwrap();
        assert_eq!(rechecked.attempt, MAX_TRANSIENT_RETRIES + 1);
        assert_eq!(rechecked.transient_failures, 0);

        fx.chain.fail_gas_price(false);
        fx.chain.set_native_balance(fixture::CUSTOMER, U256::from(10u64).pow(U256::from(18)));
        assert_eq!(w.process(rechecked).await.unwrap(), Step::Done(DepositStatus::Swept));
    }

    #[tokio::test]
    async fn test_unconfirmed_sweep_keeps_its_hash() {
        let fx = fixture::Fixture::new();
        fx.chain.set_native_balance(fixture::CUSTOMER, U256::from(10u64).pow(U256::from(18)));
        fx.executor.leave_token_transfers_unconfirmed(true);
        let deposit = detected(&fx, 0x0b);

        let step = worker(&fx).process(SweepJob::new(deposit.tx_hash)).await.unwrap();
        assert_eq!(step, Step::Done(DepositStatus::Failed));

        let stored = fx.ledger.get_deposit(&deposit.tx_hash).unwrap().unwrap();
        assert!(stored.sweep_tx_hash.is_some());
        assert!(stored.failure_reason.unwrap().contains("not confirmed"));
    }

    #[tokio::test]
    async fn test_queue_drives_starved_deposit_to_swept() {
        let fx = fixture::Fixture::new();
        fx.executor.confirm_native_on(&fx.chain, true);
        let deposit = detected(&fx, 0x07);

        let (dispatcher, queue) = Dispatcher::new();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(queue.run(Arc::new(worker(&fx)), 2, shutdown.clone()));

        dispatcher.submit(&deposit);

        let mut status = DepositStatus::Detected;
        for _ in 0..200 {
            status = fx.ledger.get_deposit(&deposit.tx_hash).unwrap().unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, DepositStatus::Swept);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_resume_resubmits_open_deposits() {
        let fx = fixture::Fixture::new();
        let open = detected(&fx, 0x08);
        let mut done = detected(&fx, 0x09);
        done.mark_swept(None);
        fx.ledger.update_deposit(&done).unwrap();

        let (dispatcher, mut queue) = Dispatcher::new();
        assert_eq!(dispatcher.resume(&fx.ledger).unwrap(), 1);
        assert_eq!(queue.try_next(), Some(SweepJob::new(open.tx_hash)));
        assert_eq!(queue.try_next(), None);
    }
}
