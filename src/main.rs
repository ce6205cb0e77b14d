// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use relational_token_reconciler::blockchain::{
    ChainClient, EvmChainClient, KeyStore, TransferExecutor, WalletTransferExecutor,
};
use relational_token_reconciler::collector::CollectionJob;
use relational_token_reconciler::config::{Settings, LOG_FORMAT_ENV};
use relational_token_reconciler::dispatcher::{ConfirmationBackoff, Dispatcher, SweepWorker};
use relational_token_reconciler::error::StartupError;
use relational_token_reconciler::models::Deposit;
use relational_token_reconciler::scanner::{
    BlockScanner, DepositRecorder, DepositSink, EventSink, InlineSink, ScanLoop, ScanMode,
};
use relational_token_reconciler::storage::LedgerDatabase;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Token reconciler failed to start");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run() -> Result<(), StartupError> {
    let settings = Settings::from_env()?;
    info!(
        rpc_url = %settings.rpc_url,
        contract = %settings.contract.address,
        withdrawal = %settings.withdrawal.address,
        mode = ?settings.scan.mode,
        "Token reconciler starting"
    );

    let ledger = Arc::new(LedgerDatabase::open(&settings.ledger_path())?);

    // Fail fast on a missing or mismatched withdrawal key.
    let keys = KeyStore::new(
        &settings.keystore_dir,
        settings.withdrawal.address,
        &settings.withdrawal.key_file,
    );
    keys.wallet_for(settings.withdrawal.address)?;

    let chain: Arc<dyn ChainClient> = Arc::new(EvmChainClient::new(settings.rpc_url.clone()));
    let executor: Arc<dyn TransferExecutor> = Arc::new(WalletTransferExecutor::new(
        settings.rpc_url.clone(),
        keys,
        settings.contract.clone(),
    ));

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    // Dispatcher first, so resumed and newly detected deposits share one queue.
    let (dispatcher, queue) = Dispatcher::new();
    let worker = Arc::new(SweepWorker::new(
        chain.clone(),
        executor.clone(),
        ledger.clone(),
        settings.contract.clone(),
        settings.withdrawal.address,
        ConfirmationBackoff::with_timeout(settings.fee_confirm_timeout),
    ));
    tasks.spawn(queue.run(worker, settings.dispatch_workers, shutdown.clone()));
    dispatcher.resume(&ledger)?;

    if let (Some(start), None) = (settings.scan.start_height, ledger.sync_cursor()?) {
        let cursor = ledger.init_sync_cursor(start.saturating_sub(1))?;
        info!(height = cursor, "Sync cursor initialized from configuration");
    }

    let recorder = DepositRecorder::new(ledger.clone(), settings.contract.decimals, dispatcher);
    let scanner = BlockScanner::new(chain.clone(), ledger.clone(), recorder, &settings.contract)
        .with_concurrency(settings.scan.mode.concurrency(settings.scan.concurrency));

    let sink: Arc<dyn DepositSink> = match settings.scan.mode {
        ScanMode::Sync => Arc::new(InlineSink::new(|deposit: &Deposit| {
            debug!(tx_hash = %deposit.tx_hash, "Deposit handed to dispatcher");
        })),
        ScanMode::Event => {
            let (sink, events) = EventSink::channel();
            tasks.spawn(observe_deposits(events, shutdown.clone()));
            Arc::new(sink)
        }
    };

    let scan_loop = ScanLoop::new(
        Arc::new(scanner),
        ledger.clone(),
        sink,
        settings.scan.step,
        settings.scan.confirmations,
        settings.scan.interval,
    );
    tasks.spawn(scan_loop.run(shutdown.clone()));

    let collection = CollectionJob::new(
        chain,
        executor,
        ledger,
        settings.contract,
        settings.withdrawal,
        settings.collect_interval,
    );
    tasks.spawn(collection.run(shutdown.clone()));

    shutdown_signal().await;
    info!("Shutdown requested, stopping background tasks");
    shutdown.cancel();

    while let Some(finished) = tasks.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "Background task panicked");
        }
    }
    info!("Token reconciler stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Deposit-confirmed observer for event mode.
async fn observe_deposits(mut events: mpsc::UnboundedReceiver<Deposit>, shutdown: CancellationToken) {
    loop {
        let deposit = tokio::select! {
            _ = shutdown.cancelled() => return,
            deposit = events.recv() => match deposit {
                Some(deposit) => deposit,
                None => return,
            },
        };
        info!(
            tx_hash = %deposit.tx_hash,
            address = %deposit.address,
            amount = %deposit.amount,
            height = deposit.block_height,
            "Deposit confirmed"
        );
    }
}
