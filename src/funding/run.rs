//! Batch funding run.
//!
//! One transaction per batch, strictly sequential: every batch starts from a
//! fresh UTXO snapshot minus the outpoints this run already spent.

use super::{ErrorKind, FundingReconciler, ItemFailure, PaymentRecord, ReconcileError, RunSummary};
use crate::artifacts::{ArtifactRecord, ArtifactStore};
use crate::broadcast::{build_channels, BroadcastCoordinator, BroadcastError, ChannelError, VerifyPolicy};
use crate::config::SettleConfig;
use crate::core::{retry, total_amount, PaymentTarget, RetryPolicy, Transient, Utxo};
use crate::runtime::Shutdown;
use crate::tx::{plan_inputs, BuildError, FeeEstimator, SelectError, Signer, TransactionBuilder};
use crate::wallet::{GatewayError, WalletGateway, WalletHandle};
use bitcoin::{Amount, OutPoint};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub max_fee: Amount,
}

impl RunSettings {
    pub fn from_config(config: &SettleConfig) -> Self {
        Self {
            batch_size: config.funding.batch_size,
            batch_delay: config.funding.batch_delay,
            max_fee: config.funding.max_fee,
        }
    }
}

pub struct FundingRun {
    gateway: Arc<dyn WalletGateway>,
    reconciler: FundingReconciler,
    coordinator: BroadcastCoordinator,
    builder: TransactionBuilder,
    estimator: FeeEstimator,
    store: Arc<dyn ArtifactStore>,
    settings: RunSettings,
    retry: RetryPolicy,
    shutdown: Shutdown,
}

struct BatchContext<'a> {
    index: usize,
    targets: &'a [PaymentTarget],
}

impl BatchContext<'_> {
    fn failure(&self, kind: ErrorKind, reason: impl ToString) -> ItemFailure {
        ItemFailure {
            batch: self.index,
            addresses: self.targets.iter().map(|t| t.address.clone()).collect(),
            kind,
            reason: reason.to_string(),
            attempts: Vec::new(),
        }
    }
}

impl FundingRun {
    pub fn new(
        gateway: Arc<dyn WalletGateway>,
        coordinator: BroadcastCoordinator,
        builder: TransactionBuilder,
        estimator: FeeEstimator,
        store: Arc<dyn ArtifactStore>,
        settings: RunSettings,
    ) -> Self {
        Self {
            reconciler: FundingReconciler::new(gateway.clone()),
            gateway,
            coordinator,
            builder,
            estimator,
            store,
            settings,
            retry: RetryPolicy::default(),
            shutdown: Shutdown::new(),
        }
    }

    /// Wire a run from resolved settings: configured channels, fee rate, dust and retry policy.
    pub fn from_config(
        config: &SettleConfig,
        gateway: Arc<dyn WalletGateway>,
        store: Arc<dyn ArtifactStore>,
    ) -> Result<Self, ChannelError> {
        let wallet = config.wallet_handle();
        let channels = build_channels(&config.broadcast.channels, gateway.clone(), &wallet, config.broadcast.http_timeout)?;
        let coordinator = BroadcastCoordinator::new(channels)
            .with_verify(VerifyPolicy {
                attempts: config.broadcast.verify_attempts,
                interval: config.broadcast.verify_interval,
            })
            .with_retry(config.retry);

        Ok(Self::new(
            gateway,
            coordinator,
            TransactionBuilder::new(config.network, config.funding.dust_threshold),
            FeeEstimator::new(config.funding.fee_rate_sat_vb),
            store,
            RunSettings::from_config(config),
        )
        .with_retry(config.retry))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.reconciler = FundingReconciler::new(self.gateway.clone()).with_retry(retry);
        self.retry = retry;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn reconciler(&self) -> &FundingReconciler {
        &self.reconciler
    }

    /// Pay every target from the wallet at `funding_address`, `batch_size` outputs per transaction.
    pub async fn run(&self, wallet: &WalletHandle, funding_address: &str, targets: &[PaymentTarget]) -> RunSummary {
        let mut summary = RunSummary::new(&wallet.name, funding_address, targets.len());
        let batch_size = self.settings.batch_size.max(1);

        match self.reconciler.reconcile(wallet, funding_address).await {
            Ok(state) => {
                let batches = targets.len().div_ceil(batch_size) as u64;
                info!(
                    wallet = %wallet.name,
                    balance = state.balance.to_sat(),
                    batches,
                    fee_rate = self.estimator.rate_sat_vb(),
                    channels = ?self.coordinator.channel_names(),
                    "Funding run started"
                );
                let needed = total_amount(targets)
                    .zip(self.settings.max_fee.checked_mul(batches))
                    .and_then(|(outputs, fees)| outputs.checked_add(fees));
                match needed {
                    Some(needed) if state.balance < needed => {
                        warn!(balance = state.balance.to_sat(), needed = needed.to_sat(), "Balance may not cover every batch");
                    }
                    Some(_) => {}
                    None => warn!("Target amounts overflow, affected batches will fail"),
                }
            }
            Err(e) => {
                error!(wallet = %wallet.name, error = %e, "Reconciliation failed, aborting run");
                let context = BatchContext { index: 0, targets };
                summary.failures.push(context.failure(ErrorKind::Reconcile, &e));
                summary.fatal = Some(e.to_string());
                return self.finish(summary);
            }
        }

        let mut spent: HashSet<OutPoint> = HashSet::new();
        for (index, batch) in targets.chunks(batch_size).enumerate() {
            if index > 0 && self.shutdown.sleep(self.settings.batch_delay).await {
                summary.interrupted = true;
                break;
            }
            if self.shutdown.is_triggered() {
                summary.interrupted = true;
                break;
            }

            let context = BatchContext { index, targets: batch };
            let unverified = match self.fund_batch(wallet, funding_address, &context, &mut spent).await {
                Ok(record) => {
                    info!(batch = index, txid = %record.txid, outputs = batch.len(), fee = record.fee.to_sat(), "Batch funded");
                    summary.funded_targets += batch.len();
                    summary.transactions.push(record.txid);
                    let unverified = record.had_unverified();
                    self.record(ArtifactRecord::Payment(record));
                    unverified
                }
                Err(failure) => {
                    warn!(batch = index, kind = failure.kind.as_str(), reason = %failure.reason, "Batch failed");
                    let unverified = failure.had_unverified();
                    let fatal = failure.kind.is_run_fatal();
                    if fatal {
                        summary.fatal = Some(failure.reason.clone());
                    }
                    summary.failures.push(failure);
                    if fatal {
                        break;
                    }
                    unverified
                }
            };

            // an endpoint that accepted bytes the wallet never saw may have left the wallet stale
            if unverified {
                if let Err(e) = self.reconciler.reconcile(wallet, funding_address).await {
                    error!(error = %e, "Reconciliation after unverified broadcast failed");
                    summary.failures.push(context.failure(ErrorKind::Reconcile, &e));
                    summary.fatal = Some(e.to_string());
                    break;
                }
            }
        }

        self.finish(summary)
    }

    async fn fund_batch(
        &self,
        wallet: &WalletHandle,
        funding_address: &str,
        context: &BatchContext<'_>,
        spent: &mut HashSet<OutPoint>,
    ) -> Result<PaymentRecord, ItemFailure> {
        let gateway = self.gateway.as_ref();
        let target_total = total_amount(context.targets)
            .ok_or_else(|| context.failure(ErrorKind::Build, BuildError::AmountOverflow("output")))?;

        let mut resynced = false;
        let (selection, estimate) = loop {
            let available = self.snapshot(wallet, spent).await.map_err(|e| context.failure(gateway_kind(&e), e))?;
            match plan_inputs(&self.estimator, &available, target_total, context.targets.len(), self.settings.max_fee) {
                Ok(found) => break found,
                Err(SelectError::InsufficientFunds { available, required }) if !resynced => {
                    warn!(available = available.to_sat(), required = required.to_sat(), "Insufficient funds, re-syncing wallet once");
                    resynced = true;
                    self.reconciler
                        .reconcile(wallet, funding_address)
                        .await
                        .map_err(|e| context.failure(reconcile_kind(&e), e))?;
                }
                Err(e) => return Err(context.failure(ErrorKind::InsufficientFunds, e)),
            }
        };
        if estimate.degraded {
            warn!(batch = context.index, fee = estimate.fee.to_sat(), "Fee clamped to max_fee, transaction may confirm slowly");
        }

        let plan = self
            .builder
            .plan(selection.inputs, context.targets.to_vec(), funding_address, estimate.fee)
            .map_err(|e| context.failure(ErrorKind::Build, e))?;

        let signer = Signer::Wallet { gateway, wallet };
        let signed = retry(self.retry, "sign", || self.builder.build(&plan, signer))
            .await
            .map_err(|e| context.failure(build_kind(&e), e))?;

        let spent_now: Vec<OutPoint> = plan.inputs.iter().map(Utxo::outpoint).collect();
        match self.coordinator.broadcast(gateway, wallet, &signed).await {
            Ok(report) => {
                spent.extend(spent_now);
                Ok(PaymentRecord {
                    batch: context.index,
                    txid: report.txid,
                    channel: report.channel,
                    fee: signed.fee,
                    change: signed.change,
                    outputs: plan.outputs,
                    attempts: report.attempts,
                })
            }
            Err(e @ BroadcastError::Exhausted { .. }) => {
                // an accepted-but-unseen submission may still propagate
                if e.attempts().iter().any(|a| a.accepted) {
                    spent.extend(spent_now);
                }
                let mut failure = context.failure(ErrorKind::BroadcastExhausted, &e);
                failure.attempts = e.attempts().to_vec();
                Err(failure)
            }
        }
    }

    async fn snapshot(&self, wallet: &WalletHandle, spent: &HashSet<OutPoint>) -> Result<Vec<Utxo>, GatewayError> {
        let gateway = self.gateway.as_ref();
        let utxos = retry(self.retry, "list_unspent", || gateway.list_unspent(wallet)).await?;
        Ok(utxos.into_iter().filter(|u| !spent.contains(&u.outpoint())).collect())
    }

    fn record(&self, record: ArtifactRecord) {
        if let Err(e) = self.store.write_record(&record) {
            warn!(kind = record.kind(), error = %e, "Could not write artifact");
        }
    }

    fn finish(&self, mut summary: RunSummary) -> RunSummary {
        summary.finished_at = Some(chrono::Utc::now());
        info!(
            funded = summary.funded_targets,
            total = summary.total_targets,
            failures = summary.failures.len(),
            fatal = summary.fatal.is_some(),
            "Funding run finished"
        );
        self.record(ArtifactRecord::Summary(summary.clone()));
        summary
    }
}

fn gateway_kind(e: &GatewayError) -> ErrorKind {
    if e.is_transient() { ErrorKind::Transient } else { ErrorKind::Build }
}

fn build_kind(e: &BuildError) -> ErrorKind {
    if e.is_transient() { ErrorKind::Transient } else { ErrorKind::Build }
}

fn reconcile_kind(e: &ReconcileError) -> ErrorKind {
    match e {
        ReconcileError::Gateway(g) if g.is_transient() => ErrorKind::Transient,
        _ => ErrorKind::Reconcile,
    }
}
