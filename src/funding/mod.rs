//! Funding - reconcile the funding wallet, then pay targets batch by batch.

mod reconciler;
mod run;

pub use reconciler::{FundingReconciler, FundingState, ReconcileError};
pub use run::{FundingRun, RunSettings};

use crate::broadcast::{any_unverified, BroadcastResult};
use crate::core::PaymentTarget;
use bitcoin::{Amount, Txid};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Failure classes. Only `Reconcile` stops the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    InsufficientFunds,
    Build,
    BroadcastExhausted,
    Reconcile,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::Build => "build",
            ErrorKind::BroadcastExhausted => "broadcast_exhausted",
            ErrorKind::Reconcile => "reconcile",
        }
    }

    pub fn is_run_fatal(&self) -> bool {
        matches!(self, ErrorKind::Reconcile)
    }
}

/// One batch that could not be paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub batch: usize,
    pub addresses: Vec<String>,
    pub kind: ErrorKind,
    pub reason: String,
    /// Broadcast attempts, present for exhausted broadcasts
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<BroadcastResult>,
}

impl ItemFailure {
    pub fn had_unverified(&self) -> bool {
        any_unverified(&self.attempts)
    }
}

/// One broadcast payment transaction.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRecord {
    pub batch: usize,
    pub txid: Txid,
    pub channel: String,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub fee: Amount,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub change: Amount,
    pub outputs: Vec<PaymentTarget>,
    pub attempts: Vec<BroadcastResult>,
}

impl PaymentRecord {
    pub fn had_unverified(&self) -> bool {
        any_unverified(&self.attempts)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub wallet_name: String,
    pub funding_address: String,
    pub total_targets: usize,
    pub funded_targets: usize,
    pub transactions: Vec<Txid>,
    pub failures: Vec<ItemFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
    pub interrupted: bool,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSummary {
    pub fn new(wallet_name: &str, funding_address: &str, total_targets: usize) -> Self {
        Self {
            wallet_name: wallet_name.to_string(),
            funding_address: funding_address.to_string(),
            total_targets,
            funded_targets: 0,
            transactions: Vec::new(),
            failures: Vec::new(),
            fatal: None,
            interrupted: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn failures_of(&self, kind: ErrorKind) -> usize {
        self.failures.iter().filter(|f| f.kind == kind).count()
    }

    /// 0 unless the run stopped on a fatal condition.
    pub fn exit_code(&self) -> i32 {
        if self.fatal.is_some() { 2 } else { 0 }
    }
}
