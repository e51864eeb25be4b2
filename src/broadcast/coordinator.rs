//! BroadcastCoordinator - ordered fallback across channels.
//!
//! ```text
//! Built → Submitting(i) ─accepted→ Verifying(i) ─seen→ Confirmed
//!              │                        │
//!              └─failed─┐      unverified┘
//!                       ▼
//!               Submitting(i+1) … → ExhaustedFailed
//! ```

use super::{BroadcastChannel, ChannelError};
use crate::core::{retry, RetryPolicy, SignedTransaction};
use crate::wallet::{WalletGateway, WalletHandle};
use bitcoin::Txid;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    Verified,
    Unverified,
    NotAttempted,
}

/// Outcome of one channel attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastResult {
    pub channel: String,
    pub accepted: bool,
    pub txid: Txid,
    /// Id reported by the endpoint, when it returned one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported_id: Option<String>,
    pub verification: Verification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastState {
    Built,
    Submitting(usize),
    Verifying(usize),
    Confirmed(usize),
    ExhaustedFailed,
}

/// Successful broadcast: the confirming channel plus every attempt made.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastReport {
    pub txid: Txid,
    pub channel: String,
    pub attempts: Vec<BroadcastResult>,
}

/// Some channel accepted the bytes but the wallet never saw them.
pub fn any_unverified(attempts: &[BroadcastResult]) -> bool {
    attempts.iter().any(|a| a.verification == Verification::Unverified)
}

impl BroadcastReport {
    pub fn had_unverified(&self) -> bool {
        any_unverified(&self.attempts)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BroadcastError {
    #[error("Broadcast of {txid} failed on all {} channels", .attempts.len())]
    Exhausted { txid: Txid, attempts: Vec<BroadcastResult> },
}

impl BroadcastError {
    pub fn attempts(&self) -> &[BroadcastResult] {
        match self {
            BroadcastError::Exhausted { attempts, .. } => attempts,
        }
    }

    pub fn had_unverified(&self) -> bool {
        any_unverified(self.attempts())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub attempts: usize,
    pub interval: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self { attempts: 5, interval: Duration::from_secs(3) }
    }
}

pub struct BroadcastCoordinator {
    channels: Vec<Arc<dyn BroadcastChannel>>,
    verify: VerifyPolicy,
    retry: RetryPolicy,
}

impl BroadcastCoordinator {
    pub fn new(channels: Vec<Arc<dyn BroadcastChannel>>) -> Self {
        Self { channels, verify: VerifyPolicy::default(), retry: RetryPolicy::default() }
    }

    pub fn with_verify(mut self, verify: VerifyPolicy) -> Self { self.verify = verify; self }
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self { self.retry = retry; self }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Drive `tx` through the channels until one submission is observed by the wallet.
    pub async fn broadcast(
        &self,
        gateway: &dyn WalletGateway,
        wallet: &WalletHandle,
        tx: &SignedTransaction,
    ) -> Result<BroadcastReport, BroadcastError> {
        let mut attempts: Vec<BroadcastResult> = Vec::with_capacity(self.channels.len());
        let mut state = BroadcastState::Built;

        loop {
            state = match state {
                BroadcastState::Built => {
                    if self.channels.is_empty() {
                        BroadcastState::ExhaustedFailed
                    } else {
                        BroadcastState::Submitting(0)
                    }
                }
                BroadcastState::Submitting(i) => {
                    let channel = &self.channels[i];
                    debug!(txid = %tx.txid, channel = channel.name(), "submitting");
                    let outcome = retry(self.retry, channel.name(), || channel.submit(&tx.raw)).await;
                    match outcome {
                        Ok(reported_id) => {
                            if let Some(id) = reported_id.as_deref() {
                                if id != tx.txid.to_string() {
                                    warn!(txid = %tx.txid, channel = channel.name(), reported = id, "endpoint reported a different id");
                                }
                            }
                            attempts.push(BroadcastResult {
                                channel: channel.name().to_string(),
                                accepted: true,
                                txid: tx.txid,
                                reported_id,
                                verification: Verification::NotAttempted,
                                error: None,
                            });
                            BroadcastState::Verifying(i)
                        }
                        Err(e) => {
                            warn!(txid = %tx.txid, channel = channel.name(), error = %e, "channel failed");
                            attempts.push(failed(channel.name(), tx.txid, &e));
                            self.next(i)
                        }
                    }
                }
                BroadcastState::Verifying(i) => {
                    let seen = self.verify_seen(gateway, wallet, &tx.txid).await;
                    if let Some(last) = attempts.last_mut() {
                        if seen {
                            last.verification = Verification::Verified;
                        } else {
                            last.verification = Verification::Unverified;
                            last.error = Some(format!("not observed after {} checks", self.verify.attempts.max(1)));
                        }
                    }
                    if seen {
                        BroadcastState::Confirmed(i)
                    } else {
                        warn!(txid = %tx.txid, channel = self.channels[i].name(), "accepted but not visible to wallet, falling back");
                        self.next(i)
                    }
                }
                BroadcastState::Confirmed(i) => {
                    let channel = self.channels[i].name().to_string();
                    info!(txid = %tx.txid, %channel, attempts = attempts.len(), "Broadcast confirmed");
                    return Ok(BroadcastReport { txid: tx.txid, channel, attempts });
                }
                BroadcastState::ExhaustedFailed => {
                    warn!(txid = %tx.txid, channels = self.channels.len(), "Broadcast exhausted all channels");
                    return Err(BroadcastError::Exhausted { txid: tx.txid, attempts });
                }
            };
        }
    }

    fn next(&self, i: usize) -> BroadcastState {
        if i + 1 < self.channels.len() {
            BroadcastState::Submitting(i + 1)
        } else {
            BroadcastState::ExhaustedFailed
        }
    }

    async fn verify_seen(&self, gateway: &dyn WalletGateway, wallet: &WalletHandle, txid: &Txid) -> bool {
        for attempt in 1..=self.verify.attempts.max(1) {
            match gateway.has_transaction(wallet, txid).await {
                Ok(true) => return true,
                Ok(false) => debug!(%txid, attempt, "not yet visible"),
                Err(e) => debug!(%txid, attempt, error = %e, "verification query failed"),
            }
            if attempt < self.verify.attempts {
                tokio::time::sleep(self.verify.interval).await;
            }
        }
        false
    }
}

fn failed(channel: &str, txid: Txid, error: &ChannelError) -> BroadcastResult {
    BroadcastResult {
        channel: channel.to_string(),
        accepted: false,
        txid,
        reported_id: None,
        verification: Verification::NotAttempted,
        error: Some(error.to_string()),
    }
}
