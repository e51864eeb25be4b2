//! FundingReconciler - keeps the node wallet's funding address in line with expectations.
//!
//! Drift happens when a wallet is recreated, reloaded from another seed, or had
//! its descriptors replaced. Recovery is re-importing the funding key; without
//! key material there is nothing to recover from and the run must stop.

use crate::core::{retry, RetryPolicy};
use crate::wallet::{GatewayError, KeyError, WalletGateway, WalletHandle};
use bitcoin::Amount;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Wallet {wallet} has no usable funding address and no key material to re-import")]
    NoKeyMaterial { wallet: String },
    #[error("Key material derives {derived}, expected funding address is {expected}")]
    KeyMismatch { expected: String, derived: String },
    #[error("Funding address still {actual:?} after re-import, expected {expected}")]
    StillMismatched { expected: String, actual: Option<String> },
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Snapshot of the funding wallet after reconciliation. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FundingState {
    pub wallet_name: String,
    pub expected_address: String,
    pub actual_address: Option<String>,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub balance: Amount,
}

impl FundingState {
    pub fn is_consistent(&self) -> bool {
        self.actual_address.as_deref().is_some_and(|a| same_address(a, &self.expected_address))
    }
}

fn same_address(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

pub struct FundingReconciler {
    gateway: Arc<dyn WalletGateway>,
    retry: RetryPolicy,
}

impl FundingReconciler {
    pub fn new(gateway: Arc<dyn WalletGateway>) -> Self {
        Self { gateway, retry: RetryPolicy::default() }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Pick the address the run should fund from: an explicit setting, then the
    /// key material's address, then whatever the wallet currently reports.
    pub async fn expected_address(&self, wallet: &WalletHandle, configured: Option<&str>) -> Result<String, ReconcileError> {
        if let Some(address) = configured {
            return Ok(address.to_string());
        }
        if let Some(material) = &wallet.key_material {
            return Ok(material.signing_key(wallet.network)?.address.to_string());
        }
        let gateway = self.gateway.as_ref();
        retry(self.retry, "create_or_load_wallet", || gateway.create_or_load_wallet(wallet)).await?;
        retry(self.retry, "receiving_address", || gateway.receiving_address(wallet))
            .await?
            .ok_or_else(|| ReconcileError::NoKeyMaterial { wallet: wallet.name.clone() })
    }

    /// Make the wallet's funding address equal `expected`, re-importing the key if needed.
    ///
    /// Calling this again without outside changes returns the same state and
    /// performs no import.
    pub async fn reconcile(&self, wallet: &WalletHandle, expected: &str) -> Result<FundingState, ReconcileError> {
        let gateway = self.gateway.as_ref();
        retry(self.retry, "create_or_load_wallet", || gateway.create_or_load_wallet(wallet)).await?;

        let actual = retry(self.retry, "receiving_address", || gateway.receiving_address(wallet)).await?;
        if actual.as_deref().is_some_and(|a| same_address(a, expected)) {
            return self.state(wallet, expected, actual).await;
        }

        warn!(wallet = %wallet.name, expected, actual = ?actual, "Funding address mismatch");

        let material = wallet
            .key_material
            .as_ref()
            .ok_or_else(|| ReconcileError::NoKeyMaterial { wallet: wallet.name.clone() })?;
        let key = material.signing_key(wallet.network)?;
        let derived = key.address.to_string();
        if !same_address(&derived, expected) {
            return Err(ReconcileError::KeyMismatch { expected: expected.to_string(), derived });
        }

        retry(self.retry, "import_key", || gateway.import_key(wallet, &key)).await?;

        let actual = retry(self.retry, "receiving_address", || gateway.receiving_address(wallet)).await?;
        if !actual.as_deref().is_some_and(|a| same_address(a, expected)) {
            return Err(ReconcileError::StillMismatched { expected: expected.to_string(), actual });
        }

        info!(wallet = %wallet.name, address = expected, kind = material.kind(), "Funding key re-imported");
        self.state(wallet, expected, actual).await
    }

    async fn state(&self, wallet: &WalletHandle, expected: &str, actual: Option<String>) -> Result<FundingState, ReconcileError> {
        let gateway = self.gateway.as_ref();
        let balance = retry(self.retry, "balance", || gateway.balance(wallet)).await?;
        Ok(FundingState {
            wallet_name: wallet.name.clone(),
            expected_address: expected.to_string(),
            actual_address: actual,
            balance,
        })
    }
}
