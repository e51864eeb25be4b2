//! Value types shared by selection, building and broadcast.

use bitcoin::{Amount, OutPoint, Txid};
use serde::{Deserialize, Serialize};

/// A keypair and address produced for a payment batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedAddress {
    pub index: u32,
    pub address: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wif: Option<String>,
    pub network: String,
}

impl GeneratedAddress {
    /// Copy with every secret encoding removed, for logs and artifacts.
    pub fn without_secrets(&self) -> Self {
        Self { private_key: None, wif: None, ..self.clone() }
    }
}

/// Unspent output snapshot entry, as reported by the wallet backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    pub confirmations: u32,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint { txid: self.txid, vout: self.vout }
    }
}

/// One payment output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentTarget {
    pub address: String,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl PaymentTarget {
    pub fn new(address: impl Into<String>, amount: Amount) -> Self {
        Self { address: address.into(), amount, reference: None }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// Sum of `targets`, `None` on overflow.
pub fn total_amount(targets: &[PaymentTarget]) -> Option<Amount> {
    targets.iter().try_fold(Amount::ZERO, |acc, t| acc.checked_add(t.amount))
}

impl From<&GeneratedAddress> for PaymentTarget {
    fn from(generated: &GeneratedAddress) -> Self {
        Self {
            address: generated.address.clone(),
            amount: Amount::ZERO,
            reference: Some(format!("address-{}", generated.index)),
        }
    }
}

/// Inputs, outputs, fee and change of one transaction before signing.
///
/// `total_input == sum(outputs) + fee + change` always holds; sub-dust
/// change is already folded into `fee`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendPlan {
    pub inputs: Vec<Utxo>,
    pub total_input: Amount,
    pub outputs: Vec<PaymentTarget>,
    pub fee: Amount,
    pub change: Amount,
    pub change_address: Option<String>,
}

impl SpendPlan {
    /// `None` only for a hand-built plan whose outputs overflow.
    pub fn total_output(&self) -> Option<Amount> {
        total_amount(&self.outputs)
    }
}

/// Fully signed transaction ready for broadcast. Resubmissions reuse `raw`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub raw: Vec<u8>,
    pub txid: Txid,
    pub fee: Amount,
    pub change: Amount,
}

impl SignedTransaction {
    pub fn hex(&self) -> String {
        hex::encode(&self.raw)
    }
}

/// Format satoshis as a BTC decimal string.
pub fn format_btc_amount(sat: u64) -> String {
    format!("{}.{:08}", sat / 100_000_000, sat % 100_000_000)
}
