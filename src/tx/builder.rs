//! Transaction assembly and signing.
//!
//! `plan` is pure arithmetic over a selection; `build` produces signed bytes.
//! Nothing here submits anything.

use crate::core::{total_amount, PaymentTarget, SignedTransaction, SpendPlan, Transient, Utxo};
use crate::wallet::{GatewayError, Network, SigningKey, WalletGateway, WalletHandle};
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("Output to {address} must have a positive amount")]
    InvalidOutputAmount { address: String },
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("Inputs total {available} but outputs plus fee need {required}")]
    InsufficientInputs { available: Amount, required: Amount },
    #[error("Transaction has no outputs")]
    NoOutputs,
    #[error("{0} total overflows the amount range")]
    AmountOverflow(&'static str),
    #[error("Signing failed: {0}")]
    SigningFailed(String),
    /// Signing backend unreachable; the plan itself is fine
    #[error(transparent)]
    Backend(GatewayError),
}

impl Transient for BuildError {
    fn is_transient(&self) -> bool {
        matches!(self, BuildError::Backend(e) if e.is_transient())
    }
}

/// Who holds the keys for the plan's inputs.
#[derive(Clone, Copy)]
pub enum Signer<'a> {
    /// The node wallet signs (`signrawtransactionwithwallet`)
    Wallet { gateway: &'a dyn WalletGateway, wallet: &'a WalletHandle },
    /// All inputs pay to this key's P2WPKH address
    Local(&'a SigningKey),
}

#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    network: Network,
    dust_threshold: Amount,
}

impl TransactionBuilder {
    pub fn new(network: Network, dust_threshold: Amount) -> Self {
        Self { network, dust_threshold }
    }

    fn parse_address(&self, address: &str) -> Result<Address, BuildError> {
        Address::from_str(address)
            .map_err(|e| BuildError::InvalidAddress { address: address.to_string(), reason: e.to_string() })?
            .require_network(self.network.to_bitcoin())
            .map_err(|e| BuildError::InvalidAddress { address: address.to_string(), reason: e.to_string() })
    }

    /// Work out change for `inputs` paying `targets` with `fee`.
    ///
    /// Change below the dust threshold is added to the fee instead of
    /// creating an output.
    pub fn plan(
        &self,
        inputs: Vec<Utxo>,
        targets: Vec<PaymentTarget>,
        change_address: &str,
        fee: Amount,
    ) -> Result<SpendPlan, BuildError> {
        if targets.is_empty() {
            return Err(BuildError::NoOutputs);
        }
        for target in &targets {
            if target.amount == Amount::ZERO {
                return Err(BuildError::InvalidOutputAmount { address: target.address.clone() });
            }
            self.parse_address(&target.address)?;
        }

        let total_input = inputs
            .iter()
            .try_fold(Amount::ZERO, |acc, u| acc.checked_add(u.amount))
            .ok_or(BuildError::AmountOverflow("input"))?;
        let total_output = total_amount(&targets).ok_or(BuildError::AmountOverflow("output"))?;
        let required = total_output.checked_add(fee).unwrap_or(Amount::MAX);

        let Some(mut change) = total_input.checked_sub(required) else {
            return Err(BuildError::InsufficientInputs { available: total_input, required });
        };

        let mut fee = fee;
        let change_address = if change == Amount::ZERO {
            None
        } else if change < self.dust_threshold {
            debug!(change = change.to_sat(), "folding sub-dust change into fee");
            fee += change;
            change = Amount::ZERO;
            None
        } else {
            self.parse_address(change_address)?;
            Some(change_address.to_string())
        };

        Ok(SpendPlan { inputs, total_input, outputs: targets, fee, change, change_address })
    }

    /// Unsigned version-2 transaction for `plan`, change output last.
    pub fn unsigned(&self, plan: &SpendPlan) -> Result<Transaction, BuildError> {
        let input = plan
            .inputs
            .iter()
            .map(|u| TxIn {
                previous_output: u.outpoint(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect();

        let mut output = Vec::with_capacity(plan.outputs.len() + 1);
        for target in &plan.outputs {
            output.push(TxOut { value: target.amount, script_pubkey: self.parse_address(&target.address)?.script_pubkey() });
        }
        if let Some(change_address) = &plan.change_address {
            output.push(TxOut { value: plan.change, script_pubkey: self.parse_address(change_address)?.script_pubkey() });
        }

        Ok(Transaction { version: Version::TWO, lock_time: LockTime::ZERO, input, output })
    }

    pub async fn build(&self, plan: &SpendPlan, signer: Signer<'_>) -> Result<SignedTransaction, BuildError> {
        let unsigned = self.unsigned(plan)?;
        let txid = unsigned.compute_txid();

        let signed = match signer {
            Signer::Wallet { gateway, wallet } => {
                let raw = gateway.sign(wallet, &unsigned).await.map_err(|e| {
                    if e.is_transient() { BuildError::Backend(e) } else { BuildError::SigningFailed(e.to_string()) }
                })?;
                let signed: Transaction =
                    deserialize(&raw).map_err(|e| BuildError::SigningFailed(format!("undecodable signed tx: {}", e)))?;
                if signed.compute_txid() != txid {
                    return Err(BuildError::SigningFailed("wallet changed the transaction while signing".into()));
                }
                signed
            }
            Signer::Local(key) => sign_p2wpkh(unsigned, plan, key)?,
        };

        if signed.input.iter().any(|txin| txin.witness.is_empty() && txin.script_sig.is_empty()) {
            return Err(BuildError::SigningFailed("unsigned inputs remain".into()));
        }

        debug!(%txid, inputs = plan.inputs.len(), outputs = signed.output.len(), fee = plan.fee.to_sat(), "built transaction");
        Ok(SignedTransaction { raw: serialize(&signed), txid, fee: plan.fee, change: plan.change })
    }
}

fn sign_p2wpkh(tx: Transaction, plan: &SpendPlan, key: &SigningKey) -> Result<Transaction, BuildError> {
    let secp = Secp256k1::signing_only();
    let script_pubkey = key.address.script_pubkey();
    let mut cache = SighashCache::new(tx);

    for (index, utxo) in plan.inputs.iter().enumerate() {
        let sighash = cache
            .p2wpkh_signature_hash(index, &script_pubkey, utxo.amount, EcdsaSighashType::All)
            .map_err(|e| BuildError::SigningFailed(format!("sighash for input {}: {}", index, e)))?;
        let message = Message::from_digest(sighash.to_byte_array());
        let signature = ecdsa::Signature {
            signature: secp.sign_ecdsa(&message, &key.private_key.inner),
            sighash_type: EcdsaSighashType::All,
        };
        let witness = cache
            .witness_mut(index)
            .ok_or_else(|| BuildError::SigningFailed(format!("missing input {}", index)))?;
        *witness = Witness::p2wpkh(&signature, &key.public_key.0);
    }

    Ok(cache.into_transaction())
}
