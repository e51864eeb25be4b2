//! Greedy largest-first UTXO selection.

use crate::core::Utxo;
use bitcoin::Amount;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectError {
    #[error("Insufficient funds: available {available}, required {required}")]
    InsufficientFunds { available: Amount, required: Amount },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub inputs: Vec<Utxo>,
    pub total: Amount,
}

/// Candidates ordered by descending amount, ties by outpoint.
fn sorted(available: &[Utxo]) -> Vec<&Utxo> {
    let mut candidates: Vec<&Utxo> = available.iter().collect();
    candidates.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.outpoint().cmp(&b.outpoint())));
    candidates
}

/// Pick inputs covering `target + fee`.
///
/// A single output worth exactly the requirement wins outright. Otherwise
/// inputs are taken largest-first until covered. Deterministic for a given
/// snapshot; never returns a partial selection.
pub fn select(available: &[Utxo], target: Amount, fee: Amount) -> Result<Selection, SelectError> {
    let available_total = available.iter().fold(Amount::ZERO, |acc, u| acc.checked_add(u.amount).unwrap_or(Amount::MAX));
    let Some(required) = target.checked_add(fee) else {
        return Err(SelectError::InsufficientFunds { available: available_total, required: Amount::MAX });
    };

    let candidates = sorted(available);

    if let Some(exact) = candidates.iter().find(|u| u.amount == required) {
        return Ok(Selection { inputs: vec![(*exact).clone()], total: exact.amount });
    }

    let mut inputs = Vec::new();
    let mut total = Amount::ZERO;
    for utxo in candidates {
        inputs.push(utxo.clone());
        total = total.checked_add(utxo.amount).unwrap_or(Amount::MAX);
        if total >= required {
            return Ok(Selection { inputs, total });
        }
    }

    Err(SelectError::InsufficientFunds { available: available_total, required })
}
