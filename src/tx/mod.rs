//! Transaction pipeline: fee estimate → input selection → plan → signed bytes.

pub mod builder;
pub mod fee;
pub mod select;

pub use builder::{BuildError, Signer, TransactionBuilder};
pub use fee::{FeeEstimate, FeeEstimator};
pub use select::{select, SelectError, Selection};

use crate::core::Utxo;
use bitcoin::Amount;

/// Select inputs for `target` paying to `output_count` recipients plus one change
/// output, re-estimating the fee until it matches the selected input count.
pub fn plan_inputs(
    estimator: &FeeEstimator,
    available: &[Utxo],
    target: Amount,
    output_count: usize,
    max_fee: Amount,
) -> Result<(Selection, FeeEstimate), SelectError> {
    let outputs = output_count + 1;
    let mut guess = 1;
    let mut estimate = estimator.estimate(guess, outputs, max_fee);

    for _ in 0..=available.len() {
        let selection = select(available, target, estimate.fee)?;
        let actual = estimator.estimate(selection.inputs.len(), outputs, max_fee);
        if actual.fee <= estimate.fee {
            return Ok((selection, actual));
        }
        guess = selection.inputs.len();
        estimate = estimator.estimate(guess, outputs, max_fee);
    }

    // fee only grows with input count and is capped, so this is the fixed point
    let selection = select(available, target, estimate.fee)?;
    Ok((selection, estimate))
}
