//! Fee estimation from input/output counts.

use crate::core::defaults::vsize;
use bitcoin::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeEstimate {
    pub fee: Amount,
    /// The rate-based fee exceeded the ceiling and was clamped
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeEstimator {
    rate_sat_vb: u64,
}

impl FeeEstimator {
    pub fn new(rate_sat_vb: u64) -> Self {
        Self { rate_sat_vb }
    }

    pub fn rate_sat_vb(&self) -> u64 {
        self.rate_sat_vb
    }

    /// Virtual size of a P2WPKH-only transaction.
    pub fn vsize(input_count: usize, output_count: usize) -> u64 {
        vsize::OVERHEAD
            .saturating_add(vsize::INPUT.saturating_mul(input_count as u64))
            .saturating_add(vsize::OUTPUT.saturating_mul(output_count as u64))
    }

    /// Fee for the given shape, clamped to `max_fee`. At least 1 sat unless the
    /// transaction is empty.
    pub fn estimate(&self, input_count: usize, output_count: usize, max_fee: Amount) -> FeeEstimate {
        if input_count == 0 && output_count == 0 {
            return FeeEstimate { fee: Amount::ZERO, degraded: false };
        }
        let raw = Amount::from_sat(Self::vsize(input_count, output_count).saturating_mul(self.rate_sat_vb));
        let degraded = raw > max_fee;
        let fee = raw.min(max_fee).max(Amount::from_sat(1));
        FeeEstimate { fee, degraded }
    }
}
