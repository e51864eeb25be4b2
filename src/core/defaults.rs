//! Constants shared across the crate.
//!
//! Centralized so configuration defaults and backend conventions stay in one place.

/// Transaction size model (P2WPKH, virtual bytes)
pub mod vsize {
    pub const OVERHEAD: u64 = 11;
    pub const INPUT: u64 = 68;
    pub const OUTPUT: u64 = 31;
}

/// Amount defaults, in satoshis
pub mod amounts {
    pub const DUST_THRESHOLD_SAT: u64 = 546;
    pub const PAYMENT_SAT: u64 = 100_000;
    pub const MAX_FEE_SAT: u64 = 10_000;
    pub const FEE_RATE_SAT_VB: u64 = 2;
}

/// Batch and timing defaults
pub mod batching {
    pub const BATCH_SIZE: usize = 50;
    pub const BATCH_DELAY_MS: u64 = 2_000;
    pub const ADDRESS_COUNT: u32 = 1_000;
    pub const VERIFY_ATTEMPTS: usize = 5;
    pub const VERIFY_INTERVAL_MS: u64 = 3_000;
    pub const RETRY_ATTEMPTS: usize = 3;
    pub const RETRY_BASE_DELAY_MS: u64 = 500;
    pub const RETRY_MAX_DELAY_MS: u64 = 10_000;
    pub const TIMEOUT_SECS: u64 = 30;
}

/// Wallet backend conventions
pub mod wallet {
    pub const DEFAULT_NAME: &str = "wallet_0";
    /// Label carried by the funding address inside the node wallet.
    pub const FUNDING_LABEL: &str = "funding";
    /// Label given to funding addresses replaced by a re-import.
    pub const RETIRED_LABEL: &str = "funding-retired";
}

/// Artifact record kinds (one file per kind)
pub mod artifacts {
    pub const ADDRESSES: &str = "addresses";
    pub const PAYMENTS: &str = "payments";
    pub const SUMMARIES: &str = "summaries";
}
