//! Core types and helpers shared by every layer.

pub mod defaults;
pub mod retry;
pub mod types;

pub use retry::{retry, RetryPolicy, Transient};
pub use types::{
    format_btc_amount, total_amount, GeneratedAddress, PaymentTarget, SignedTransaction, SpendPlan, Utxo,
};
