//! Wallet module - funding wallet access behind a backend-neutral gateway
//!
//! # Architecture
//!
//! ```text
//! FundingReconciler / TransactionBuilder / BroadcastCoordinator
//!     │
//!     └── &dyn WalletGateway  (+ explicit WalletHandle per call)
//!             │
//!             └── RpcGateway (bitcoind JSON-RPC, wallet-scoped URLs)
//! ```
//!
//! # Gateway Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `create_or_load_wallet` | Ensure the named wallet exists and is loaded |
//! | `import_key` | Import funding key material, returns its address |
//! | `receiving_address` | Live funding address, `None` if the wallet has none |
//! | `balance` | Spendable balance |
//! | `list_unspent` | UTXO snapshot |
//! | `sign` | Sign an unsigned transaction with wallet keys |
//! | `submit` | Submit raw bytes through the wallet's node |
//! | `has_transaction` | Whether the node knows a txid |

mod keys;
mod network;
#[cfg(feature = "bitcoind-rpc")]
pub mod rpc;

pub use keys::{derive_bip84_key, KeyError, KeyMaterial, SigningKey};
pub use network::Network;
#[cfg(feature = "bitcoind-rpc")]
pub use rpc::RpcGateway;

use crate::core::{Transient, Utxo};
use async_trait::async_trait;
use bitcoin::{Amount, Transaction, Txid};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Connection, timeout or backend warming up; worth retrying
    #[error("Transient backend failure: {0}")]
    Transient(String),
    /// Backend refused the request
    #[error("Rejected by backend: {0}")]
    Rejected(String),
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),
    #[error("Backend error: {0}")]
    Other(String),
}

impl Transient for GatewayError {
    fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// Node responses meaning "this transaction is already known", which counts as accepted.
pub fn already_known(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["already in block chain", "already in utxo set", "txn-already-in-mempool", "txn-already-known", "-27"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Explicit wallet identity passed into every gateway call.
#[derive(Debug, Clone)]
pub struct WalletHandle {
    pub name: String,
    pub network: Network,
    pub key_material: Option<KeyMaterial>,
}

impl WalletHandle {
    pub fn new(name: impl Into<String>, network: Network) -> Self {
        Self { name: name.into(), network, key_material: None }
    }

    pub fn with_key_material(mut self, key: KeyMaterial) -> Self {
        self.key_material = Some(key);
        self
    }
}

#[async_trait]
pub trait WalletGateway: Send + Sync {
    async fn create_or_load_wallet(&self, wallet: &WalletHandle) -> Result<(), GatewayError>;

    /// Import `key` as the wallet's funding key. Returns the address it controls.
    async fn import_key(&self, wallet: &WalletHandle, key: &SigningKey) -> Result<String, GatewayError>;

    async fn receiving_address(&self, wallet: &WalletHandle) -> Result<Option<String>, GatewayError>;

    async fn balance(&self, wallet: &WalletHandle) -> Result<Amount, GatewayError>;

    async fn list_unspent(&self, wallet: &WalletHandle) -> Result<Vec<Utxo>, GatewayError>;

    /// Sign every input the wallet owns. Returns the serialized signed transaction.
    async fn sign(&self, wallet: &WalletHandle, unsigned: &Transaction) -> Result<Vec<u8>, GatewayError>;

    async fn submit(&self, wallet: &WalletHandle, raw: &[u8]) -> Result<Txid, GatewayError>;

    async fn has_transaction(&self, wallet: &WalletHandle, txid: &Txid) -> Result<bool, GatewayError>;
}
