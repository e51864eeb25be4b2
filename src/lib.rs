//! btc-settle: batch Bitcoin test payments out of a node-managed funding wallet.
//!
//! # Architecture
//!
//! ```text
//! FundingRun (batch driver)
//!   │
//!   ├── FundingReconciler ──┐
//!   │                       │
//!   ├── tx pipeline         ├── &dyn WalletGateway (bitcoind RPC)
//!   │     ├── FeeEstimator  │
//!   │     ├── select        │
//!   │     └── TransactionBuilder (wallet or local signer)
//!   │                       │
//!   ├── BroadcastCoordinator┘
//!   │     └── channels: wallet, Esplora, BlockCypher, Electrum, node command
//!   │
//!   └── ArtifactStore (JSON lines)
//! ```
//!
//! # Features
//!
//! - `bitcoind-rpc` - `RpcGateway` over bitcoind JSON-RPC (required by the CLI)
//! - `esplora` - Esplora and BlockCypher HTTP broadcast channels
//! - `electrum` - Electrum broadcast channel
//!
//! # Usage
//!
//! ```ignore
//! use btc_settle::{ConfigLayer, FundingRun, JsonArtifactStore, RpcGateway, SettleConfig};
//!
//! let config = SettleConfig::resolve(ConfigLayer::default(), ConfigLayer::load(path)?)?;
//! let gateway = Arc::new(RpcGateway::new(config.rpc.clone()));
//! let store = Arc::new(JsonArtifactStore::new(&config.artifacts_dir));
//! let run = FundingRun::from_config(&config, gateway, store)?;
//! let summary = run.run(&config.wallet_handle(), &funding_address, &targets).await;
//! ```

pub mod addresses;
pub mod artifacts;
pub mod broadcast;
pub mod config;
pub mod core;
pub mod funding;
pub mod logging;
pub mod runtime;
pub mod tx;
pub mod wallet;

pub use artifacts::{ArtifactRecord, ArtifactStore, JsonArtifactStore, MemoryArtifactStore};
pub use broadcast::{BroadcastChannel, BroadcastCoordinator, BroadcastReport, ChannelError, VerifyPolicy};
pub use config::{ChannelConfig, ConfigError, ConfigLayer, RescanFrom, RpcConfig, SettleConfig};
pub use core::{GeneratedAddress, PaymentTarget, RetryPolicy, SignedTransaction, SpendPlan, Utxo};
pub use funding::{ErrorKind, FundingReconciler, FundingRun, FundingState, RunSettings, RunSummary};
pub use runtime::Shutdown;
pub use tx::{FeeEstimator, TransactionBuilder};
pub use wallet::{GatewayError, KeyMaterial, Network, WalletGateway, WalletHandle};
#[cfg(feature = "bitcoind-rpc")]
pub use wallet::RpcGateway;
