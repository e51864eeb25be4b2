//! Broadcast - multi-channel submission with post-acceptance verification
//!
//! # Architecture
//!
//! ```text
//! BroadcastCoordinator
//!     │
//!     ├── channels (configured order)
//!     │     ├── WalletChannel        → WalletGateway::submit
//!     │     ├── EsploraChannel       → POST {base}/tx          (feature esplora)
//!     │     ├── BlockcypherChannel   → POST {base}/txs/push    (feature esplora)
//!     │     ├── ElectrumChannel      → blockchain.transaction.broadcast (feature electrum)
//!     │     └── NodeCommandChannel   → `<program> <args..> <hex>`
//!     │
//!     └── verification → WalletGateway::has_transaction (polled)
//! ```

mod channels;
mod coordinator;

pub use channels::{NodeCommandChannel, WalletChannel};
#[cfg(feature = "esplora")]
pub use channels::{BlockcypherChannel, EsploraChannel};
#[cfg(feature = "electrum")]
pub use channels::ElectrumChannel;
pub use coordinator::{
    any_unverified, BroadcastCoordinator, BroadcastError, BroadcastReport, BroadcastResult, BroadcastState, Verification,
    VerifyPolicy,
};

use crate::config::ChannelConfig;
use crate::core::Transient;
use crate::wallet::{GatewayError, WalletGateway, WalletHandle};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel unavailable: {0}")]
    Transient(String),
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Channel not supported in this build: {0}")]
    Unsupported(String),
}

impl Transient for ChannelError {
    fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Transient(_))
    }
}

impl From<GatewayError> for ChannelError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Transient(msg) => ChannelError::Transient(msg),
            other => ChannelError::Rejected(other.to_string()),
        }
    }
}

/// One way of getting raw transaction bytes to the network.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Submit `raw`. `Ok` means the endpoint accepted it; the returned string is
    /// the id the endpoint reported, if any.
    async fn submit(&self, raw: &[u8]) -> Result<Option<String>, ChannelError>;
}

/// Instantiate the configured channels in order.
pub fn build_channels(
    configs: &[ChannelConfig],
    gateway: Arc<dyn WalletGateway>,
    wallet: &WalletHandle,
    timeout: Duration,
) -> Result<Vec<Arc<dyn BroadcastChannel>>, ChannelError> {
    configs
        .iter()
        .map(|config| -> Result<Arc<dyn BroadcastChannel>, ChannelError> {
            Ok(match config {
                ChannelConfig::Wallet => Arc::new(WalletChannel::new(gateway.clone(), wallet.clone())),
                #[cfg(feature = "esplora")]
                ChannelConfig::Esplora { url } => Arc::new(EsploraChannel::new(url, timeout)?),
                #[cfg(feature = "esplora")]
                ChannelConfig::Blockcypher { url } => Arc::new(BlockcypherChannel::new(url, timeout)?),
                #[cfg(not(feature = "esplora"))]
                ChannelConfig::Esplora { url } | ChannelConfig::Blockcypher { url } => {
                    return Err(ChannelError::Unsupported(format!("{} (enable feature 'esplora')", url)))
                }
                #[cfg(feature = "electrum")]
                ChannelConfig::Electrum { url } => Arc::new(ElectrumChannel::new(url, timeout)),
                #[cfg(not(feature = "electrum"))]
                ChannelConfig::Electrum { url } => {
                    return Err(ChannelError::Unsupported(format!("{} (enable feature 'electrum')", url)))
                }
                ChannelConfig::NodeCommand { program, args } => {
                    Arc::new(NodeCommandChannel::new(program, args.clone(), timeout))
                }
            })
        })
        .collect()
}
