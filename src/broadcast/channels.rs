//! Broadcast channel implementations.

use super::{BroadcastChannel, ChannelError};
use crate::wallet::{already_known, WalletGateway, WalletHandle};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Submission through the funding wallet's own node.
pub struct WalletChannel {
    name: String,
    gateway: Arc<dyn WalletGateway>,
    wallet: WalletHandle,
}

impl WalletChannel {
    pub fn new(gateway: Arc<dyn WalletGateway>, wallet: WalletHandle) -> Self {
        Self { name: format!("wallet:{}", wallet.name), gateway, wallet }
    }
}

#[async_trait]
impl BroadcastChannel for WalletChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, raw: &[u8]) -> Result<Option<String>, ChannelError> {
        let txid = self.gateway.submit(&self.wallet, raw).await?;
        Ok(Some(txid.to_string()))
    }
}

#[cfg(feature = "esplora")]
mod http {
    use super::*;
    use reqwest::StatusCode;
    use serde_json::json;

    fn client(timeout: Duration) -> Result<reqwest::Client, ChannelError> {
        reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Unsupported(format!("http client: {}", e)))
    }

    fn classify(status: StatusCode, body: String) -> Result<Option<String>, ChannelError> {
        if already_known(&body) {
            return Ok(None);
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(ChannelError::Transient(format!("{}: {}", status, body.trim())))
        } else {
            Err(ChannelError::Rejected(format!("{}: {}", status, body.trim())))
        }
    }

    fn send_error(e: reqwest::Error) -> ChannelError {
        ChannelError::Transient(e.to_string())
    }

    /// Esplora REST (`POST {base}/tx`, hex body, txid in response).
    pub struct EsploraChannel {
        name: String,
        base: String,
        client: reqwest::Client,
    }

    impl EsploraChannel {
        pub fn new(base: &str, timeout: Duration) -> Result<Self, ChannelError> {
            let base = base.trim_end_matches('/').to_string();
            Ok(Self { name: format!("esplora:{}", base), base, client: client(timeout)? })
        }
    }

    #[async_trait]
    impl BroadcastChannel for EsploraChannel {
        fn name(&self) -> &str {
            &self.name
        }

        async fn submit(&self, raw: &[u8]) -> Result<Option<String>, ChannelError> {
            let response = self
                .client
                .post(format!("{}/tx", self.base))
                .header("Content-Type", "text/plain")
                .body(hex::encode(raw))
                .send()
                .await
                .map_err(send_error)?;

            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status.is_success() {
                debug!(channel = %self.name, "accepted");
                return Ok(Some(body.trim().to_string()));
            }
            classify(status, body)
        }
    }

    /// BlockCypher push API (`POST {base}/txs/push`, `{"tx": hex}`).
    pub struct BlockcypherChannel {
        name: String,
        base: String,
        client: reqwest::Client,
    }

    impl BlockcypherChannel {
        pub fn new(base: &str, timeout: Duration) -> Result<Self, ChannelError> {
            let base = base.trim_end_matches('/').to_string();
            Ok(Self { name: format!("blockcypher:{}", base), base, client: client(timeout)? })
        }
    }

    #[async_trait]
    impl BroadcastChannel for BlockcypherChannel {
        fn name(&self) -> &str {
            &self.name
        }

        async fn submit(&self, raw: &[u8]) -> Result<Option<String>, ChannelError> {
            let response = self
                .client
                .post(format!("{}/txs/push", self.base))
                .json(&json!({ "tx": hex::encode(raw) }))
                .send()
                .await
                .map_err(send_error)?;

            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if status.is_success() {
                let hash = serde_json::from_str::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v["tx"]["hash"].as_str().map(str::to_string));
                return Ok(hash);
            }
            classify(status, body)
        }
    }
}

#[cfg(feature = "esplora")]
pub use http::{BlockcypherChannel, EsploraChannel};

/// Electrum `blockchain.transaction.broadcast`.
#[cfg(feature = "electrum")]
pub struct ElectrumChannel {
    name: String,
    url: String,
    timeout: Duration,
}

#[cfg(feature = "electrum")]
impl ElectrumChannel {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self { name: format!("electrum:{}", url), url: url.to_string(), timeout }
    }
}

#[cfg(feature = "electrum")]
#[async_trait]
impl BroadcastChannel for ElectrumChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, raw: &[u8]) -> Result<Option<String>, ChannelError> {
        use bdk_electrum::electrum_client::{Client, ElectrumApi, Error};

        let url = self.url.clone();
        let raw = raw.to_vec();
        let task = tokio::task::spawn_blocking(move || {
            let client = Client::new(&url).map_err(|e| ChannelError::Transient(format!("connect: {}", e)))?;
            match client.transaction_broadcast_raw(&raw) {
                Ok(txid) => Ok(Some(txid.to_string())),
                Err(Error::Protocol(value)) if already_known(&value.to_string()) => Ok(None),
                Err(Error::Protocol(value)) => Err(ChannelError::Rejected(value.to_string())),
                Err(e) => Err(ChannelError::Transient(e.to_string())),
            }
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ChannelError::Transient(format!("electrum task: {}", join))),
            Err(_) => Err(ChannelError::Transient(format!("timed out after {:?}", self.timeout))),
        }
    }
}

/// Runs an external program (typically `bitcoin-cli ... sendrawtransaction`)
/// with the raw hex as its final argument.
pub struct NodeCommandChannel {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl NodeCommandChannel {
    pub fn new(program: &str, args: Vec<String>, timeout: Duration) -> Self {
        Self { name: format!("command:{}", program), program: program.to_string(), args, timeout }
    }
}

#[async_trait]
impl BroadcastChannel for NodeCommandChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, raw: &[u8]) -> Result<Option<String>, ChannelError> {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args).arg(hex::encode(raw)).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ChannelError::Rejected(format!("{}: {}", self.program, e))),
            Err(_) => return Err(ChannelError::Transient(format!("{} timed out after {:?}", self.program, self.timeout))),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if output.status.success() {
            return Ok(if stdout.is_empty() { None } else { Some(stdout) });
        }
        if already_known(&stderr) {
            return Ok(None);
        }
        if stderr.contains("Could not connect") || stderr.contains("Loading") || stderr.contains("-28") {
            return Err(ChannelError::Transient(stderr));
        }
        Err(ChannelError::Rejected(if stderr.is_empty() { format!("exit status {}", output.status) } else { stderr }))
    }
}
