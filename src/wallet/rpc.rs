//! Bitcoin Core JSON-RPC gateway.
//!
//! Every call runs the blocking `bitcoincore-rpc` client on a blocking
//! thread. Wallet-scoped calls go to `{url}/wallet/{name}`.

use super::{already_known, GatewayError, SigningKey, WalletGateway, WalletHandle};
use crate::config::RpcConfig;
use crate::core::defaults::wallet::{FUNDING_LABEL, RETIRED_LABEL};
use crate::core::Utxo;
use async_trait::async_trait;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Amount, Transaction, Txid};
use bitcoincore_rpc::jsonrpc;
use bitcoincore_rpc::{Client, RpcApi};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info, warn};

// Bitcoin Core RPC error codes
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
const RPC_WALLET_INVALID_LABEL_NAME: i32 = -11;
const RPC_WALLET_NOT_FOUND: i32 = -18;
const RPC_VERIFY_ALREADY_IN_CHAIN: i32 = -27;
const RPC_IN_WARMUP: i32 = -28;
const RPC_WALLET_ALREADY_LOADED: i32 = -35;

#[derive(Debug, Deserialize)]
struct DescriptorInfo {
    checksum: String,
}

#[derive(Debug, Deserialize)]
struct ImportResult {
    success: bool,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ListUnspentEntry {
    txid: String,
    vout: u32,
    amount: f64,
    #[serde(default)]
    confirmations: u32,
    #[serde(default = "default_true")]
    spendable: bool,
}

#[derive(Debug, Deserialize)]
struct SignResult {
    hex: String,
    complete: bool,
    #[serde(default)]
    errors: Vec<Value>,
}

fn default_true() -> bool {
    true
}

pub struct RpcGateway {
    config: RpcConfig,
}

impl RpcGateway {
    pub fn new(config: RpcConfig) -> Self {
        Self { config }
    }

    /// Run one RPC on a blocking thread, returning the raw client error.
    async fn call_raw<T>(&self, wallet: Option<&str>, cmd: &'static str, args: Vec<Value>) -> Result<T, RawCallError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let config = self.config.clone();
        let wallet = wallet.map(str::to_string);
        debug!(cmd, wallet = wallet.as_deref().unwrap_or("-"), "rpc call");
        tokio::task::spawn_blocking(move || {
            let client = connect(&config, wallet.as_deref()).map_err(RawCallError::Connect)?;
            client.call::<T>(cmd, &args).map_err(RawCallError::Rpc)
        })
        .await
        .map_err(|e| RawCallError::Connect(format!("RPC task: {}", e)))?
    }

    async fn call<T>(&self, wallet: Option<&str>, cmd: &'static str, args: Vec<Value>) -> Result<T, GatewayError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.call_raw(wallet, cmd, args).await.map_err(|e| e.classify(cmd))
    }

    async fn labelled_addresses(&self, wallet: &WalletHandle, label: &str) -> Result<Vec<String>, GatewayError> {
        match self
            .call_raw::<HashMap<String, Value>>(Some(&wallet.name), "getaddressesbylabel", vec![json!(label)])
            .await
        {
            Ok(map) => {
                let mut addresses: Vec<String> = map.into_keys().collect();
                addresses.sort();
                Ok(addresses)
            }
            Err(e) if e.code() == Some(RPC_WALLET_INVALID_LABEL_NAME) => Ok(Vec::new()),
            Err(e) => Err(e.classify("getaddressesbylabel")),
        }
    }

    /// Move every address still carrying the funding label to the retired label.
    async fn retire_funding_addresses(&self, wallet: &WalletHandle) -> Result<(), GatewayError> {
        for address in self.labelled_addresses(wallet, FUNDING_LABEL).await? {
            debug!(wallet = %wallet.name, %address, "retiring funding address");
            self.call::<Value>(Some(&wallet.name), "setlabel", vec![json!(address), json!(RETIRED_LABEL)])
                .await?;
        }
        Ok(())
    }

    fn rescan_timestamp(&self) -> Value {
        match self.config.rescan_from {
            Some(ts) => json!(ts),
            None => json!("now"),
        }
    }
}

#[async_trait]
impl WalletGateway for RpcGateway {
    async fn create_or_load_wallet(&self, wallet: &WalletHandle) -> Result<(), GatewayError> {
        let loaded: Vec<String> = self.call(None, "listwallets", vec![]).await?;
        if loaded.iter().any(|name| name == &wallet.name) {
            return Ok(());
        }

        match self.call_raw::<Value>(None, "loadwallet", vec![json!(wallet.name)]).await {
            Ok(_) => {
                info!(wallet = %wallet.name, "Loaded wallet");
                Ok(())
            }
            Err(e) if e.code() == Some(RPC_WALLET_ALREADY_LOADED) => Ok(()),
            Err(e) if e.code() == Some(RPC_WALLET_NOT_FOUND) => {
                // blank descriptor wallet: keys only arrive through import
                self.call::<Value>(None, "createwallet", vec![json!(wallet.name), json!(false), json!(true)])
                    .await?;
                info!(wallet = %wallet.name, "Created wallet");
                Ok(())
            }
            Err(e) => Err(e.classify("loadwallet")),
        }
    }

    async fn import_key(&self, wallet: &WalletHandle, key: &SigningKey) -> Result<String, GatewayError> {
        let wif = key.wif();
        let descriptor = zeroize::Zeroizing::new(format!("wpkh({})", wif.as_str()));

        let info: DescriptorInfo = self
            .call(Some(&wallet.name), "getdescriptorinfo", vec![json!(descriptor.as_str())])
            .await?;

        self.retire_funding_addresses(wallet).await?;

        let request = json!([{
            "desc": format!("{}#{}", descriptor.as_str(), info.checksum),
            "timestamp": self.rescan_timestamp(),
            "label": FUNDING_LABEL,
        }]);
        let results: Vec<ImportResult> = self.call(Some(&wallet.name), "importdescriptors", vec![request]).await?;

        match results.first() {
            Some(result) if result.success => {
                info!(wallet = %wallet.name, address = %key.address, "Imported funding key");
                Ok(key.address.to_string())
            }
            Some(result) => Err(GatewayError::Rejected(format!(
                "importdescriptors: {}",
                result.error.as_ref().map(Value::to_string).unwrap_or_else(|| "unknown error".into())
            ))),
            None => Err(GatewayError::Other("importdescriptors returned no result".into())),
        }
    }

    async fn receiving_address(&self, wallet: &WalletHandle) -> Result<Option<String>, GatewayError> {
        let addresses = self.labelled_addresses(wallet, FUNDING_LABEL).await?;
        if addresses.len() > 1 {
            warn!(wallet = %wallet.name, count = addresses.len(), "Several funding addresses, using the first");
        }
        Ok(addresses.into_iter().next())
    }

    async fn balance(&self, wallet: &WalletHandle) -> Result<Amount, GatewayError> {
        let btc: f64 = self
            .call(Some(&wallet.name), "getbalance", vec![json!("*"), json!(self.config.min_conf)])
            .await?;
        Amount::from_btc(btc).map_err(|e| GatewayError::Other(format!("getbalance amount: {}", e)))
    }

    async fn list_unspent(&self, wallet: &WalletHandle) -> Result<Vec<Utxo>, GatewayError> {
        let entries: Vec<ListUnspentEntry> = self
            .call(Some(&wallet.name), "listunspent", vec![json!(self.config.min_conf)])
            .await?;

        entries
            .into_iter()
            .filter(|entry| entry.spendable)
            .map(|entry| {
                Ok(Utxo {
                    txid: Txid::from_str(&entry.txid)
                        .map_err(|e| GatewayError::Other(format!("listunspent txid: {}", e)))?,
                    vout: entry.vout,
                    amount: Amount::from_btc(entry.amount)
                        .map_err(|e| GatewayError::Other(format!("listunspent amount: {}", e)))?,
                    confirmations: entry.confirmations,
                })
            })
            .collect()
    }

    async fn sign(&self, wallet: &WalletHandle, unsigned: &Transaction) -> Result<Vec<u8>, GatewayError> {
        let result: SignResult = self
            .call(Some(&wallet.name), "signrawtransactionwithwallet", vec![json!(serialize_hex(unsigned))])
            .await?;
        if !result.complete {
            return Err(GatewayError::Rejected(format!(
                "incomplete signature: {}",
                Value::Array(result.errors)
            )));
        }
        hex::decode(&result.hex).map_err(|e| GatewayError::Other(format!("signed hex: {}", e)))
    }

    async fn submit(&self, wallet: &WalletHandle, raw: &[u8]) -> Result<Txid, GatewayError> {
        let tx: Transaction = bitcoin::consensus::deserialize(raw)
            .map_err(|e| GatewayError::Other(format!("raw transaction: {}", e)))?;

        match self.call_raw::<String>(Some(&wallet.name), "sendrawtransaction", vec![json!(hex::encode(raw))]).await {
            Ok(txid) => Txid::from_str(&txid).map_err(|e| GatewayError::Other(format!("sendrawtransaction txid: {}", e))),
            Err(e) if e.is_already_known() => {
                debug!(txid = %tx.compute_txid(), "transaction already known to node");
                Ok(tx.compute_txid())
            }
            Err(e) => Err(e.classify("sendrawtransaction")),
        }
    }

    async fn has_transaction(&self, wallet: &WalletHandle, txid: &Txid) -> Result<bool, GatewayError> {
        match self.call_raw::<Value>(Some(&wallet.name), "gettransaction", vec![json!(txid.to_string())]).await {
            Ok(_) => return Ok(true),
            Err(e) if e.code() == Some(RPC_INVALID_ADDRESS_OR_KEY) => {}
            Err(e) => return Err(e.classify("gettransaction")),
        }
        match self.call_raw::<Value>(None, "getmempoolentry", vec![json!(txid.to_string())]).await {
            Ok(_) => Ok(true),
            Err(e) if e.code() == Some(RPC_INVALID_ADDRESS_OR_KEY) => Ok(false),
            Err(e) => Err(e.classify("getmempoolentry")),
        }
    }
}

#[derive(Debug)]
enum RawCallError {
    Connect(String),
    Rpc(bitcoincore_rpc::Error),
}

impl RawCallError {
    fn rpc_error(&self) -> Option<&jsonrpc::error::RpcError> {
        match self {
            RawCallError::Rpc(bitcoincore_rpc::Error::JsonRpc(jsonrpc::error::Error::Rpc(e))) => Some(e),
            _ => None,
        }
    }

    fn code(&self) -> Option<i32> {
        self.rpc_error().map(|e| e.code)
    }

    /// The node already has the transaction, in its mempool or in a block.
    fn is_already_known(&self) -> bool {
        self.code() == Some(RPC_VERIFY_ALREADY_IN_CHAIN)
            || self.rpc_error().map(|e| already_known(&e.message)).unwrap_or(false)
    }

    fn classify(self, cmd: &str) -> GatewayError {
        if let Some(e) = self.rpc_error() {
            return match e.code {
                RPC_IN_WARMUP => GatewayError::Transient(format!("{}: {}", cmd, e.message)),
                RPC_WALLET_NOT_FOUND => GatewayError::WalletNotFound(e.message.clone()),
                code => GatewayError::Rejected(format!("{}: {} ({})", cmd, e.message, code)),
            };
        }
        match self {
            RawCallError::Connect(msg) => GatewayError::Transient(format!("{}: {}", cmd, msg)),
            RawCallError::Rpc(bitcoincore_rpc::Error::JsonRpc(jsonrpc::error::Error::Transport(e))) => {
                GatewayError::Transient(format!("{}: {}", cmd, e))
            }
            RawCallError::Rpc(bitcoincore_rpc::Error::Io(e)) => GatewayError::Transient(format!("{}: {}", cmd, e)),
            RawCallError::Rpc(e) => GatewayError::Other(format!("{}: {}", cmd, e)),
        }
    }
}

fn connect(config: &RpcConfig, wallet: Option<&str>) -> Result<Client, String> {
    let base = config.url.trim_end_matches('/');
    let url = match wallet {
        Some(name) => format!("{}/wallet/{}", base, percent_encode(name)),
        None => base.to_string(),
    };
    let transport = jsonrpc::simple_http::SimpleHttpTransport::builder()
        .url(&url)
        .map_err(|e| format!("RPC url {}: {}", url, e))?
        .timeout(config.timeout)
        .auth(config.user.as_str(), Some(config.pass.as_str()))
        .build();
    Ok(Client::from_jsonrpc(jsonrpc::Client::with_transport(transport)))
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for &b in value.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
