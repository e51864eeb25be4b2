//! Configuration - typed settings resolved from CLI overrides, a JSON file and defaults
//!
//! Precedence: explicit override > config file > built-in default. Everything is
//! validated in [`SettleConfig::resolve`]; components only ever see the typed result.
//!
//! Two file layouts are accepted:
//!
//! ```text
//! flat:       {"wallet_name": "wallet_0", "amount": 0.001, "count": 100}
//! sectioned:  {"_address_generation": {"amount": 0.001, "count": 100},
//!              "_network_settings": {"mainnet": false},
//!              "_key_import_options": {"mnemonic": "..."}}
//! ```
//!
//! Sections are flattened into one layer; top-level keys win over section keys.

use crate::core::defaults::{amounts, batching, wallet};
use crate::core::RetryPolicy;
use crate::wallet::{KeyError, KeyMaterial, Network};
use bitcoin::Amount;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("Invalid config file: {0}")]
    Parse(String),
    #[error("Config error: '{field}' {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("Only one key import method may be used (private_key, mnemonic, key_file)")]
    ConflictingKeySources,
    #[error(transparent)]
    Key(#[from] KeyError),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}

/// One broadcast channel, in fallback order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelConfig {
    /// Submission through the funding wallet's node
    Wallet,
    /// Esplora REST `POST {url}/tx`
    Esplora { url: String },
    /// BlockCypher `POST {url}/txs/push`
    Blockcypher { url: String },
    /// Electrum server (`tcp://` or `ssl://`)
    Electrum { url: String },
    /// External command, raw hex appended as last argument
    NodeCommand {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl ChannelConfig {
    pub fn defaults_for(network: Network) -> Vec<ChannelConfig> {
        let mut channels = vec![ChannelConfig::Wallet];
        channels.extend(
            network.default_esplora_urls().iter().map(|url| ChannelConfig::Esplora { url: url.to_string() }),
        );
        channels.extend(network.default_blockcypher_url().map(|url| ChannelConfig::Blockcypher { url: url.to_string() }));
        channels
    }
}

/// Rescan start for imported keys: a unix timestamp or `"now"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RescanFrom {
    Timestamp(u64),
    Keyword(String),
}

/// Bitcoin Core RPC connection
#[derive(Clone)]
pub struct RpcConfig {
    pub url: String,
    pub user: String,
    pub pass: String,
    pub timeout: Duration,
    /// Minimum confirmations for balance and UTXO queries
    pub min_conf: u32,
    /// Rescan start for imported keys; `None` means "now"
    pub rescan_from: Option<u64>,
}

impl std::fmt::Debug for RpcConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("timeout", &self.timeout)
            .field("min_conf", &self.min_conf)
            .field("rescan_from", &self.rescan_from)
            .finish_non_exhaustive()
    }
}

impl RpcConfig {
    pub fn new(url: impl Into<String>, user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: user.into(),
            pass: pass.into(),
            timeout: Duration::from_secs(batching::TIMEOUT_SECS),
            min_conf: 0,
            rescan_from: Some(0),
        }
    }

    pub fn default_url(network: Network) -> &'static str {
        match network {
            Network::Bitcoin => "http://127.0.0.1:8332",
            Network::Testnet => "http://127.0.0.1:18332",
            Network::Signet => "http://127.0.0.1:38332",
            Network::Regtest => "http://127.0.0.1:18443",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FundingConfig {
    pub amount: Amount,
    pub max_fee: Amount,
    pub fee_rate_sat_vb: u64,
    pub dust_threshold: Amount,
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub count: u32,
    pub derivation_mode: bool,
    pub start_index: u32,
    pub output: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub channels: Vec<ChannelConfig>,
    pub verify_attempts: usize,
    pub verify_interval: Duration,
    pub http_timeout: Duration,
}

/// Fully resolved, validated settings.
#[derive(Debug, Clone)]
pub struct SettleConfig {
    pub network: Network,
    pub wallet_name: String,
    pub key_material: Option<KeyMaterial>,
    pub expected_address: Option<String>,
    pub rpc: RpcConfig,
    pub funding: FundingConfig,
    pub generation: GenerationConfig,
    pub broadcast: BroadcastConfig,
    pub retry: RetryPolicy,
    pub artifacts_dir: PathBuf,
}

/// One configuration layer. Every field is optional; `merge` fills gaps from a lower layer.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigLayer {
    pub network: Option<String>,
    pub mainnet: Option<bool>,
    pub wallet_name: Option<String>,
    pub expected_address: Option<String>,

    pub private_key: Option<String>,
    pub mnemonic: Option<String>,
    pub key_file: Option<PathBuf>,

    pub amount: Option<f64>,
    pub max_fee: Option<f64>,
    pub fee_rate: Option<u64>,
    pub dust_threshold: Option<u64>,
    pub batch_size: Option<usize>,
    pub batch_delay_ms: Option<u64>,
    pub no_funding: Option<bool>,

    pub count: Option<u32>,
    pub derivation_mode: Option<bool>,
    pub start_index: Option<u32>,
    pub output: Option<PathBuf>,

    pub rpc_url: Option<String>,
    pub rpc_user: Option<String>,
    pub rpc_pass: Option<String>,
    pub rpc_timeout_secs: Option<u64>,
    pub min_conf: Option<u32>,
    pub rescan_from: Option<RescanFrom>,

    pub channels: Option<Vec<ChannelConfig>>,
    pub verify_attempts: Option<usize>,
    pub verify_interval_ms: Option<u64>,
    pub http_timeout_secs: Option<u64>,

    pub retry_attempts: Option<usize>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,

    pub artifacts_dir: Option<PathBuf>,
}

macro_rules! merge_fields {
    ($upper:ident, $lower:ident, $($field:ident),+ $(,)?) => {
        ConfigLayer { $($field: $upper.$field.or($lower.$field)),+ }
    };
}

impl ConfigLayer {
    /// Parse a JSON config document (flat or sectioned).
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let Value::Object(root) = value else {
            return Err(ConfigError::Parse("root must be a JSON object".into()));
        };

        let mut flat = Map::new();
        let mut top_level = Map::new();
        for (key, value) in root {
            if key.starts_with('_') {
                match value {
                    Value::Object(section) => flat.extend(section),
                    _ => return Err(ConfigError::Parse(format!("section '{}' must be an object", key))),
                }
            } else {
                top_level.insert(key, value);
            }
        }
        flat.extend(top_level);

        serde_json::from_value(Value::Object(flat)).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read { path: path.display().to_string(), reason: e.to_string() })?;
        Self::from_json(&text)
    }

    /// `self` wins wherever it has a value.
    pub fn merge(self, lower: ConfigLayer) -> ConfigLayer {
        let upper = self;
        merge_fields!(
            upper, lower, network, mainnet, wallet_name, expected_address, private_key, mnemonic, key_file,
            amount, max_fee, fee_rate, dust_threshold, batch_size, batch_delay_ms, no_funding, count,
            derivation_mode, start_index, output, rpc_url, rpc_user, rpc_pass, rpc_timeout_secs, min_conf,
            rescan_from, channels, verify_attempts, verify_interval_ms, http_timeout_secs, retry_attempts,
            retry_base_delay_ms, retry_max_delay_ms, artifacts_dir,
        )
    }
}

fn btc_amount(field: &'static str, value: f64) -> Result<Amount, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid(field, "must be a positive number"));
    }
    Amount::from_btc(value).map_err(|e| invalid(field, e.to_string()))
}

fn positive<T: PartialOrd + Default>(field: &'static str, value: T) -> Result<T, ConfigError> {
    if value <= T::default() {
        return Err(invalid(field, "must be a positive integer"));
    }
    Ok(value)
}

impl SettleConfig {
    /// Apply precedence (`overrides` > `file` > defaults) and validate.
    pub fn resolve(overrides: ConfigLayer, file: ConfigLayer) -> Result<Self, ConfigError> {
        let layer = overrides.merge(file);

        let network = match (&layer.network, layer.mainnet) {
            (Some(name), _) => Network::from_str(name).ok_or_else(|| invalid("network", format!("unknown network '{}'", name)))?,
            (None, Some(true)) => Network::Bitcoin,
            (None, _) => Network::default(),
        };

        let key_sources = [layer.private_key.is_some(), layer.mnemonic.is_some(), layer.key_file.is_some()];
        if key_sources.iter().filter(|set| **set).count() > 1 {
            return Err(ConfigError::ConflictingKeySources);
        }
        let key_material = match (layer.private_key, layer.mnemonic, layer.key_file) {
            (Some(key), _, _) => Some(KeyMaterial::private_key(key)),
            (_, Some(phrase), _) => Some(KeyMaterial::mnemonic(phrase)),
            (_, _, Some(path)) => Some(KeyMaterial::from_key_file(&path)?),
            _ => None,
        };
        // fail early on unusable key material
        if let Some(material) = &key_material {
            material.signing_key(network)?;
        }

        let wallet_name = layer.wallet_name.unwrap_or_else(|| wallet::DEFAULT_NAME.to_string());
        if wallet_name.trim().is_empty() {
            return Err(invalid("wallet_name", "must not be empty"));
        }

        let funding = FundingConfig {
            amount: match layer.amount {
                Some(v) => btc_amount("amount", v)?,
                None => Amount::from_sat(amounts::PAYMENT_SAT),
            },
            max_fee: match layer.max_fee {
                Some(v) => btc_amount("max_fee", v)?,
                None => Amount::from_sat(amounts::MAX_FEE_SAT),
            },
            fee_rate_sat_vb: positive("fee_rate", layer.fee_rate.unwrap_or(amounts::FEE_RATE_SAT_VB))?,
            dust_threshold: Amount::from_sat(layer.dust_threshold.unwrap_or(amounts::DUST_THRESHOLD_SAT)),
            batch_size: positive("batch_size", layer.batch_size.unwrap_or(batching::BATCH_SIZE))?,
            batch_delay: Duration::from_millis(layer.batch_delay_ms.unwrap_or(batching::BATCH_DELAY_MS)),
            enabled: !layer.no_funding.unwrap_or(false),
        };

        let generation = GenerationConfig {
            count: positive("count", layer.count.unwrap_or(batching::ADDRESS_COUNT))?,
            derivation_mode: layer.derivation_mode.unwrap_or(false),
            start_index: layer.start_index.unwrap_or(0),
            output: layer.output.unwrap_or_else(|| PathBuf::from("generated_addresses.json")),
        };

        let channels = layer.channels.unwrap_or_else(|| ChannelConfig::defaults_for(network));
        if channels.is_empty() {
            return Err(invalid("channels", "must list at least one broadcast channel"));
        }
        let broadcast = BroadcastConfig {
            channels,
            verify_attempts: positive("verify_attempts", layer.verify_attempts.unwrap_or(batching::VERIFY_ATTEMPTS))?,
            verify_interval: Duration::from_millis(layer.verify_interval_ms.unwrap_or(batching::VERIFY_INTERVAL_MS)),
            http_timeout: Duration::from_secs(positive(
                "http_timeout_secs",
                layer.http_timeout_secs.unwrap_or(batching::TIMEOUT_SECS),
            )?),
        };

        let mut rpc = RpcConfig::new(
            layer.rpc_url.unwrap_or_else(|| RpcConfig::default_url(network).to_string()),
            layer.rpc_user.unwrap_or_default(),
            layer.rpc_pass.unwrap_or_default(),
        );
        rpc.timeout = Duration::from_secs(positive(
            "rpc_timeout_secs",
            layer.rpc_timeout_secs.unwrap_or(batching::TIMEOUT_SECS),
        )?);
        rpc.min_conf = layer.min_conf.unwrap_or(0);
        rpc.rescan_from = match layer.rescan_from {
            None => Some(0),
            Some(RescanFrom::Timestamp(ts)) => Some(ts),
            Some(RescanFrom::Keyword(word)) if word.trim().eq_ignore_ascii_case("now") => None,
            Some(RescanFrom::Keyword(word)) => {
                return Err(invalid("rescan_from", format!("expected a unix timestamp or \"now\", got '{}'", word)))
            }
        };

        let retry = RetryPolicy {
            attempts: positive("retry_attempts", layer.retry_attempts.unwrap_or(batching::RETRY_ATTEMPTS))?,
            base_delay: Duration::from_millis(layer.retry_base_delay_ms.unwrap_or(batching::RETRY_BASE_DELAY_MS)),
            max_delay: Duration::from_millis(layer.retry_max_delay_ms.unwrap_or(batching::RETRY_MAX_DELAY_MS)),
            exponential: true,
        };

        let artifacts_dir = layer
            .artifacts_dir
            .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("btc-settle"));

        Ok(SettleConfig {
            network,
            wallet_name,
            key_material,
            expected_address: layer.expected_address,
            rpc,
            funding,
            generation,
            broadcast,
            retry,
            artifacts_dir,
        })
    }

    pub fn wallet_handle(&self) -> crate::wallet::WalletHandle {
        let handle = crate::wallet::WalletHandle::new(self.wallet_name.clone(), self.network);
        match &self.key_material {
            Some(key) => handle.with_key_material(key.clone()),
            None => handle,
        }
    }
}
