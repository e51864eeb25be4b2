//! settle CLI - address generation, funding runs and wallet checks
//!
//!   settle addresses [--count N] [--derivation-mode --start-index I] [--output FILE] [--fund]
//!   settle fund [--addresses FILE | --targets FILE] [--amount BTC] [--batch-size N]
//!   settle reconcile                 → funding wallet state after reconciliation
//!   settle balance                   → spendable balance of the funding wallet
//!
//! Configuration: `--config FILE` (flat or sectioned JSON), overridden by flags.
//! RPC credentials fall back to BITCOIN_RPC_URL / BITCOIN_RPC_USER / BITCOIN_RPC_PASS.
//!
//! Output: JSON on stdout (pretty on a TTY or with --pretty). Errors are
//! `{"error": ..}` on stderr with exit code 1; `fund` exits 2 on a fatal run.

use anyhow::{anyhow, bail, Context};
use btc_settle::addresses;
use btc_settle::artifacts::{ArtifactRecord, ArtifactStore, JsonArtifactStore};
use btc_settle::core::format_btc_amount;
use btc_settle::logging::init_logging;
use btc_settle::runtime::install_signal_handlers;
use btc_settle::{
    ConfigLayer, FundingReconciler, FundingRun, GeneratedAddress, PaymentTarget, RpcGateway, SettleConfig,
    WalletGateway,
};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "settle", version, about = "Fund Bitcoin test addresses from a node-managed wallet")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// bitcoin, testnet, signet or regtest
    #[arg(long, global = true)]
    network: Option<String>,

    /// Permit operations on mainnet
    #[arg(long, global = true, default_value_t = false)]
    allow_mainnet: bool,

    #[arg(long, global = true)]
    wallet_name: Option<String>,

    /// Funding address the wallet is expected to control
    #[arg(long, global = true)]
    expected_address: Option<String>,

    /// Funding key as WIF or hex
    #[arg(long, global = true)]
    private_key: Option<String>,

    /// Funding BIP39 mnemonic (also the seed for --derivation-mode)
    #[arg(long, global = true)]
    mnemonic: Option<String>,

    /// File holding a private key or a mnemonic
    #[arg(long, global = true)]
    key_file: Option<PathBuf>,

    #[arg(long, global = true, env = "BITCOIN_RPC_URL")]
    rpc_url: Option<String>,

    #[arg(long, global = true, env = "BITCOIN_RPC_USER")]
    rpc_user: Option<String>,

    #[arg(long, global = true, env = "BITCOIN_RPC_PASS", hide_env_values = true)]
    rpc_pass: Option<String>,

    /// Directory for JSON-lines run artifacts
    #[arg(long, global = true)]
    artifacts_dir: Option<PathBuf>,

    #[arg(long, global = true, default_value_t = false)]
    pretty: bool,

    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
}

#[derive(Args)]
struct FundArgs {
    /// Amount per address in BTC
    #[arg(long)]
    amount: Option<f64>,

    /// Fee ceiling per transaction in BTC
    #[arg(long)]
    max_fee: Option<f64>,

    /// Fee rate in sat/vB
    #[arg(long)]
    fee_rate: Option<u64>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    batch_delay_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Generate addresses, save them and record them as artifacts
    Addresses {
        #[arg(long)]
        count: Option<u32>,

        /// Derive from the mnemonic instead of random keys
        #[arg(long, default_value_t = false)]
        derivation_mode: bool,

        #[arg(long)]
        start_index: Option<u32>,

        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Fund the generated addresses right away
        #[arg(long, default_value_t = false)]
        fund: bool,

        #[command(flatten)]
        funding: FundArgs,
    },
    /// Pay every address in a file from the funding wallet
    Fund {
        /// Addresses file written by `settle addresses`
        #[arg(long, conflicts_with = "targets")]
        addresses: Option<PathBuf>,

        /// JSON array of {address, amount (sat), reference}
        #[arg(long)]
        targets: Option<PathBuf>,

        #[command(flatten)]
        funding: FundArgs,
    },
    /// Reconcile the funding wallet and report its state
    Reconcile,
    /// Report the funding wallet's balance
    Balance,
}

struct Outcome {
    output: Value,
    exit_code: i32,
}

impl From<Value> for Outcome {
    fn from(output: Value) -> Self {
        Self { output, exit_code: 0 }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.global.verbose);
    #[cfg(feature = "electrum")]
    let _ = rustls::crypto::ring::default_provider().install_default();

    let pretty = cli.global.pretty || std::io::stdout().is_terminal();
    let render = |value: &Value| {
        let text = if pretty { serde_json::to_string_pretty(value) } else { serde_json::to_string(value) };
        text.unwrap_or_else(|_| value.to_string())
    };

    match dispatch(cli).await {
        Ok(outcome) => {
            println!("{}", render(&outcome.output));
            if outcome.exit_code != 0 {
                std::process::exit(outcome.exit_code);
            }
        }
        Err(e) => {
            eprintln!("{}", render(&json!({ "error": format!("{:#}", e) })));
            std::process::exit(1);
        }
    }
}

fn overrides(global: &GlobalArgs, command: &Command) -> ConfigLayer {
    let mut layer = ConfigLayer {
        network: global.network.clone(),
        wallet_name: global.wallet_name.clone(),
        expected_address: global.expected_address.clone(),
        private_key: global.private_key.clone(),
        mnemonic: global.mnemonic.clone(),
        key_file: global.key_file.clone(),
        rpc_url: global.rpc_url.clone(),
        rpc_user: global.rpc_user.clone(),
        rpc_pass: global.rpc_pass.clone(),
        artifacts_dir: global.artifacts_dir.clone(),
        ..Default::default()
    };

    let funding = match command {
        Command::Addresses { count, derivation_mode, start_index, output, funding, .. } => {
            layer.count = *count;
            layer.derivation_mode = derivation_mode.then_some(true);
            layer.start_index = *start_index;
            layer.output = output.clone();
            Some(funding)
        }
        Command::Fund { funding, .. } => Some(funding),
        Command::Reconcile | Command::Balance => None,
    };
    if let Some(funding) = funding {
        layer.amount = funding.amount;
        layer.max_fee = funding.max_fee;
        layer.fee_rate = funding.fee_rate;
        layer.batch_size = funding.batch_size;
        layer.batch_delay_ms = funding.batch_delay_ms;
    }
    layer
}

async fn dispatch(cli: Cli) -> anyhow::Result<Outcome> {
    let file = match &cli.global.config {
        Some(path) => ConfigLayer::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => ConfigLayer::default(),
    };
    let config = SettleConfig::resolve(overrides(&cli.global, &cli.command), file)?;
    if config.network.is_mainnet() && !cli.global.allow_mainnet {
        bail!("refusing to operate on mainnet without --allow-mainnet");
    }
    debug!(network = %config.network, wallet = %config.wallet_name, rpc = %config.rpc.url, "Configuration resolved");

    let store: Arc<dyn ArtifactStore> = Arc::new(JsonArtifactStore::new(&config.artifacts_dir));

    match cli.command {
        Command::Addresses { fund, .. } => {
            let generated = generate(&config, store.as_ref())?;
            if !fund {
                return Ok(json!({
                    "count": generated.len(),
                    "output": config.generation.output.display().to_string(),
                    "addresses": generated.iter().map(|a| &a.address).collect::<Vec<_>>(),
                })
                .into());
            }
            let targets = generated.iter().map(|a| target_for(a, &config)).collect::<Vec<_>>();
            fund_targets(&config, store, targets).await
        }
        Command::Fund { addresses, targets, .. } => {
            let targets = match (addresses, targets) {
                (_, Some(path)) => load_targets(&path)?,
                (Some(path), None) => from_addresses(&path, &config)?,
                (None, None) => from_addresses(&config.generation.output, &config)?,
            };
            fund_targets(&config, store, targets).await
        }
        Command::Reconcile => {
            let gateway: Arc<dyn WalletGateway> = Arc::new(RpcGateway::new(config.rpc.clone()));
            let reconciler = FundingReconciler::new(gateway).with_retry(config.retry);
            let wallet = config.wallet_handle();
            let expected = reconciler.expected_address(&wallet, config.expected_address.as_deref()).await?;
            let state = reconciler.reconcile(&wallet, &expected).await?;
            Ok(json!({
                "state": state,
                "consistent": state.is_consistent(),
                "balance_btc": format_btc_amount(state.balance.to_sat()),
            })
            .into())
        }
        Command::Balance => {
            let gateway = RpcGateway::new(config.rpc.clone());
            let wallet = config.wallet_handle();
            gateway.create_or_load_wallet(&wallet).await?;
            let balance = gateway.balance(&wallet).await?;
            Ok(json!({
                "wallet": wallet.name,
                "network": config.network.as_str(),
                "balance_sat": balance.to_sat(),
                "balance_btc": format_btc_amount(balance.to_sat()),
            })
            .into())
        }
    }
}

fn generate(config: &SettleConfig, store: &dyn ArtifactStore) -> anyhow::Result<Vec<GeneratedAddress>> {
    let generation = &config.generation;
    let generated = if generation.derivation_mode {
        let phrase = config
            .key_material
            .as_ref()
            .and_then(|k| k.phrase())
            .ok_or_else(|| anyhow!("--derivation-mode needs a mnemonic"))?;
        addresses::derive_from_mnemonic(phrase, config.network, generation.start_index, generation.count)?
    } else {
        addresses::generate_random(generation.count, config.network)?
    };

    addresses::save_to_file(&generation.output, &generated)?;
    for address in &generated {
        if let Err(e) = store.write_record(&ArtifactRecord::Address(address.without_secrets())) {
            warn!(error = %e, "Could not record generated address");
            break;
        }
    }
    Ok(generated)
}

fn target_for(address: &GeneratedAddress, config: &SettleConfig) -> PaymentTarget {
    PaymentTarget { amount: config.funding.amount, ..PaymentTarget::from(address) }
}

fn from_addresses(path: &Path, config: &SettleConfig) -> anyhow::Result<Vec<PaymentTarget>> {
    let generated = addresses::load_from_file(path)?;
    Ok(generated.iter().map(|a| target_for(a, config)).collect())
}

fn load_targets(path: &Path) -> anyhow::Result<Vec<PaymentTarget>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing targets in {}", path.display()))
}

async fn fund_targets(
    config: &SettleConfig,
    store: Arc<dyn ArtifactStore>,
    targets: Vec<PaymentTarget>,
) -> anyhow::Result<Outcome> {
    if !config.funding.enabled {
        bail!("funding is disabled by configuration (no_funding)");
    }
    if targets.is_empty() {
        bail!("no payment targets");
    }

    let gateway: Arc<dyn WalletGateway> = Arc::new(RpcGateway::new(config.rpc.clone()));
    let run = FundingRun::from_config(config, gateway, store)?.with_shutdown(install_signal_handlers());
    let wallet = config.wallet_handle();
    let funding_address = run
        .reconciler()
        .expected_address(&wallet, config.expected_address.as_deref())
        .await?;

    info!(targets = targets.len(), address = %funding_address, "Starting funding run");
    let summary = run.run(&wallet, &funding_address, &targets).await;
    Ok(Outcome { exit_code: summary.exit_code(), output: serde_json::to_value(&summary)? })
}
