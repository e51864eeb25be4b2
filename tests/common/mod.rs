//! Test doubles: an in-memory wallet gateway and scripted broadcast channels.

#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::consensus::{deserialize, serialize};
use bitcoin::hashes::Hash;
use bitcoin::{Address, Amount, Transaction, Txid, Witness};
use btc_settle::broadcast::{BroadcastChannel, ChannelError};
use btc_settle::core::Utxo;
use btc_settle::wallet::{derive_bip84_key, GatewayError, KeyMaterial, Network, SigningKey, WalletGateway, WalletHandle};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// Well-known test mnemonic, never use with real funds
pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

static TRACING: Lazy<()> = Lazy::new(|| btc_settle::logging::init_logging(false));

pub fn init_tracing() {
    Lazy::force(&TRACING);
}

pub fn key(index: u32) -> SigningKey {
    derive_bip84_key(TEST_MNEMONIC, Network::Regtest, index).expect("derive")
}

pub fn address(index: u32) -> String {
    key(index).address.to_string()
}

/// Funding wallet handle whose key material derives `address(0)`.
pub fn funding_wallet() -> WalletHandle {
    WalletHandle::new("wallet_0", Network::Regtest).with_key_material(KeyMaterial::mnemonic(TEST_MNEMONIC))
}

pub fn fake_txid(n: u8) -> Txid {
    Txid::from_byte_array([n; 32])
}

pub fn utxo(n: u8, vout: u32, sat: u64) -> Utxo {
    Utxo { txid: fake_txid(n), vout, amount: Amount::from_sat(sat), confirmations: 6 }
}

#[derive(Default)]
struct ChainState {
    /// Unspent outputs per address
    chain: HashMap<String, Vec<Utxo>>,
    /// Address the wallet currently reports as its funding address
    receiving: Option<String>,
    known: HashSet<Txid>,
    submitted: Vec<Txid>,
    loads: usize,
    imports: usize,
    list_failures: usize,
    submit_error: Option<GatewayError>,
}

/// In-memory stand-in for a node wallet.
///
/// The wallet owns whatever is on chain at its receiving address, so swapping
/// the address through `import_key` changes the balance it reports.
pub struct MockGateway {
    state: Mutex<ChainState>,
}

impl MockGateway {
    pub fn new(receiving: Option<&str>) -> Arc<Self> {
        let state = ChainState { receiving: receiving.map(str::to_string), ..Default::default() };
        Arc::new(Self { state: Mutex::new(state) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn fund(&self, address: &str, utxos: Vec<Utxo>) {
        self.lock().chain.entry(address.to_string()).or_default().extend(utxos);
    }

    pub fn set_receiving(&self, address: Option<&str>) {
        self.lock().receiving = address.map(str::to_string);
    }

    pub fn fail_list_unspent(&self, times: usize) {
        self.lock().list_failures = times;
    }

    pub fn fail_submit(&self, error: GatewayError) {
        self.lock().submit_error = Some(error);
    }

    /// Make `txid` visible to `has_transaction`.
    pub fn observe(&self, txid: Txid) {
        self.lock().known.insert(txid);
    }

    /// Apply `raw` to the chain: spend its inputs, credit its outputs.
    pub fn accept_raw(&self, raw: &[u8]) -> Option<Txid> {
        let tx: Transaction = deserialize(raw).ok()?;
        let txid = tx.compute_txid();
        let mut state = self.lock();
        let spent: HashSet<_> = tx.input.iter().map(|i| i.previous_output).collect();
        for utxos in state.chain.values_mut() {
            utxos.retain(|u| !spent.contains(&u.outpoint()));
        }
        for (vout, out) in tx.output.iter().enumerate() {
            if let Ok(address) = Address::from_script(&out.script_pubkey, bitcoin::Network::Regtest) {
                let utxo = Utxo { txid, vout: vout as u32, amount: out.value, confirmations: 0 };
                state.chain.entry(address.to_string()).or_default().push(utxo);
            }
        }
        state.known.insert(txid);
        state.submitted.push(txid);
        Some(txid)
    }

    pub fn imports(&self) -> usize {
        self.lock().imports
    }

    pub fn loads(&self) -> usize {
        self.lock().loads
    }

    pub fn submitted(&self) -> Vec<Txid> {
        self.lock().submitted.clone()
    }

    pub fn balance_of(&self, address: &str) -> Amount {
        self.lock().chain.get(address).map(|u| u.iter().map(|u| u.amount).sum()).unwrap_or(Amount::ZERO)
    }

    fn owned(&self) -> Vec<Utxo> {
        let state = self.lock();
        state.receiving.as_ref().and_then(|a| state.chain.get(a)).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl WalletGateway for MockGateway {
    async fn create_or_load_wallet(&self, _wallet: &WalletHandle) -> Result<(), GatewayError> {
        self.lock().loads += 1;
        Ok(())
    }

    async fn import_key(&self, _wallet: &WalletHandle, key: &SigningKey) -> Result<String, GatewayError> {
        let address = key.address.to_string();
        let mut state = self.lock();
        state.imports += 1;
        state.receiving = Some(address.clone());
        Ok(address)
    }

    async fn receiving_address(&self, _wallet: &WalletHandle) -> Result<Option<String>, GatewayError> {
        Ok(self.lock().receiving.clone())
    }

    async fn balance(&self, _wallet: &WalletHandle) -> Result<Amount, GatewayError> {
        Ok(self.owned().iter().map(|u| u.amount).sum())
    }

    async fn list_unspent(&self, _wallet: &WalletHandle) -> Result<Vec<Utxo>, GatewayError> {
        {
            let mut state = self.lock();
            if state.list_failures > 0 {
                state.list_failures -= 1;
                return Err(GatewayError::Transient("connection refused".into()));
            }
        }
        Ok(self.owned())
    }

    async fn sign(&self, _wallet: &WalletHandle, unsigned: &Transaction) -> Result<Vec<u8>, GatewayError> {
        let mut signed = unsigned.clone();
        for input in &mut signed.input {
            input.witness = Witness::from_slice(&[vec![0x30; 71], vec![0x02; 33]]);
        }
        Ok(serialize(&signed))
    }

    async fn submit(&self, _wallet: &WalletHandle, raw: &[u8]) -> Result<Txid, GatewayError> {
        if let Some(error) = self.lock().submit_error.clone() {
            return Err(error);
        }
        self.accept_raw(raw).ok_or_else(|| GatewayError::Rejected("TX decode failed".into()))
    }

    async fn has_transaction(&self, _wallet: &WalletHandle, txid: &Txid) -> Result<bool, GatewayError> {
        Ok(self.lock().known.contains(txid))
    }
}

/// What a scripted channel does with a submission.
#[derive(Clone)]
pub enum Script {
    /// Accept and make the transaction visible to the wallet
    Accept,
    /// Accept but never propagate
    Blackhole,
    /// Accept without propagating, and the wallet comes back reporting this address
    Drift(String),
    Fail(ChannelError),
}

pub struct ScriptedChannel {
    name: String,
    gateway: Option<Arc<MockGateway>>,
    script: Mutex<VecDeque<Script>>,
    fallback: Script,
    calls: AtomicUsize,
}

impl ScriptedChannel {
    pub fn new(name: &str, fallback: Script) -> Self {
        Self { name: name.to_string(), gateway: None, script: Mutex::new(VecDeque::new()), fallback, calls: AtomicUsize::new(0) }
    }

    /// Accepted transactions are applied to `gateway`'s chain.
    pub fn propagating_to(mut self, gateway: Arc<MockGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Outcomes to play before falling back to the default.
    pub fn then(self, step: Script) -> Self {
        self.script.lock().unwrap_or_else(|p| p.into_inner()).push_back(step);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BroadcastChannel for ScriptedChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, raw: &[u8]) -> Result<Option<String>, ChannelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap_or_else(|p| p.into_inner()).pop_front().unwrap_or_else(|| self.fallback.clone());
        match step {
            Script::Accept => {
                let txid = self.gateway.as_ref().and_then(|g| g.accept_raw(raw));
                Ok(txid.map(|t| t.to_string()))
            }
            Script::Blackhole => Ok(None),
            Script::Drift(address) => {
                if let Some(gateway) = &self.gateway {
                    gateway.set_receiving(Some(&address));
                }
                Ok(None)
            }
            Script::Fail(error) => Err(error),
        }
    }
}
