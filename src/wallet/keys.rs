//! Funding key material: private keys, BIP39 mnemonics and key files.
//!
//! Mnemonics resolve to the first BIP84 external key (`m/84'/coin'/0'/0/0`),
//! which is imported into the node wallet as a single-key `wpkh` descriptor.

use super::Network;
use bip39::Mnemonic;
use bitcoin::bip32::{DerivationPath, Xpriv};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, CompressedPublicKey, PrivateKey};
use std::path::Path;
use std::str::FromStr;
use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("Key is for {found}, wallet is on {expected}")]
    WrongNetwork { expected: String, found: String },
    #[error("Derivation failed: {0}")]
    DerivationFailed(String),
    #[error("Key file {path}: {reason}")]
    KeyFile { path: String, reason: String },
}

/// Secret that can recreate the funding wallet. Contents are wiped on drop.
#[derive(Clone)]
pub enum KeyMaterial {
    /// WIF or 32-byte hex private key
    PrivateKey(Zeroizing<String>),
    /// BIP39 mnemonic phrase
    Mnemonic(Zeroizing<String>),
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMaterial::PrivateKey(_) => f.write_str("KeyMaterial::PrivateKey(<redacted>)"),
            KeyMaterial::Mnemonic(_) => f.write_str("KeyMaterial::Mnemonic(<redacted>)"),
        }
    }
}

impl KeyMaterial {
    pub fn private_key(value: impl Into<String>) -> Self {
        KeyMaterial::PrivateKey(Zeroizing::new(value.into().trim().to_string()))
    }

    pub fn mnemonic(value: impl Into<String>) -> Self {
        let normalized = value.into().split_whitespace().collect::<Vec<_>>().join(" ");
        KeyMaterial::Mnemonic(Zeroizing::new(normalized))
    }

    /// Read a key file: more than one word is a mnemonic, otherwise a private key.
    pub fn from_key_file(path: &Path) -> Result<Self, KeyError> {
        let content = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| KeyError::KeyFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?);
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(KeyError::KeyFile { path: path.display().to_string(), reason: "file is empty".into() });
        }
        if trimmed.split_whitespace().count() > 1 {
            Ok(KeyMaterial::mnemonic(trimmed))
        } else {
            Ok(KeyMaterial::private_key(trimmed))
        }
    }

    /// The phrase, when this is a mnemonic.
    pub fn phrase(&self) -> Option<&str> {
        match self {
            KeyMaterial::Mnemonic(phrase) => Some(phrase.as_str()),
            KeyMaterial::PrivateKey(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            KeyMaterial::PrivateKey(_) => "private_key",
            KeyMaterial::Mnemonic(_) => "mnemonic",
        }
    }

    /// Resolve to the single signing key used for funding on `network`.
    pub fn signing_key(&self, network: Network) -> Result<SigningKey, KeyError> {
        match self {
            KeyMaterial::PrivateKey(value) => SigningKey::from_private_key_str(value, network),
            KeyMaterial::Mnemonic(phrase) => derive_bip84_key(phrase, network, 0),
        }
    }
}

/// A resolved P2WPKH key with its address.
#[derive(Clone)]
pub struct SigningKey {
    pub private_key: PrivateKey,
    pub public_key: CompressedPublicKey,
    pub address: Address,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").field("address", &self.address.to_string()).finish_non_exhaustive()
    }
}

impl SigningKey {
    pub fn from_private_key(private_key: PrivateKey, network: Network) -> Result<Self, KeyError> {
        let secp = Secp256k1::signing_only();
        let public_key = CompressedPublicKey::from_private_key(&secp, &private_key)
            .map_err(|e| KeyError::InvalidPrivateKey(e.to_string()))?;
        let address = Address::p2wpkh(&public_key, network.to_bitcoin());
        Ok(Self { private_key, public_key, address })
    }

    fn from_private_key_str(value: &str, network: Network) -> Result<Self, KeyError> {
        if let Ok(pk) = PrivateKey::from_wif(value) {
            let expected = bitcoin::NetworkKind::from(network.to_bitcoin());
            if pk.network != expected {
                let found = if pk.network.is_mainnet() { "mainnet" } else { "test networks" };
                return Err(KeyError::WrongNetwork { expected: network.to_string(), found: found.into() });
            }
            return Self::from_private_key(pk, network);
        }

        let bytes = Zeroizing::new(
            hex::decode(value).map_err(|_| KeyError::InvalidPrivateKey("neither WIF nor hex".into()))?,
        );
        let secret = SecretKey::from_slice(&bytes).map_err(|e| KeyError::InvalidPrivateKey(e.to_string()))?;
        Self::from_private_key(PrivateKey::new(secret, network.to_bitcoin()), network)
    }

    pub fn wif(&self) -> Zeroizing<String> {
        Zeroizing::new(self.private_key.to_wif())
    }

    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.private_key.inner.secret_bytes()))
    }

    pub fn public_key_hex(&self) -> String {
        self.public_key.to_string()
    }
}

/// Derive the key at `m/84'/coin'/0'/0/index` from a BIP39 phrase.
pub fn derive_bip84_key(phrase: &str, network: Network, index: u32) -> Result<SigningKey, KeyError> {
    let mnemonic = Mnemonic::parse_normalized(phrase).map_err(|e| KeyError::InvalidMnemonic(e.to_string()))?;
    let seed = Zeroizing::new(mnemonic.to_seed(""));

    let secp = Secp256k1::new();
    let master = Xpriv::new_master(network.to_bitcoin(), &seed[..])
        .map_err(|e| KeyError::DerivationFailed(e.to_string()))?;

    let path_str = format!("m/84'/{}'/0'/0/{}", network.coin_type(), index);
    let path = DerivationPath::from_str(&path_str).map_err(|e| KeyError::DerivationFailed(e.to_string()))?;
    let child = master.derive_priv(&secp, &path).map_err(|e| KeyError::DerivationFailed(e.to_string()))?;

    SigningKey::from_private_key(PrivateKey::new(child.private_key, network.to_bitcoin()), network)
}
