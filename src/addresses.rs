//! Address generation for payment targets.
//!
//! Random keypairs for throwaway test recipients, or BIP84 derivation from a
//! mnemonic when the recipients must be recoverable.

use crate::core::GeneratedAddress;
use crate::wallet::{derive_bip84_key, KeyError, Network, SigningKey};
use bitcoin::PrivateKey;
use std::path::Path;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("Derivation index overflow at start {start} + count {count}")]
    IndexOverflow { start: u32, count: u32 },
    #[error("Address file {path}: {reason}")]
    Io { path: String, reason: String },
}

fn generated(index: u32, key: &SigningKey, network: Network) -> GeneratedAddress {
    GeneratedAddress {
        index,
        address: key.address.to_string(),
        public_key: key.public_key_hex(),
        private_key: Some(key.secret_hex().to_string()),
        wif: Some(key.wif().to_string()),
        network: network.as_str().to_string(),
    }
}

/// `count` fresh P2WPKH keypairs, indexed from 1.
pub fn generate_random(count: u32, network: Network) -> Result<Vec<GeneratedAddress>, AddressError> {
    let addresses = (1..=count)
        .map(|index| {
            let key = SigningKey::from_private_key(PrivateKey::generate(network.to_bitcoin()), network)?;
            Ok(generated(index, &key, network))
        })
        .collect::<Result<Vec<_>, AddressError>>()?;
    info!(count, %network, "Generated random addresses");
    Ok(addresses)
}

/// `count` addresses on the BIP84 external chain, starting at `start`.
pub fn derive_from_mnemonic(
    mnemonic: &str,
    network: Network,
    start: u32,
    count: u32,
) -> Result<Vec<GeneratedAddress>, AddressError> {
    let end = start.checked_add(count).ok_or(AddressError::IndexOverflow { start, count })?;
    let addresses = (start..end)
        .map(|index| Ok(generated(index, &derive_bip84_key(mnemonic, network, index)?, network)))
        .collect::<Result<Vec<_>, AddressError>>()?;
    info!(start, count, %network, "Derived addresses from mnemonic");
    Ok(addresses)
}

/// Write `addresses` as a pretty-printed JSON array.
pub fn save_to_file(path: &Path, addresses: &[GeneratedAddress]) -> Result<(), AddressError> {
    let write_err = |reason: String| AddressError::Io { path: path.display().to_string(), reason };
    let json = serde_json::to_string_pretty(addresses).map_err(|e| write_err(e.to_string()))?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
    }
    std::fs::write(path, json).map_err(|e| write_err(e.to_string()))?;
    info!(path = %path.display(), count = addresses.len(), "Saved addresses");
    Ok(())
}

/// Read addresses written by [`save_to_file`].
pub fn load_from_file(path: &Path) -> Result<Vec<GeneratedAddress>, AddressError> {
    let read_err = |reason: String| AddressError::Io { path: path.display().to_string(), reason };
    let text = std::fs::read_to_string(path).map_err(|e| read_err(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| read_err(e.to_string()))
}
