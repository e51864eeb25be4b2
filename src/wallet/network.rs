use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Bitcoin,
    #[default]
    Testnet,
    Signet,
    Regtest,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self { Network::Bitcoin => "bitcoin", Network::Testnet => "testnet", Network::Signet => "signet", Network::Regtest => "regtest" }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bitcoin" | "mainnet" | "main" => Some(Network::Bitcoin),
            "testnet" | "test" | "testnet3" => Some(Network::Testnet),
            "signet" => Some(Network::Signet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }

    pub fn to_bitcoin(&self) -> bitcoin::Network {
        match self { Network::Bitcoin => bitcoin::Network::Bitcoin, Network::Testnet => bitcoin::Network::Testnet, Network::Signet => bitcoin::Network::Signet, Network::Regtest => bitcoin::Network::Regtest }
    }

    /// BIP44 coin type: 0 on mainnet, 1 everywhere else.
    pub fn coin_type(&self) -> u32 {
        match self { Network::Bitcoin => 0, _ => 1 }
    }

    pub fn is_mainnet(&self) -> bool {
        matches!(self, Network::Bitcoin)
    }

    /// Public Esplora REST bases used as broadcast fallbacks.
    pub fn default_esplora_urls(&self) -> &'static [&'static str] {
        match self {
            Network::Bitcoin => &["https://blockstream.info/api", "https://mempool.space/api"],
            Network::Testnet => &["https://blockstream.info/testnet/api", "https://mempool.space/testnet/api"],
            Network::Signet => &["https://mempool.space/signet/api"],
            Network::Regtest => &[],
        }
    }

    /// Public BlockCypher API base, tried after the Esplora endpoints.
    pub fn default_blockcypher_url(&self) -> Option<&'static str> {
        match self {
            Network::Testnet => Some("https://api.blockcypher.com/v1/btc/test3"),
            _ => None,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
