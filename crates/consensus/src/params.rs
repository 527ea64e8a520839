#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "test",
            Network::Regtest => "regtest",
        }
    }
}

pub fn network_from_name(name: &str) -> Option<Network> {
    match name.trim().to_ascii_lowercase().as_str() {
        "main" | "mainnet" => Some(Network::Mainnet),
        "test" | "testnet" => Some(Network::Testnet),
        "regtest" => Some(Network::Regtest),
        _ => None,
    }
}

/// Version bytes used by base58check encodings on one network.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Base58Prefixes {
    pub pubkey_address: &'static [u8],
    pub script_address: &'static [u8],
    pub secret_key: u8,
    pub ext_public_key: [u8; 4],
    pub ext_secret_key: [u8; 4],
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub base58: Base58Prefixes,
    pub default_port: u16,
    /// Name of the client written into wallet dump headers.
    pub client_name: &'static str,
}

const MAINNET_BASE58: Base58Prefixes = Base58Prefixes {
    pubkey_address: &[0x1C, 0xB8],
    script_address: &[0x1C, 0xBD],
    secret_key: 0x80,
    ext_public_key: [0x04, 0x88, 0xB2, 0x1E],
    ext_secret_key: [0x04, 0x88, 0xAD, 0xE4],
};

const TESTNET_BASE58: Base58Prefixes = Base58Prefixes {
    pubkey_address: &[0x1D, 0x25],
    script_address: &[0x1C, 0xBA],
    secret_key: 0xEF,
    ext_public_key: [0x04, 0x35, 0x87, 0xCF],
    ext_secret_key: [0x04, 0x35, 0x83, 0x94],
};

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            base58: MAINNET_BASE58,
            default_port: 16125,
            client_name: "fluxd-rust",
        },
        Network::Testnet => ChainParams {
            network,
            base58: TESTNET_BASE58,
            default_port: 26125,
            client_name: "fluxd-rust",
        },
        Network::Regtest => ChainParams {
            network,
            base58: TESTNET_BASE58,
            default_port: 26126,
            client_name: "fluxd-rust",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testnet_and_regtest_share_encodings() {
        assert_eq!(
            chain_params(Network::Testnet).base58,
            chain_params(Network::Regtest).base58
        );
        assert_ne!(
            chain_params(Network::Mainnet).base58,
            chain_params(Network::Testnet).base58
        );
    }

    #[test]
    fn parse_network_names() {
        assert_eq!(network_from_name("main"), Some(Network::Mainnet));
        assert_eq!(network_from_name("TestNet"), Some(Network::Testnet));
        assert_eq!(network_from_name("regtest"), Some(Network::Regtest));
        assert_eq!(network_from_name("signet"), None);
    }
}
