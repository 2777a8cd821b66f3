//! Chain parameter definitions.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// Prefix prepended to every stream protocol identifier. Distinct per
    /// network so mainnet and testnet nodes never talk past each other.
    pub protocol_prefix: &'static str,
    pub default_port: u16,
    pub seed_addrs: &'static [&'static str],
    /// Unix timestamp baked into the genesis header.
    pub genesis_time: i64,
    /// Initial coin issuance carried by the genesis coinbase.
    pub genesis_coins: u64,
    /// Maximum tolerated clock skew for incoming block timestamps.
    pub max_future_block_secs: i64,
}

pub const CHAIN_SERVICE_PROTOCOL: &str = "chainservice";
pub const BLOCK_RELAY_PROTOCOL: &str = "blockrelay";

impl ChainParams {
    pub fn chain_service_protocol(&self) -> String {
        format!("{}{}", self.protocol_prefix, CHAIN_SERVICE_PROTOCOL)
    }

    pub fn block_relay_protocol(&self) -> String {
        format!("{}{}", self.protocol_prefix, BLOCK_RELAY_PROTOCOL)
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_chain_params(),
        Network::Testnet => testnet_chain_params(),
        Network::Regtest => regtest_chain_params(),
    }
}

fn mainnet_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        protocol_prefix: "/umbra/",
        default_port: 9901,
        seed_addrs: &["seed1.umbra.network:9901", "seed2.umbra.network:9901"],
        genesis_time: 1_686_874_710,
        genesis_coins: (1u64 << 60) / 5,
        max_future_block_secs: 2 * 60 * 60,
    }
}

fn testnet_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Testnet,
        protocol_prefix: "/umbra/testnet1/",
        default_port: 19901,
        seed_addrs: &["testseed.umbra.network:19901"],
        genesis_time: 1_689_004_800,
        genesis_coins: (1u64 << 60) / 5,
        max_future_block_secs: 2 * 60 * 60,
    }
}

fn regtest_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Regtest,
        protocol_prefix: "/umbra/regtest/",
        default_port: 29901,
        seed_addrs: &[],
        genesis_time: 1_600_000_000,
        genesis_coins: (1u64 << 60) / 5,
        max_future_block_secs: 2 * 60 * 60,
    }
}
