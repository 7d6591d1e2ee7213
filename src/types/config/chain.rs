use alloy::primitives::Address;
use serde::Deserialize;

/// One chain to index.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    /// Environment variable holding the JSON-RPC endpoint URL.
    pub rpc_url_env_var: String,
    #[serde(default)]
    pub start_block: u64,
    /// Upper bound on the number of blocks per `getLogs` window.
    #[serde(default = "default_max_block_interval")]
    pub max_block_interval: u64,
    pub contracts: Vec<ContractConfig>,
}

fn default_max_block_interval() -> u64 {
    2000
}

/// A named contract surface: the events it emits and the addresses it lives
/// at. Contract types with no static address are fetch targets only once a
/// handler registers an address for them.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    pub name: String,
    #[serde(default)]
    pub address: AddressOrAddresses,
    /// Event signatures in human-readable form.
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AddressOrAddresses {
    Single(Address),
    Multiple(Vec<Address>),
}

impl Default for AddressOrAddresses {
    fn default() -> Self {
        AddressOrAddresses::Multiple(Vec::new())
    }
}

impl AddressOrAddresses {
    pub fn iter(&self) -> impl Iterator<Item = Address> + '_ {
        match self {
            AddressOrAddresses::Single(addr) => std::slice::from_ref(addr).iter().copied(),
            AddressOrAddresses::Multiple(addrs) => addrs.iter().copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_or_multiple_addresses() {
        let single: ContractConfig = serde_json::from_str(
            r#"{"name": "Gravity", "address": "0x2e645469f354bb4f5c8a05b3b30a929361cf77ec", "events": []}"#,
        )
        .unwrap();
        assert_eq!(single.address.iter().count(), 1);

        let multiple: ContractConfig = serde_json::from_str(
            r#"{"name": "Pool", "address": ["0x2e645469f354bb4f5c8a05b3b30a929361cf77ec", "0x1111111111111111111111111111111111111111"], "events": []}"#,
        )
        .unwrap();
        assert_eq!(multiple.address.iter().count(), 2);
    }

    #[test]
    fn test_address_defaults_to_empty() {
        let config: ContractConfig =
            serde_json::from_str(r#"{"name": "Nft", "events": []}"#).unwrap();
        assert_eq!(config.address.iter().count(), 0);
    }

    #[test]
    fn test_chain_defaults() {
        let chain: ChainConfig = serde_json::from_str(
            r#"{"name": "mainnet", "chain_id": 1, "rpc_url_env_var": "MAINNET_RPC_URL", "contracts": []}"#,
        )
        .unwrap();
        assert_eq!(chain.start_block, 0);
        assert_eq!(chain.max_block_interval, 2000);
    }
}
