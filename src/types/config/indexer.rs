use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context};
use serde::Deserialize;

use super::chain::ChainConfig;
use super::entity::EntityConfig;
use super::sync::SyncConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default = "default_database_url_env_var")]
    pub database_url_env_var: String,
}

fn default_database_url_env_var() -> String {
    "DATABASE_URL".to_string()
}

impl IndexerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        let config: IndexerConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.chains.is_empty() {
            bail!("config declares no chains");
        }

        let mut chain_ids = HashSet::new();
        for chain in &self.chains {
            if !chain_ids.insert(chain.chain_id) {
                bail!("duplicate chain id {}", chain.chain_id);
            }
            if chain.max_block_interval == 0 {
                bail!("chain {}: max_block_interval must be positive", chain.name);
            }
            let mut contract_names = HashSet::new();
            for contract in &chain.contracts {
                if !contract_names.insert(contract.name.as_str()) {
                    bail!(
                        "chain {}: duplicate contract type {}",
                        chain.name,
                        contract.name
                    );
                }
            }
        }

        let mut entity_names = HashSet::new();
        for entity in &self.entities {
            if !entity_names.insert(entity.name.as_str()) {
                bail!("duplicate entity type {}", entity.name);
            }
        }
        for entity in &self.entities {
            for field in entity.reference_fields() {
                let target = field.references.as_deref().unwrap_or_default();
                if !entity_names.contains(target) {
                    bail!(
                        "entity {}: field {} references unknown entity {}",
                        entity.name,
                        field.name,
                        target
                    );
                }
            }
        }

        if self.sync.batch_min > self.sync.batch_max {
            bail!("sync.batch_min exceeds sync.batch_max");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> serde_json::Value {
        serde_json::json!({
            "chains": [{
                "name": "mainnet",
                "chain_id": 1,
                "rpc_url_env_var": "MAINNET_RPC_URL",
                "contracts": [{
                    "name": "Gravity",
                    "address": "0x2e645469f354bb4f5c8a05b3b30a929361cf77ec",
                    "events": ["NewGravatar(uint256 id, address owner, string displayName, string imageUrl)"]
                }]
            }],
            "entities": [
                {"name": "Gravatar", "fields": [{"name": "owner", "references": "Account"}]},
                {"name": "Account"}
            ]
        })
    }

    #[test]
    fn test_valid_config_parses() {
        let config: IndexerConfig = serde_json::from_value(base_config()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.chains.len(), 1);
        assert_eq!(config.database_url_env_var, "DATABASE_URL");
    }

    #[test]
    fn test_duplicate_chain_id_rejected() {
        let mut raw = base_config();
        let chain = raw["chains"][0].clone();
        raw["chains"].as_array_mut().unwrap().push(chain);
        let config: IndexerConfig = serde_json::from_value(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let mut raw = base_config();
        raw["entities"][0]["fields"][0]["references"] = serde_json::json!("Missing");
        let config: IndexerConfig = serde_json::from_value(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
